//! Core data model: repository snapshot, PR view, and the label taxonomy.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Collaborator permission grade, from the comprehensive repository query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Permission {
    Other,
    Write,
    Maintain,
    Admin,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Collaborator {
    pub login: String,
    pub permission: Permission,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenIssue {
    pub number: u64,
    pub title: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenPullRequest {
    pub number: u64,
    pub title: String,
}

/// Fetched once per delivery via a single GraphQL query; treated as
/// immutable for the lifetime of the delivery.
#[derive(Debug, Clone, Default)]
pub struct RepositorySnapshot {
    pub node_id: String,
    pub database_id: u64,
    pub collaborators: Vec<Collaborator>,
    pub mentionable_users: Vec<String>,
    pub open_issues: Vec<OpenIssue>,
    pub open_pull_requests: Vec<OpenPullRequest>,
}

impl RepositorySnapshot {
    pub fn maintainers(&self) -> impl Iterator<Item = &str> {
        self.collaborators
            .iter()
            .filter(|c| matches!(c.permission, Permission::Admin | Permission::Maintain))
            .map(|c| c.login.as_str())
    }

    pub fn is_contributor(&self, login: &str) -> bool {
        self.mentionable_users.iter().any(|u| u == login)
            || self.collaborators.iter().any(|c| c.login == login)
    }
}

/// Tri-state mergeability as reported by GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Mergeable {
    True,
    False,
    Unknown,
}

/// Reconstructed from the webhook payload when the event is `pull_request`
/// (avoids a round-trip); otherwise fetched via GraphQL. Labels are
/// mutated in place after each add/remove mutation using that mutation's
/// own response, never by re-fetching the whole PR.
#[derive(Debug, Clone)]
pub struct PullRequestView {
    pub node_id: String,
    pub number: u64,
    pub title: String,
    pub draft: bool,
    pub merged: bool,
    pub base_ref: String,
    pub head_ref: String,
    pub head_sha: String,
    pub head_owner: String,
    pub author_login: String,
    pub additions: u64,
    pub deletions: u64,
    pub mergeable: Mergeable,
    pub merge_commit_sha: Option<String>,
    pub labels: Vec<String>,
}

impl PullRequestView {
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(name))
    }

    pub fn size(&self) -> u64 {
        self.additions + self.deletions
    }

    /// Users currently recorded against the PR via any of the four
    /// review-state label prefixes, keyed by prefix.
    pub fn review_state_users(&self, prefix: &str) -> HashSet<String> {
        self.labels
            .iter()
            .filter_map(|l| l.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

/// The fixed set of static label names and their GitHub label colors
/// (hex, no leading `#`).
pub mod static_labels {
    pub const VERIFIED: (&str, &str) = ("verified", "0E8A16");
    pub const LGTM: (&str, &str) = ("lgtm", "0E8A16");
    pub const APPROVE: (&str, &str) = ("approve", "0E8A16");
    pub const AUTOMERGE: (&str, &str) = ("automerge", "1D76DB");
    pub const HOLD: (&str, &str) = ("hold", "B60205");
    pub const WIP: (&str, &str) = ("wip", "B60205");
    pub const CAN_BE_MERGED: (&str, &str) = ("can-be-merged", "0E8A16");
    pub const HAS_CONFLICTS: (&str, &str) = ("has-conflicts", "B60205");
    pub const NEEDS_REBASE: (&str, &str) = ("needs-rebase", "B60205");
    pub const AUTO_CHERRY_PICK: (&str, &str) = ("auto-cherry-pick", "F09C74");
    pub const CHERRY_PICKED: (&str, &str) = ("cherry-picked", "F09C74");

    pub const MAX_LABEL_LEN: usize = 49;
}

pub const DYNAMIC_PREFIXES: &[(&str, &str)] = &[
    ("approved-by-", "0E8A16"),
    ("lgtm-by-", "0E8A16"),
    ("changes-requested-by-", "B60205"),
    ("commented-by-", "bfd4f2"),
];

pub const BRANCH_PREFIX: &str = "branch-";
pub const CHERRY_PICK_PREFIX: &str = "cherry-pick/";

/// Default size thresholds: `additions + deletions` is mapped to the first
/// entry it falls strictly below.
pub const DEFAULT_SIZE_THRESHOLDS: &[(u64, &str, &str)] = &[
    (20, "XS", "ededed"),
    (50, "S", "0E8A16"),
    (100, "M", "F09C74"),
    (300, "L", "F5621C"),
    (500, "XL", "D93F0B"),
    (u64::MAX, "XXL", "B60205"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_state_users_extracts_suffix() {
        let pr = PullRequestView {
            node_id: "PR_1".into(),
            number: 1,
            title: "t".into(),
            draft: false,
            merged: false,
            base_ref: "main".into(),
            head_ref: "feature".into(),
            head_sha: "sha".into(),
            head_owner: "alice".into(),
            author_login: "alice".into(),
            additions: 0,
            deletions: 0,
            mergeable: Mergeable::True,
            merge_commit_sha: None,
            labels: vec!["lgtm-by-bob".into(), "wip".into()],
        };
        let users = pr.review_state_users("lgtm-by-");
        assert!(users.contains("bob"));
        assert_eq!(users.len(), 1);
    }
}
