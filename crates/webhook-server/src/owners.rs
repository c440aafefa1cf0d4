//! OWNERS resolution and approval policy.
//!
//! Discovers nested `OWNERS` files along the changed-file paths, aggregates
//! approvers/reviewers, and implements the command/merge authorization
//! predicate.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use thiserror::Error;

use crate::models::RepositorySnapshot;

#[derive(Debug, Error)]
pub enum OwnersError {
    #[error("failed to parse OWNERS file at {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// The parsed contents of one `OWNERS` file, keyed by directory in
/// [`OwnersIndex`]. Root uses `.`.
#[derive(Debug, Clone, Deserialize)]
pub struct OwnersEntry {
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default, rename = "allowed-users")]
    pub allowed_users: Vec<String>,
    #[serde(default = "default_true", rename = "root-approvers")]
    pub root_approvers: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default)]
pub struct OwnersIndex {
    pub entries: HashMap<String, OwnersEntry>,
    /// Recorded when the per-delivery `max-owners-files` cap truncated
    /// discovery; surfaced in logs, never fatal.
    pub truncated: bool,
}

impl OwnersIndex {
    /// Builds the index from `(path, raw_yaml)` pairs already fetched by
    /// the caller (the git-tree walk and parallel content fetch are GitHub
    /// API concerns, not modeled here). `path` is the OWNERS file's path
    /// relative to the repo root, e.g. `"services/api/OWNERS"`.
    pub fn build(files: Vec<(String, String)>, cap: usize) -> (Self, Vec<String>) {
        let mut entries = HashMap::new();
        let mut skipped = Vec::new();
        let truncated = files.len() > cap;
        for (path, content) in files.into_iter().take(cap) {
            let dir = owners_dir_for_path(&path);
            match serde_yaml::from_str::<OwnersEntry>(&content) {
                Ok(entry) => {
                    entries.insert(dir, entry);
                }
                Err(_) => skipped.push(path),
            }
        }
        (Self { entries, truncated }, skipped)
    }

    pub fn root(&self) -> Option<&OwnersEntry> {
        self.entries.get(".")
    }

    pub fn all_repo_approvers(&self) -> HashSet<String> {
        self.entries.values().flat_map(|e| e.approvers.iter().cloned()).collect()
    }

    pub fn all_repo_reviewers(&self) -> HashSet<String> {
        self.entries.values().flat_map(|e| e.reviewers.iter().cloned()).collect()
    }

    /// Implements `owners_data_for_changed_files`: for each OWNERS
    /// directory other than root, includes it iff it equals or is an
    /// ancestor of some changed file's parent directory. Root is included
    /// unless *every* matched directory opts out via `root-approvers:
    /// false` *and* every changed directory is covered by some matched
    /// OWNERS file — a single directory requiring root is enough to keep
    /// it, which is the key semantic here.
    pub fn owners_data_for_changed_files(&self, changed_files: &[String]) -> Vec<(&str, &OwnersEntry)> {
        let changed_dirs: Vec<String> = changed_files.iter().map(|f| owners_dir_for_path(f)).collect();

        let mut matched: Vec<(&str, &OwnersEntry)> = Vec::new();
        let mut covered: HashSet<&str> = HashSet::new();
        let mut all_opt_out = true;

        for (dir, entry) in self.entries.iter() {
            if dir == "." {
                continue;
            }
            let is_match = changed_dirs.iter().any(|cd| cd == dir || is_ancestor(dir, cd));
            if !is_match {
                continue;
            }
            matched.push((dir.as_str(), entry));
            for cd in &changed_dirs {
                if cd == dir || is_ancestor(dir, cd) {
                    covered.insert(cd.as_str());
                }
            }
            if entry.root_approvers {
                all_opt_out = false;
            }
        }

        let all_covered = changed_dirs.iter().all(|cd| covered.contains(cd.as_str()));

        if let Some(root) = self.root() {
            if !(all_opt_out && all_covered) {
                matched.push((".", root));
            }
        }

        matched
    }
}

fn owners_dir_for_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => ".".to_string(),
    }
}

fn is_ancestor(candidate_ancestor: &str, dir: &str) -> bool {
    if candidate_ancestor == "." {
        return true;
    }
    dir == candidate_ancestor || dir.starts_with(&format!("{candidate_ancestor}/"))
}

/// Aggregated view over a PR's changed files, used by the labels/checks
/// engines and the can-be-merged predicate.
pub struct OwnersResolver<'a> {
    pub index: &'a OwnersIndex,
    pub changed_files: Vec<String>,
    pub snapshot: &'a RepositorySnapshot,
    valid_commanders: HashSet<String>,
}

impl<'a> OwnersResolver<'a> {
    pub fn new(index: &'a OwnersIndex, changed_files: Vec<String>, snapshot: &'a RepositorySnapshot) -> Self {
        let mut valid_commanders: HashSet<String> = snapshot.maintainers().map(str::to_string).collect();
        valid_commanders.extend(index.all_repo_approvers());
        if let Some(root) = index.root() {
            valid_commanders.extend(root.allowed_users.iter().cloned());
        }
        Self {
            index,
            changed_files,
            snapshot,
            valid_commanders,
        }
    }

    pub fn approvers_for_pr(&self) -> HashSet<String> {
        self.index
            .owners_data_for_changed_files(&self.changed_files)
            .into_iter()
            .flat_map(|(_, entry)| entry.approvers.iter().cloned())
            .collect()
    }

    pub fn reviewers_for_pr(&self) -> HashSet<String> {
        self.index
            .owners_data_for_changed_files(&self.changed_files)
            .into_iter()
            .flat_map(|(_, entry)| entry.reviewers.iter().cloned())
            .collect()
    }

    /// True if `user` may issue commands / trigger merges without an
    /// explicit `/add-allowed-user` grant recorded in `extra_allowed`.
    pub fn is_user_valid_to_run_commands(&self, user: &str, extra_allowed: &HashSet<String>) -> bool {
        self.valid_commanders.contains(user) || extra_allowed.contains(user)
    }

    /// Scans issue-comment bodies for a `/add-allowed-user @<user>` posted
    /// by someone already authorized; returns the set of users granted
    /// this way.
    pub fn allowed_users_from_comments<'c>(
        &self,
        comments: impl IntoIterator<Item = (&'c str, &'c str)>,
    ) -> HashSet<String> {
        let mut granted = HashSet::new();
        for (author, body) in comments {
            if !self.is_user_valid_to_run_commands(author, &granted) {
                continue;
            }
            for line in body.lines() {
                if let Some(rest) = line.trim().strip_prefix("/add-allowed-user @") {
                    granted.insert(rest.trim().to_string());
                }
            }
        }
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> RepositorySnapshot {
        RepositorySnapshot::default()
    }

    #[test]
    fn owners_data_includes_root_when_any_folder_requires_it() {
        let mut entries = HashMap::new();
        entries.insert(
            ".".to_string(),
            OwnersEntry {
                approvers: vec!["root-owner".into()],
                reviewers: vec![],
                allowed_users: vec![],
                root_approvers: true,
            },
        );
        entries.insert(
            "services/api".to_string(),
            OwnersEntry {
                approvers: vec!["api-owner".into()],
                reviewers: vec![],
                allowed_users: vec![],
                root_approvers: false,
            },
        );
        entries.insert(
            "services/web".to_string(),
            OwnersEntry {
                approvers: vec!["web-owner".into()],
                reviewers: vec![],
                allowed_users: vec![],
                root_approvers: true,
            },
        );
        let index = OwnersIndex { entries, truncated: false };

        let changed = vec!["services/api/main.py".to_string(), "services/web/app.py".to_string()];
        let matched = index.owners_data_for_changed_files(&changed);
        // web's folder still requires root, so root must be included
        // despite api's opt-out.
        assert!(matched.iter().any(|(dir, _)| *dir == "."));
    }

    #[test]
    fn owners_data_excludes_root_when_all_matched_opt_out_and_fully_covered() {
        let mut entries = HashMap::new();
        entries.insert(
            ".".to_string(),
            OwnersEntry {
                approvers: vec!["root-owner".into()],
                reviewers: vec![],
                allowed_users: vec![],
                root_approvers: true,
            },
        );
        entries.insert(
            "services/api".to_string(),
            OwnersEntry {
                approvers: vec!["api-owner".into()],
                reviewers: vec![],
                allowed_users: vec![],
                root_approvers: false,
            },
        );
        let index = OwnersIndex { entries, truncated: false };

        let changed = vec!["services/api/main.py".to_string()];
        let matched = index.owners_data_for_changed_files(&changed);
        assert!(!matched.iter().any(|(dir, _)| *dir == "."));
    }

    #[test]
    fn ancestor_matching_includes_nested_changed_paths() {
        assert!(is_ancestor("services", "services/api/sub"));
        assert!(!is_ancestor("services/web", "services/api"));
    }

    #[test]
    fn valid_commanders_includes_maintainers_and_approvers() {
        let mut entries = HashMap::new();
        entries.insert(
            ".".to_string(),
            OwnersEntry {
                approvers: vec!["carol".into()],
                reviewers: vec![],
                allowed_users: vec!["dave".into()],
                root_approvers: true,
            },
        );
        let index = OwnersIndex { entries, truncated: false };
        let snap = snapshot();
        let resolver = OwnersResolver::new(&index, vec![], &snap);
        let empty = HashSet::new();
        assert!(resolver.is_user_valid_to_run_commands("carol", &empty));
        assert!(resolver.is_user_valid_to_run_commands("dave", &empty));
        assert!(!resolver.is_user_valid_to_run_commands("eve", &empty));
    }
}
