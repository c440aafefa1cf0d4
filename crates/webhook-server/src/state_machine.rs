//! Pull-request state machine.
//!
//! The action enumeration in §4.2 is a finite closed set; it is
//! represented here as [`PrEvent`], a tagged union whose variants carry
//! only the fields each arm consumes. [`plan`] is a pure function from
//! `(event, pr, owners, config)` to a list of [`Operation`]s — this mirrors
//! the teacher's `Audit` trait's cascading dispatch (`audit_workflow` →
//! `audit_normal_job` → `audit_step`), generalized here to a single flat
//! dispatch since the event set (unlike zizmor's YAML node types) has no
//! further internal nesting to cascade through. Keeping `plan` pure means
//! the decision logic is unit-testable without any GitHub I/O; a shared
//! effect runner (see `dispatcher.rs`) executes the resulting operations.

use std::collections::HashSet;

use crate::checks::{RequiredCheckState, CAN_BE_MERGED_CHECK};
use crate::models::{static_labels, PullRequestView};
use crate::owners::OwnersResolver;

#[derive(Debug, Clone)]
pub enum PrEvent {
    Edited { title_changed: bool },
    Opened,
    ReadyForReview,
    Reopened,
    Synchronize,
    ClosedMerged,
    ClosedUnmerged,
    Labeled { label: String },
    Unlabeled { label: String },
}

#[derive(Debug, Clone)]
pub enum Operation {
    PostWelcomeCommentIfMissing,
    OpenTrackingIssueIfMissing,
    RunSetupAndCiPipeline,
    SetAutomergeIfApplicable,
    RemoveAllReviewStateLabels,
    RequeueVerifiedCheck,
    CloseTrackingIssue,
    CherryPick { branch: String },
    TriggerReleaseContainerBuild,
    DelayThenReevaluateConflictsForOpenPrs,
    DeleteContainerTag,
    AddLabel(String),
    RemoveLabel(String),
    ToggleWipTitlePrefix,
    RunConventionalTitleCheck,
    TransitionVerifiedCheck { to_success: bool },
    ReevaluateCanBeMerged,
    NoOp,
}

/// Computes the operation list for one PR-level event. Pure: no I/O, no
/// mutation of `pr` — callers execute the resulting operations against the
/// live PR and then re-derive state for the next delivery.
pub fn plan(event: &PrEvent, pr: &PullRequestView, owners: &OwnersResolver<'_>) -> Vec<Operation> {
    match event {
        PrEvent::Edited { title_changed } => {
            let mut ops = vec![Operation::ToggleWipTitlePrefix];
            if *title_changed {
                ops.push(Operation::RunConventionalTitleCheck);
            }
            ops
        }
        PrEvent::Opened | PrEvent::ReadyForReview => vec![
            Operation::PostWelcomeCommentIfMissing,
            Operation::OpenTrackingIssueIfMissing,
            Operation::RunSetupAndCiPipeline,
            Operation::SetAutomergeIfApplicable,
        ],
        PrEvent::Reopened => vec![
            Operation::OpenTrackingIssueIfMissing,
            Operation::RunSetupAndCiPipeline,
            Operation::SetAutomergeIfApplicable,
        ],
        PrEvent::Synchronize => vec![
            Operation::RunSetupAndCiPipeline,
            Operation::RemoveAllReviewStateLabels,
            Operation::RequeueVerifiedCheck,
        ],
        PrEvent::ClosedMerged => {
            let mut ops = vec![Operation::CloseTrackingIssue];
            for label in &pr.labels {
                if let Some(branch) = label.strip_prefix(crate::models::CHERRY_PICK_PREFIX) {
                    ops.push(Operation::CherryPick { branch: branch.to_string() });
                }
            }
            ops.push(Operation::TriggerReleaseContainerBuild);
            ops.push(Operation::DelayThenReevaluateConflictsForOpenPrs);
            ops
        }
        PrEvent::ClosedUnmerged => vec![Operation::CloseTrackingIssue, Operation::DeleteContainerTag],
        PrEvent::Labeled { label } | PrEvent::Unlabeled { label } => {
            plan_label_change(label, pr, owners)
        }
    }
}

fn plan_label_change(label: &str, pr: &PullRequestView, owners: &OwnersResolver<'_>) -> Vec<Operation> {
    use crate::labels::{classify_label, LabelClass};

    match classify_label(label) {
        LabelClass::Ignored => vec![Operation::NoOp],
        LabelClass::ReviewState(user) => {
            let approvers = owners.approvers_for_pr();
            let reviewers = owners.reviewers_for_pr();
            let root_approvers: HashSet<String> = owners
                .index
                .root()
                .map(|r| r.approvers.iter().cloned().collect())
                .unwrap_or_default();
            if approvers.contains(&user) || reviewers.contains(&user) || root_approvers.contains(&user) {
                vec![Operation::ReevaluateCanBeMerged]
            } else {
                vec![Operation::NoOp]
            }
        }
        LabelClass::Verified => {
            let to_success = pr.has_label(static_labels::VERIFIED.0);
            vec![
                Operation::TransitionVerifiedCheck { to_success },
                Operation::ReevaluateCanBeMerged,
            ]
        }
        LabelClass::MergeGate => vec![Operation::ReevaluateCanBeMerged],
        LabelClass::Other => vec![Operation::NoOp],
    }
}

/// Setup+CI pipeline (§4.2.1): two barrier-separated stages, each using
/// "collect-all, log-failures" fan-out semantics. The stage contents are
/// just labels here; the effect runner in `dispatcher.rs` maps each to a
/// concrete async task and joins with `futures::future::join_all`,
/// preserving per-task errors instead of short-circuiting.
pub const SETUP_STAGE: &[&str] = &[
    "assign_reviewers",
    "branch_label",
    "conflict_labels",
    "queue_required_checks",
    "verified_reset",
    "size_label",
    "assign_author_or_fallback",
];

pub const CI_STAGE: &[&str] = &[
    "tox",
    "pre_commit",
    "python_module_install",
    "container_build",
    "conventional_title",
];

/// Verified-reset policy (§4.2.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifiedResetOutcome {
    QueueOnly,
    AddVerifiedAndSucceed,
    RemoveVerifiedAndQueue,
}

pub fn verified_reset_policy(
    has_cherry_picked_label: bool,
    auto_verify_cherry_picked_prs: bool,
    author_is_auto_verified: bool,
) -> VerifiedResetOutcome {
    if has_cherry_picked_label && !auto_verify_cherry_picked_prs {
        return VerifiedResetOutcome::QueueOnly;
    }
    if author_is_auto_verified {
        return VerifiedResetOutcome::AddVerifiedAndSucceed;
    }
    VerifiedResetOutcome::RemoveVerifiedAndQueue
}

/// can-be-merged predicate (§4.2.3). Accumulates every applicable failure
/// reason rather than short-circuiting on the first one, so the check's
/// detail text can report everything outstanding at once.
pub struct MergeEvaluationInput<'a> {
    pub merged: bool,
    pub mergeable_false: bool,
    pub required_check_states: &'a [(&'a str, RequiredCheckState)],
    pub hold: bool,
    pub wip: bool,
    pub required_labels: &'a [String],
    pub present_labels: &'a HashSet<String>,
    pub changes_requested_by_approvers: &'a [String],
    pub missing_approvers: &'a HashSet<String>,
    pub lgtm_count: u32,
    pub minimum_lgtm: u32,
}

pub enum MergeEvaluation {
    AlreadyMerged,
    Result { ok: bool, reasons: Vec<String> },
}

pub fn evaluate_can_be_merged(input: &MergeEvaluationInput<'_>) -> MergeEvaluation {
    if input.merged {
        return MergeEvaluation::AlreadyMerged;
    }

    let mut reasons = Vec::new();

    if input.mergeable_false {
        reasons.push("PR is not mergeable".to_string());
    }

    let in_progress: Vec<&str> = input
        .required_check_states
        .iter()
        .filter(|(_, s)| *s == RequiredCheckState::InProgress)
        .map(|(name, _)| *name)
        .collect();
    if !in_progress.is_empty() {
        reasons.push(format!("Some required check runs in progress: {}", in_progress.join(", ")));
    }

    if input.hold {
        reasons.push("Hold label exists.".to_string());
    }
    if input.wip {
        reasons.push("WIP label exists.".to_string());
    }

    let failed: Vec<&str> = input
        .required_check_states
        .iter()
        .filter(|(_, s)| *s == RequiredCheckState::Failed)
        .map(|(name, _)| *name)
        .collect();
    if !failed.is_empty() {
        reasons.push(format!("Some check runs failed: {}", failed.join(", ")));
    }
    let missing: Vec<&str> = input
        .required_check_states
        .iter()
        .filter(|(_, s)| *s == RequiredCheckState::Missing)
        .map(|(name, _)| *name)
        .collect();
    if !missing.is_empty() {
        reasons.push(format!("Some check runs not started: {}", missing.join(", ")));
    }

    let missing_labels: Vec<&str> = input
        .required_labels
        .iter()
        .filter(|l| !input.present_labels.contains(*l))
        .map(|l| l.as_str())
        .collect();
    if !missing_labels.is_empty() {
        reasons.push(format!("Missing required labels: {}", missing_labels.join(", ")));
    }

    if !input.changes_requested_by_approvers.is_empty() {
        reasons.push("PR has changed requests from approvers".to_string());
    }

    if !input.missing_approvers.is_empty() {
        let mut names: Vec<&str> = input.missing_approvers.iter().map(String::as_str).collect();
        names.sort();
        reasons.push(format!("Missing approved from approvers: {}", names.join(", ")));
    }
    if input.lgtm_count < input.minimum_lgtm {
        reasons.push(format!(
            "Missing lgtm from reviewers. Minimum {} required, ({} given).",
            input.minimum_lgtm, input.lgtm_count
        ));
    }

    MergeEvaluation::Result {
        ok: reasons.is_empty(),
        reasons,
    }
}

/// Approval computation: `missing_approvers` starts as the unique PR
/// approvers and shrinks as `approved-by-*` labels cover OWNERS
/// directories, or empties entirely if any root-approver has approved.
pub fn compute_missing_approvers(
    pr_approvers: &HashSet<String>,
    approved_by_users: &HashSet<String>,
    root_approvers: &HashSet<String>,
    owners_directories: &[(HashSet<String>,)],
) -> HashSet<String> {
    if approved_by_users.iter().any(|u| root_approvers.contains(u)) {
        return HashSet::new();
    }
    let mut missing = pr_approvers.clone();
    for (dir_approvers,) in owners_directories {
        if !dir_approvers.is_disjoint(approved_by_users) {
            for a in dir_approvers {
                missing.remove(a);
            }
        }
    }
    missing
}

pub fn compute_lgtm_count(
    lgtm_by_users: &HashSet<String>,
    pr_reviewers: &HashSet<String>,
    root_reviewers_and_approvers: &HashSet<String>,
    pr_author: &str,
) -> u32 {
    lgtm_by_users
        .iter()
        .filter(|u| u.as_str() != pr_author)
        .filter(|u| pr_reviewers.contains(*u) || root_reviewers_and_approvers.contains(*u))
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronize_clears_review_labels_and_requeues_verified() {
        let pr = make_pr(vec![]);
        let snap = crate::models::RepositorySnapshot::default();
        let index = crate::owners::OwnersIndex::default();
        let owners = OwnersResolver::new(&index, vec![], &snap);
        let ops = plan(&PrEvent::Synchronize, &pr, &owners);
        assert!(matches!(ops[0], Operation::RunSetupAndCiPipeline));
        assert!(ops.iter().any(|o| matches!(o, Operation::RemoveAllReviewStateLabels)));
        assert!(ops.iter().any(|o| matches!(o, Operation::RequeueVerifiedCheck)));
    }

    #[test]
    fn closed_merged_cherry_picks_each_label() {
        let pr = make_pr(vec!["cherry-pick/v1".into(), "cherry-pick/v2".into()]);
        let snap = crate::models::RepositorySnapshot::default();
        let index = crate::owners::OwnersIndex::default();
        let owners = OwnersResolver::new(&index, vec![], &snap);
        let ops = plan(&PrEvent::ClosedMerged, &pr, &owners);
        let cherry_picks: Vec<_> = ops
            .iter()
            .filter_map(|o| match o {
                Operation::CherryPick { branch } => Some(branch.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(cherry_picks, vec!["v1".to_string(), "v2".to_string()]);
    }

    #[test]
    fn can_be_merged_already_merged_short_circuits() {
        let input = MergeEvaluationInput {
            merged: true,
            mergeable_false: true,
            required_check_states: &[],
            hold: false,
            wip: false,
            required_labels: &[],
            present_labels: &HashSet::new(),
            changes_requested_by_approvers: &[],
            missing_approvers: &HashSet::new(),
            lgtm_count: 0,
            minimum_lgtm: 1,
        };
        assert!(matches!(evaluate_can_be_merged(&input), MergeEvaluation::AlreadyMerged));
    }

    #[test]
    fn can_be_merged_accumulates_all_reasons() {
        let missing = HashSet::from(["alice".to_string()]);
        let input = MergeEvaluationInput {
            merged: false,
            mergeable_false: true,
            required_check_states: &[("tox", RequiredCheckState::Failed)],
            hold: true,
            wip: true,
            required_labels: &["needs-docs".to_string()],
            present_labels: &HashSet::new(),
            changes_requested_by_approvers: &["bob".to_string()],
            missing_approvers: &missing,
            lgtm_count: 0,
            minimum_lgtm: 1,
        };
        match evaluate_can_be_merged(&input) {
            MergeEvaluation::Result { ok, reasons } => {
                assert!(!ok);
                assert!(reasons.iter().any(|r| r.contains("not mergeable")));
                assert!(reasons.iter().any(|r| r.contains("Hold label")));
                assert!(reasons.iter().any(|r| r.contains("WIP label")));
                assert!(reasons.iter().any(|r| r.contains("Missing approved")));
            }
            MergeEvaluation::AlreadyMerged => panic!("should not be merged"),
        }
    }

    #[test]
    fn verified_reset_respects_cherry_picked_gate() {
        assert_eq!(
            verified_reset_policy(true, false, true),
            VerifiedResetOutcome::QueueOnly
        );
        assert_eq!(
            verified_reset_policy(false, false, true),
            VerifiedResetOutcome::AddVerifiedAndSucceed
        );
        assert_eq!(
            verified_reset_policy(false, false, false),
            VerifiedResetOutcome::RemoveVerifiedAndQueue
        );
    }

    #[test]
    fn missing_approvers_empties_on_root_approval() {
        let pr_approvers = HashSet::from(["alice".to_string(), "bob".to_string()]);
        let approved_by = HashSet::from(["carol".to_string()]);
        let root = HashSet::from(["carol".to_string()]);
        let missing = compute_missing_approvers(&pr_approvers, &approved_by, &root, &[]);
        assert!(missing.is_empty());
    }

    fn make_pr(labels: Vec<String>) -> PullRequestView {
        PullRequestView {
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
            mergeable: crate::models::Mergeable::True,
            merge_commit_sha: None,
            labels,
        }
    }
}
