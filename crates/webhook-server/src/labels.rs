//! Labels engine: add/remove/wait-for-consistency, size computation, and
//! the review-state-to-label projection.

use std::time::Duration;

use crate::config::SizeThreshold;
use crate::models::{static_labels, PullRequestView, DYNAMIC_PREFIXES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewState {
    Approve,
    ApprovedOrLgtm,
    ChangesRequested,
    Commented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelAction {
    Add,
    Remove,
}

/// Resolves the label color for any label name this engine manages: a
/// fixed color for static labels, a per-prefix color for dynamic/per-user
/// labels, and a size-name lookup for `size/*`.
pub fn color_for_label(name: &str, size_thresholds: &[(u64, String, String)]) -> Option<String> {
    let statics = [
        static_labels::VERIFIED,
        static_labels::LGTM,
        static_labels::APPROVE,
        static_labels::AUTOMERGE,
        static_labels::HOLD,
        static_labels::WIP,
        static_labels::CAN_BE_MERGED,
        static_labels::HAS_CONFLICTS,
        static_labels::NEEDS_REBASE,
        static_labels::AUTO_CHERRY_PICK,
        static_labels::CHERRY_PICKED,
    ];
    for (label, color) in statics {
        if name.eq_ignore_ascii_case(label) {
            return Some(color.to_string());
        }
    }
    for (prefix, color) in DYNAMIC_PREFIXES {
        if name.starts_with(prefix) {
            return Some(color.to_string());
        }
    }
    if let Some(size_name) = name.strip_prefix("size/") {
        if let Some((_, _, color)) = size_thresholds.iter().find(|(_, n, _)| n == size_name) {
            return Some(color.clone());
        }
    }
    if name.starts_with(crate::models::BRANCH_PREFIX) {
        return Some("1D76DB".to_string());
    }
    if name.starts_with(crate::models::CHERRY_PICK_PREFIX) {
        return Some("F09C74".to_string());
    }
    None
}

/// Validates and normalizes a per-repo size-threshold override, dropping
/// invalid entries with a warning and falling back to the defaults if the
/// result is empty.
pub fn resolve_size_thresholds(
    overrides: Option<&std::collections::HashMap<String, SizeThreshold>>,
) -> Vec<(u64, String, String)> {
    let mut thresholds: Vec<(u64, String, String)> = overrides
        .into_iter()
        .flatten()
        .filter(|(_, v)| v.threshold > 0)
        .map(|(name, v)| (v.threshold, name.clone(), v.color.clone()))
        .collect();
    thresholds.sort_by_key(|(t, _, _)| *t);
    if thresholds.is_empty() {
        crate::models::DEFAULT_SIZE_THRESHOLDS
            .iter()
            .map(|(t, n, c)| (*t, n.to_string(), c.to_string()))
            .collect()
    } else {
        thresholds
    }
}

/// Maps `size` to the name of the first threshold it falls strictly below.
pub fn size_label_name(size: u64, thresholds: &[(u64, String, String)]) -> String {
    let name = thresholds
        .iter()
        .find(|(t, _, _)| size < *t)
        .map(|(_, n, _)| n.clone())
        .unwrap_or_else(|| thresholds.last().map(|(_, n, _)| n.clone()).unwrap_or_else(|| "XXL".into()));
    format!("size/{name}")
}

/// `manage_reviewed_by_label`: computes the label to add/remove (but
/// performs no I/O — callers apply the result via the add/remove mutation
/// helpers and [`wait_for_consistency`]).
pub struct LabelProjection {
    pub target: Option<String>,
    pub paired_removal: Option<String>,
}

pub fn project_review_state(state: ReviewState, user: &str, pr_author: &str, is_approver_or_root: bool) -> Option<LabelProjection> {
    match state {
        ReviewState::Approve => {
            if !is_approver_or_root {
                return None;
            }
            Some(LabelProjection {
                target: Some(format!("approved-by-{user}")),
                paired_removal: Some(format!("changes-requested-by-{user}")),
            })
        }
        ReviewState::ApprovedOrLgtm => {
            if user == pr_author {
                return None;
            }
            Some(LabelProjection {
                target: Some(format!("lgtm-by-{user}")),
                paired_removal: Some(format!("changes-requested-by-{user}")),
            })
        }
        ReviewState::ChangesRequested => Some(LabelProjection {
            target: Some(format!("changes-requested-by-{user}")),
            paired_removal: Some(format!("lgtm-by-{user}")),
        }),
        ReviewState::Commented => Some(LabelProjection {
            target: Some(format!("commented-by-{user}")),
            paired_removal: None,
        }),
    }
}

/// Polls up to 30s total with exponential backoff starting at 0.5s capped
/// at 5s, until `check` (typically "does the cached PR view show the
/// label") returns true. `refresh` is invoked before each re-check after
/// the first attempt (modeling a re-fetch of PR labels).
pub async fn wait_for_consistency<F, Fut, R>(mut check: F, mut refresh: R) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
    R: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    let mut backoff = Duration::from_millis(500);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        refresh().await;
        tokio::time::sleep(backoff.min(deadline.saturating_duration_since(tokio::time::Instant::now()))).await;
        backoff = (backoff * 2).min(Duration::from_secs(5));
    }
}

pub fn reject_label_name(name: &str) -> bool {
    name.len() > static_labels::MAX_LABEL_LEN
}

/// Convenience used by the PR state machine for `labeled`/`unlabeled`
/// dispatch: classifies `label` so the caller knows which re-evaluation
/// path applies.
pub fn classify_label(label: &str) -> LabelClass {
    if label.eq_ignore_ascii_case(static_labels::CAN_BE_MERGED.0) {
        return LabelClass::Ignored;
    }
    for prefix in ["approved-by-", "lgtm-by-", "changes-requested-by-"] {
        if let Some(user) = label.strip_prefix(prefix) {
            return LabelClass::ReviewState(user.to_string());
        }
    }
    if label.eq_ignore_ascii_case(static_labels::VERIFIED.0) {
        return LabelClass::Verified;
    }
    if [static_labels::WIP.0, static_labels::HOLD.0, static_labels::AUTOMERGE.0]
        .iter()
        .any(|l| label.eq_ignore_ascii_case(l))
    {
        return LabelClass::MergeGate;
    }
    LabelClass::Other
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelClass {
    Ignored,
    ReviewState(String),
    Verified,
    MergeGate,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_label_picks_first_threshold_strictly_below() {
        let thresholds = resolve_size_thresholds(None);
        assert_eq!(size_label_name(10, &thresholds), "size/XS");
        assert_eq!(size_label_name(20, &thresholds), "size/S");
        assert_eq!(size_label_name(1000, &thresholds), "size/XXL");
    }

    #[test]
    fn approve_requires_approver_status() {
        assert!(project_review_state(ReviewState::Approve, "bob", "alice", false).is_none());
        assert!(project_review_state(ReviewState::Approve, "bob", "alice", true).is_some());
    }

    #[test]
    fn lgtm_skips_author() {
        assert!(project_review_state(ReviewState::ApprovedOrLgtm, "alice", "alice", true).is_none());
    }

    #[test]
    fn classify_label_ignores_can_be_merged() {
        assert_eq!(classify_label("can-be-merged"), LabelClass::Ignored);
        assert_eq!(
            classify_label("lgtm-by-bob"),
            LabelClass::ReviewState("bob".to_string())
        );
    }

    #[test]
    fn reject_overlong_label() {
        let long_name = "x".repeat(50);
        assert!(reject_label_name(&long_name));
        assert!(!reject_label_name("verified"));
    }
}
