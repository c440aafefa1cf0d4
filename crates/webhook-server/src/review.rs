//! Review handler (`pull_request_review` `submitted` action only).

use crate::labels::ReviewState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawReviewState {
    Approved,
    ChangesRequested,
    Commented,
}

/// Maps GitHub's raw review state to the label-engine's [`ReviewState`].
/// GitHub's own "approved" review state maps to `ApprovedOrLgtm` (same
/// bucket as a `/lgtm` command), not to `Approve` — only an explicit
/// `/approve` command in the review body reaches `Approve`.
pub fn review_state_for(raw: RawReviewState) -> ReviewState {
    match raw {
        RawReviewState::Approved => ReviewState::ApprovedOrLgtm,
        RawReviewState::ChangesRequested => ReviewState::ChangesRequested,
        RawReviewState::Commented => ReviewState::Commented,
    }
}

/// A review whose body contains the literal `/approve` command also
/// projects `ReviewState::Approve` (in addition to whatever its raw
/// GitHub review state already projected) and may trigger the
/// "test oracle" webhook in the background.
pub fn body_contains_approve_command(body: &str) -> bool {
    body.lines().any(|line| line.trim() == "/approve")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approved_state_maps_to_lgtm_bucket() {
        assert_eq!(review_state_for(RawReviewState::Approved), ReviewState::ApprovedOrLgtm);
    }

    #[test]
    fn detects_approve_command_in_body() {
        assert!(body_contains_approve_command("looks good\n/approve\nthanks"));
        assert!(!body_contains_approve_command("looks good, approved in spirit"));
    }
}
