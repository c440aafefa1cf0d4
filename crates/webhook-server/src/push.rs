//! Push handler: fires only on tag pushes.

use crate::redact::RedactionList;

pub fn tag_name_from_ref(git_ref: &str) -> Option<&str> {
    git_ref.strip_prefix("refs/tags/")
}

/// Sanitizes an error for the PyPI-publish-failure issue title: newlines
/// become spaces, backticks are stripped, and the result is truncated to
/// 247 chars plus a `…` marker.
pub fn sanitize_issue_title(error: &str, redaction: &RedactionList) -> String {
    let redacted = redaction.redact(error);
    let flattened: String = redacted
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .filter(|c| *c != '`')
        .collect();
    if flattened.len() > 247 {
        format!("{}…", &flattened[..247])
    } else {
        flattened
    }
}

#[derive(Debug, Clone)]
pub struct PushPlan {
    pub publish_pypi: bool,
    pub build_and_push_container: bool,
}

pub fn plan_push(tag_name: Option<&str>, pypi_configured: bool, container_release: bool) -> Option<PushPlan> {
    tag_name?;
    Some(PushPlan {
        publish_pypi: pypi_configured,
        build_and_push_container: container_release,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_tag_ref_yields_no_plan() {
        assert!(plan_push(tag_name_from_ref("refs/heads/main"), true, true).is_none());
    }

    #[test]
    fn tag_ref_with_both_features_configured() {
        let plan = plan_push(tag_name_from_ref("refs/tags/v1.2.3"), true, true).unwrap();
        assert!(plan.publish_pypi);
        assert!(plan.build_and_push_container);
    }

    #[test]
    fn title_sanitization_strips_backticks_and_newlines() {
        let redaction = RedactionList::new();
        let title = sanitize_issue_title("error:\n`bad thing`\nhappened", &redaction);
        assert!(!title.contains('`'));
        assert!(!title.contains('\n'));
    }

    #[test]
    fn title_sanitization_truncates_long_errors() {
        let redaction = RedactionList::new();
        let long_error = "x".repeat(500);
        let title = sanitize_issue_title(&long_error, &redaction);
        assert!(title.ends_with('…'));
        assert_eq!(title.chars().count(), 248);
    }
}
