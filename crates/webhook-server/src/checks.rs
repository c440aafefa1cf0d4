//! Check-runs engine: status transitions, required-check-set aggregation,
//! and check-output text preparation (ANSI-strip, redact, truncate).

use std::collections::{HashMap, HashSet};

use crate::redact::RedactionList;

pub const CAN_BE_MERGED_CHECK: &str = "can-be-merged";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Queued,
    InProgress,
    Success,
    Failure,
}

/// The required-check set for a PR: branch-protection required contexts
/// (unless the repo is private) plus the always-required
/// [`CAN_BE_MERGED_CHECK`], plus whichever configured features are on,
/// plus any `mandatory: true` custom checks. Computed once per delivery
/// and cached on the [`crate::context::DeliveryContext`].
pub fn required_check_set(
    branch_protection_contexts: &[String],
    repo_is_private: bool,
    tox: bool,
    verified_job: bool,
    build_container: bool,
    python_module_install: bool,
    conventional_title: bool,
    pre_commit: bool,
    mandatory_custom_checks: &[String],
) -> Vec<String> {
    let mut set: HashSet<String> = HashSet::new();
    if !repo_is_private {
        set.extend(branch_protection_contexts.iter().cloned());
    }
    set.insert(CAN_BE_MERGED_CHECK.to_string());
    if tox {
        set.insert("tox".to_string());
    }
    if verified_job {
        set.insert("verified".to_string());
    }
    if build_container {
        set.insert("build-container".to_string());
    }
    if python_module_install {
        set.insert("python-module-install".to_string());
    }
    if conventional_title {
        set.insert("conventional-title".to_string());
    }
    if pre_commit {
        set.insert("pre-commit".to_string());
    }
    set.extend(mandatory_custom_checks.iter().cloned());
    let mut out: Vec<String> = set.into_iter().collect();
    out.sort();
    out
}

/// One observed check-run or legacy commit-status entry for a given
/// context name. Per context, only the highest-id (most recent) entry is
/// considered; a success in either source counts as pass, a failure in
/// either counts as fail, and in-progress is only ever reported by
/// check-runs (legacy statuses have no such state).
#[derive(Debug, Clone)]
pub struct ContextObservation {
    pub context: String,
    pub id: u64,
    pub status: CheckStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredCheckState {
    Passed,
    InProgress,
    Failed,
    Missing,
}

/// Distinguishes the three required-check-failure sub-states across the
/// union of check-runs and legacy commit statuses for the last commit.
pub fn evaluate_required_checks(
    required: &[String],
    check_runs: &[ContextObservation],
    commit_statuses: &[ContextObservation],
) -> HashMap<String, RequiredCheckState> {
    let mut latest: HashMap<&str, &ContextObservation> = HashMap::new();
    for obs in check_runs.iter().chain(commit_statuses.iter()) {
        latest
            .entry(obs.context.as_str())
            .and_modify(|cur| {
                if obs.id > cur.id {
                    *cur = obs;
                }
            })
            .or_insert(obs);
    }

    required
        .iter()
        .map(|name| {
            let state = match latest.get(name.as_str()) {
                None => RequiredCheckState::Missing,
                Some(obs) => match obs.status {
                    CheckStatus::Success => RequiredCheckState::Passed,
                    CheckStatus::Failure => RequiredCheckState::Failed,
                    CheckStatus::InProgress => RequiredCheckState::InProgress,
                    CheckStatus::Queued => RequiredCheckState::InProgress,
                },
            };
            (name.clone(), state)
        })
        .collect()
}

const MAX_LEN: usize = 65534;
const WRAPPER_OVERHEAD: usize = 10;

/// Strips ANSI escape sequences, applies redaction, and truncates to
/// GitHub's 65534-char check-run output limit by preserving the head and
/// tail of the text around a `…[TRUNCATED]…` marker. Stderr is preserved
/// first (placed ahead of stdout) per the reference behavior.
pub fn prepare_check_text(stdout: &str, stderr: &str, redaction: &RedactionList) -> String {
    let combined = if stderr.is_empty() {
        stdout.to_string()
    } else {
        format!("{stderr}\n{stdout}")
    };
    let stripped = strip_ansi(&combined);
    let redacted = redaction.redact(&stripped);
    truncate_preserving_ends(&redacted)
}

fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            // Skip CSI sequences: ESC '[' ... final-byte in 0x40..=0x7E.
            if chars.peek() == Some(&'[') {
                chars.next();
                for next in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&next) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

fn truncate_preserving_ends(text: &str) -> String {
    if text.len() <= MAX_LEN {
        return text.to_string();
    }
    let marker = "…[TRUNCATED]…";
    let budget = MAX_LEN - marker.len() - WRAPPER_OVERHEAD;
    let head_len = budget / 2;
    let tail_len = budget - head_len;
    let head = take_chars_by_bytes(text, head_len);
    let tail = take_chars_by_bytes_from_end(text, tail_len);
    format!("{head}{marker}{tail}")
}

fn take_chars_by_bytes(text: &str, max_bytes: usize) -> String {
    let mut end = 0;
    for (idx, c) in text.char_indices() {
        if idx + c.len_utf8() > max_bytes {
            break;
        }
        end = idx + c.len_utf8();
    }
    text[..end].to_string()
}

fn take_chars_by_bytes_from_end(text: &str, max_bytes: usize) -> String {
    let total = text.len();
    let mut start = total;
    for (idx, c) in text.char_indices().rev() {
        if total - idx > max_bytes {
            break;
        }
        start = idx;
        let _ = c;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn prepare_check_text_puts_stderr_before_stdout_and_redacts() {
        let redaction = RedactionList::new().with("s3cr3t");
        let text = prepare_check_text("built ok with s3cr3t token", "warning: deprecated", &redaction);
        assert_eq!(text, "warning: deprecated\nbuilt ok with ***** token");
    }

    #[test]
    fn required_check_set_includes_always_on_and_configured() {
        let set = required_check_set(&["ci/build".to_string()], false, true, true, false, false, false, false, &[]);
        assert!(set.contains(&CAN_BE_MERGED_CHECK.to_string()));
        assert!(set.contains(&"ci/build".to_string()));
        assert!(set.contains(&"tox".to_string()));
        assert!(set.contains(&"verified".to_string()));
    }

    #[test]
    fn private_repo_excludes_branch_protection_contexts() {
        let set = required_check_set(&["ci/build".to_string()], true, false, false, false, false, false, false, &[]);
        assert!(!set.contains(&"ci/build".to_string()));
    }

    #[test]
    fn highest_id_wins_across_sources() {
        let required = vec!["tox".to_string()];
        let check_runs = vec![ContextObservation { context: "tox".into(), id: 1, status: CheckStatus::Failure }];
        let statuses = vec![ContextObservation { context: "tox".into(), id: 2, status: CheckStatus::Success }];
        let result = evaluate_required_checks(&required, &check_runs, &statuses);
        assert_eq!(result["tox"], RequiredCheckState::Passed);
    }

    #[test]
    fn missing_context_is_reported_missing() {
        let required = vec!["verified".to_string()];
        let result = evaluate_required_checks(&required, &[], &[]);
        assert_eq!(result["verified"], RequiredCheckState::Missing);
    }

    #[test]
    fn strip_ansi_removes_color_codes() {
        assert_eq!(strip_ansi("\u{1b}[31mred\u{1b}[0m text"), "red text");
    }

    #[test]
    fn short_text_is_not_truncated() {
        let text = "ok";
        assert_eq!(truncate_preserving_ends(text), "ok");
    }

    #[test]
    fn long_text_is_truncated_with_marker() {
        let text = "a".repeat(MAX_LEN + 1000);
        let result = truncate_preserving_ends(&text);
        assert!(result.len() <= MAX_LEN);
        assert!(result.contains("…[TRUNCATED]…"));
    }
}
