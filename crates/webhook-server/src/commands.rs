//! Issue-comment command parser: a per-command handler table (the
//! "command-parser monolith → per-command handler table" rewiring from the
//! design notes), plus draft-PR gating.

use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
    pub cancel: bool,
}

/// Splits every `/`-prefixed line of a comment body into a command. Each
/// recognized command is intended to run concurrently with its siblings.
pub fn parse_commands(body: &str) -> Vec<ParsedCommand> {
    body.lines()
        .map(str::trim)
        .filter(|line| line.starts_with('/'))
        .map(|line| {
            let without_slash = &line[1..];
            let mut parts = without_slash.splitn(2, ' ');
            let name = parts.next().unwrap_or_default().to_string();
            let rest = parts.next().unwrap_or_default();
            let mut args: Vec<String> = rest.split_whitespace().map(str::to_string).collect();
            let cancel = args.last().map(|a| a == "cancel").unwrap_or(false);
            if cancel {
                args.pop();
            }
            ParsedCommand { name, args, cancel }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftGate {
    BlockedSilently,
    AllAllowed,
    OnlyListed,
}

/// Draft-PR gating per §4.5: an unset `allow-commands-on-draft-prs` blocks
/// everything silently; an empty list allows everything; a non-empty list
/// allows only the listed commands (others get one explanatory comment).
pub fn allowed_on_draft(command: &str, allow_list: Option<&[String]>) -> bool {
    match allow_list {
        None => false,
        Some(list) if list.is_empty() => true,
        Some(list) => list.iter().any(|c| c == command),
    }
}

pub const RECOGNIZED_COMMANDS: &[&str] = &[
    "retest",
    "reprocess",
    "cherry-pick",
    "assign-reviewers",
    "assign-reviewer",
    "check-can-merge",
    "build-and-push-container",
    "add-allowed-user",
    "regenerate-welcome",
    "wip",
    "hold",
    "verified",
    "automerge",
    "lgtm",
    "approve",
];

/// Commands whose authorization is satisfied by the label-authorization
/// predicate itself rather than the generic commander check (per §4.5:
/// "unless the command is `cherry-pick` or a label-only command whose
/// label the predicate specifically authorizes").
pub fn self_authorizing(command: &str) -> bool {
    matches!(command, "cherry-pick")
}

pub fn is_recognized(command: &str) -> bool {
    RECOGNIZED_COMMANDS.contains(&command)
}

/// `hold` additionally requires approver status; `automerge` requires
/// maintainer/approver status, beyond the base commander check.
pub fn requires_approver_status(command: &str) -> bool {
    matches!(command, "hold" | "automerge")
}

#[derive(Debug, Clone)]
pub enum CommandEffect {
    RetestChecks(Vec<String>),
    Reprocess,
    CherryPick(Vec<String>),
    AssignReviewers,
    AssignReviewer(String),
    CheckCanMerge,
    BuildAndPushContainer(Vec<String>),
    AcknowledgeAllowedUser(String),
    RegenerateWelcome,
    ToggleLabel { label: String, add: bool },
    Unrecognized,
}

/// Resolves one parsed command into its effect. Label-only commands
/// (`wip`, `hold`, `verified`, `automerge`, `lgtm`, `approve`) map to
/// `ToggleLabel`, `add = !cancel`.
pub fn resolve(cmd: &ParsedCommand, configured_checks: &HashSet<String>) -> CommandEffect {
    match cmd.name.as_str() {
        "retest" => {
            if cmd.args.first().map(String::as_str) == Some("all") {
                CommandEffect::RetestChecks(configured_checks.iter().cloned().collect())
            } else {
                CommandEffect::RetestChecks(cmd.args.clone())
            }
        }
        "reprocess" => CommandEffect::Reprocess,
        "cherry-pick" => CommandEffect::CherryPick(cmd.args.clone()),
        "assign-reviewers" => CommandEffect::AssignReviewers,
        "assign-reviewer" => CommandEffect::AssignReviewer(
            cmd.args.first().cloned().unwrap_or_default().trim_start_matches('@').to_string(),
        ),
        "check-can-merge" => CommandEffect::CheckCanMerge,
        "build-and-push-container" => CommandEffect::BuildAndPushContainer(cmd.args.clone()),
        "add-allowed-user" => CommandEffect::AcknowledgeAllowedUser(
            cmd.args.first().cloned().unwrap_or_default().trim_start_matches('@').to_string(),
        ),
        "regenerate-welcome" => CommandEffect::RegenerateWelcome,
        "wip" | "hold" | "verified" | "automerge" | "lgtm" | "approve" => CommandEffect::ToggleLabel {
            label: cmd.name.clone(),
            add: !cmd.cancel,
        },
        _ => CommandEffect::Unrecognized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_with_cancel_modifier() {
        let cmds = parse_commands("/hold cancel\nnot a command\n/lgtm");
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].name, "hold");
        assert!(cmds[0].cancel);
        assert_eq!(cmds[1].name, "lgtm");
        assert!(!cmds[1].cancel);
    }

    #[test]
    fn retest_all_expands_to_configured_checks() {
        let cmd = ParsedCommand { name: "retest".into(), args: vec!["all".into()], cancel: false };
        let configured: HashSet<String> = ["tox".to_string(), "pre-commit".to_string()].into();
        match resolve(&cmd, &configured) {
            CommandEffect::RetestChecks(checks) => assert_eq!(checks.len(), 2),
            _ => panic!("expected RetestChecks"),
        }
    }

    #[test]
    fn draft_gate_unset_blocks_everything() {
        assert!(!allowed_on_draft("retest", None));
    }

    #[test]
    fn draft_gate_empty_list_allows_everything() {
        assert!(allowed_on_draft("retest", Some(&[])));
    }

    #[test]
    fn draft_gate_non_empty_list_is_exclusive() {
        let list = vec!["retest".to_string()];
        assert!(allowed_on_draft("retest", Some(&list)));
        assert!(!allowed_on_draft("hold", Some(&list)));
    }
}
