//! Runner handler: async subprocess execution with timeout and secret
//! redaction, plus the individual runners (tox, pre-commit,
//! python-module-install, container build/push, cherry-pick,
//! conventional-title) that share the same set-in-progress →
//! acquire-workspace → shell-out → transition-check template.

use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;

use crate::redact::RedactionList;

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Runs `program args...` in `cwd` under an explicit timeout (default
/// 600s for custom checks, configurable 30-3600), redacting `redaction`'s
/// secrets out of whatever is captured before it is returned — the only
/// form in which subprocess output is allowed to leave this function.
pub async fn run_command(
    program: &str,
    args: &[String],
    cwd: &std::path::Path,
    env: &[(String, String)],
    timeout_secs: u64,
    redaction: &RedactionList,
) -> CommandOutcome {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    for (k, v) in env {
        cmd.env(k, v);
    }

    match timeout(Duration::from_secs(timeout_secs), cmd.output()).await {
        Ok(Ok(output)) => CommandOutcome {
            success: output.status.success(),
            stdout: redaction.redact(&String::from_utf8_lossy(&output.stdout)),
            stderr: redaction.redact(&String::from_utf8_lossy(&output.stderr)),
            timed_out: false,
        },
        Ok(Err(e)) => CommandOutcome {
            success: false,
            stdout: String::new(),
            stderr: redaction.redact(&e.to_string()),
            timed_out: false,
        },
        Err(_) => CommandOutcome {
            success: false,
            stdout: String::new(),
            stderr: "subprocess timed out".to_string(),
            timed_out: true,
        },
    }
}

pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
pub const MIN_TIMEOUT_SECS: u64 = 30;
pub const MAX_TIMEOUT_SECS: u64 = 3600;

pub fn clamp_timeout(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(DEFAULT_TIMEOUT_SECS)
        .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS)
}

/// Validates a user-configured custom-check command: must start with
/// `uv tool run --from ` and must not contain shell metacharacters (this
/// repo never invokes a shell directly, but the config-time validation is
/// kept as a defense against operators copy-pasting shell pipelines into
/// what is meant to be a plain argv).
pub fn validate_custom_check_command(command: &str) -> Result<Vec<String>, String> {
    if !command.starts_with("uv tool run --from ") {
        return Err("custom check command must start with `uv tool run --from `".to_string());
    }
    if command.chars().any(|c| "|&;$`<>\n".contains(c)) {
        return Err("custom check command contains shell metacharacters".to_string());
    }
    shlex::split(command).ok_or_else(|| "custom check command failed to tokenize".to_string())
}

/// Conventional-title check: `(allowed-name)(.*):` against the PR title
/// for any of the allowed names.
pub fn conventional_title_matches(title: &str, allowed_names: &[String]) -> bool {
    allowed_names.iter().any(|name| {
        let escaped = regex::escape(name);
        Regex::new(&format!("^{escaped}(.*):"))
            .map(|re| re.is_match(title))
            .unwrap_or(false)
    })
}

/// Builds the `tox` invocation, pinning the environment to the configured
/// Python version when one is set (e.g. `"3.12"` -> `-e py312`).
pub fn tox_command(python_version: Option<&str>) -> (String, Vec<String>) {
    let mut args = vec!["run".to_string()];
    if let Some(version) = python_version {
        args.push("-e".to_string());
        args.push(format!("py{}", version.replace('.', "")));
    }
    ("tox".to_string(), args)
}

/// Builds the pre-commit invocation. The reference tooling runs pre-commit
/// hooks through `prek`, its faster Rust reimplementation.
pub fn pre_commit_command() -> (String, Vec<String>) {
    ("prek".to_string(), vec!["run".to_string(), "--all-files".to_string()])
}

/// Builds the python-module-install check: installs the package in
/// editable mode to confirm it is importable before a container build.
pub fn python_module_install_command() -> (String, Vec<String>) {
    ("uv".to_string(), vec!["pip".to_string(), "install".to_string(), "-e".to_string(), ".".to_string()])
}

/// Builds the `podman build` argv for a PR-scoped image tag. `push`
/// controls whether this is the CI-stage dry build or the release build
/// that also pushes.
pub fn container_build_command(container: &crate::config::ContainerConfig, image_tag: &str) -> (String, Vec<String>) {
    let mut args = vec![
        "build".to_string(),
        "-f".to_string(),
        container.dockerfile.clone(),
        "-t".to_string(),
        format!("{}:{image_tag}", container.repository),
    ];
    args.extend(container.build_args.iter().cloned());
    args.extend(container.args.iter().cloned());
    args.push(".".to_string());
    ("podman".to_string(), args)
}

pub fn container_push_command(container: &crate::config::ContainerConfig, image_tag: &str) -> (String, Vec<String>) {
    ("podman".to_string(), vec!["push".to_string(), format!("{}:{image_tag}", container.repository)])
}

/// Runs a podman invocation, retrying exactly once after clearing the two
/// stale storage directories if the known boot-ID-mismatch bug is hit.
pub async fn run_podman(
    args: &[String],
    cwd: &std::path::Path,
    timeout_secs: u64,
    redaction: &RedactionList,
) -> CommandOutcome {
    let first = run_command("podman", args, cwd, &[], timeout_secs, redaction).await;
    if !first.success && first.stderr.contains(crate::workspace::PODMAN_BOOT_ID_MESSAGE) {
        for path in crate::workspace::podman_boot_id_workaround_paths().await {
            let _ = tokio::fs::remove_dir_all(&path).await;
        }
        return run_command("podman", args, cwd, &[], timeout_secs, redaction).await;
    }
    first
}

/// Generates the cherry-pick branch name: `cherry-picked-<head-ref>-<shortuuid>`.
pub fn cherry_pick_branch_name(head_ref: &str) -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    format!("cherry-picked-{head_ref}-{}", &short[..8])
}

/// The verbatim manual-cherry-pick instruction comment posted on failure.
pub fn manual_cherry_pick_instructions(original_pr: u64, branch: &str, merge_commit_sha: &str) -> String {
    format!(
        "**Manual cherry-pick is needed**\n\n\
         The automatic cherry-pick of #{original_pr} to `{branch}` failed. To cherry-pick manually:\n\n\
         ```\n\
         git fetch origin {branch}\n\
         git checkout -b cherry-picked-{branch} origin/{branch}\n\
         git cherry-pick {merge_commit_sha}\n\
         git push origin cherry-picked-{branch}\n\
         ```"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_timeout_respects_bounds() {
        assert_eq!(clamp_timeout(None), DEFAULT_TIMEOUT_SECS);
        assert_eq!(clamp_timeout(Some(10)), MIN_TIMEOUT_SECS);
        assert_eq!(clamp_timeout(Some(99999)), MAX_TIMEOUT_SECS);
    }

    #[test]
    fn validates_custom_check_prefix() {
        assert!(validate_custom_check_command("uv tool run --from mytool mytool").is_ok());
        assert!(validate_custom_check_command("rm -rf /").is_err());
    }

    #[test]
    fn rejects_shell_metacharacters() {
        assert!(validate_custom_check_command("uv tool run --from mytool mytool; rm -rf /").is_err());
    }

    #[test]
    fn conventional_title_matches_allowed_prefix() {
        let allowed = vec!["feat".to_string(), "fix".to_string()];
        assert!(conventional_title_matches("feat(api): add endpoint", &allowed));
        assert!(!conventional_title_matches("random title", &allowed));
    }

    #[test]
    fn manual_cherry_pick_instructions_cite_original_pr() {
        let text = manual_cherry_pick_instructions(15, "v2", "abc123");
        assert!(text.starts_with("**Manual cherry-pick is needed**"));
        assert!(text.contains("#15"));
        assert!(text.contains("abc123"));
    }
}
