//! Repository workspace: scoped clone-directory lifecycle.
//!
//! Each clone is modeled as a resource whose acquisition performs the nine
//! git steps below and whose release unconditionally removes the
//! directory, even if the acquirer is cancelled mid-step — the "scoped
//! clone directories → acquisition with guaranteed release" rewiring from
//! the design notes. [`ClonedWorkspace`]'s `Drop` impl is the release;
//! `prepare` is the acquisition.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::Command;

use crate::redact::RedactionList;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git step `{step}` failed: {stderr}")]
    GitStep { step: &'static str, stderr: String },
    #[error("failed to create clone directory: {0}")]
    Io(#[from] std::io::Error),
}

pub struct PrepareArgs<'a> {
    pub clone_url: &'a str,
    pub token: &'a str,
    pub owner_name: &'a str,
    pub owner_email: &'a str,
    pub checkout: Option<&'a str>,
    pub pull_request_number: Option<u64>,
    pub base_ref: Option<&'a str>,
    pub is_merged: bool,
    pub tag_name: Option<&'a str>,
}

/// A clone directory scoped to one delivery (or one concurrent runner
/// within a delivery, each of which gets its own UUID-suffixed subpath).
/// Deleted recursively on drop; deletion errors are ignored, matching the
/// reference implementation's "best-effort cleanup" behavior.
pub struct ClonedWorkspace {
    pub path: PathBuf,
}

impl Drop for ClonedWorkspace {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

pub struct PrepareOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs the nine-step clone/checkout/merge procedure. Short-circuits on
/// the first failing step. The workspace directory is always created
/// (and will always be removed via `Drop` regardless of outcome); callers
/// must consult `PrepareOutcome` and, on failure, set their check to
/// failure with the captured output.
pub async fn prepare(
    base_dir: &Path,
    redaction: &RedactionList,
    args: &PrepareArgs<'_>,
) -> Result<(ClonedWorkspace, PrepareOutcome), WorkspaceError> {
    let clone_dir = base_dir.join(uuid::Uuid::new_v4().to_string());
    tokio::fs::create_dir_all(&clone_dir).await?;
    let workspace = ClonedWorkspace { path: clone_dir.clone() };

    let authenticated_url = args.clone_url.replacen("https://", &format!("https://x-access-token:{}@", args.token), 1);

    let mut stdout_all = String::new();
    let mut stderr_all = String::new();

    macro_rules! step {
        ($name:expr, $cmd:expr, $dir:expr) => {{
            let output = run_git(&$cmd, $dir).await?;
            stdout_all.push_str(&redaction.redact(&output.stdout));
            stderr_all.push_str(&redaction.redact(&output.stderr));
            if !output.success {
                return Ok((
                    workspace,
                    PrepareOutcome {
                        success: false,
                        stdout: stdout_all,
                        stderr: stderr_all,
                    },
                ));
            }
        }};
    }

    // 1. clone
    step!(
        "clone",
        vec!["clone".to_string(), authenticated_url.clone(), clone_dir.display().to_string()],
        base_dir
    );
    // 2. identity config
    step!(
        "config-user-name",
        vec!["config".to_string(), "user.name".to_string(), args.owner_name.to_string()],
        &clone_dir
    );
    step!(
        "config-user-email",
        vec!["config".to_string(), "user.email".to_string(), args.owner_email.to_string()],
        &clone_dir
    );
    // 3. pull-ref fetch mapping
    step!(
        "config-fetch-refspec",
        vec![
            "config".to_string(),
            "remote.origin.fetch".to_string(),
            "+refs/pull/*/head:refs/remotes/origin/pr/*".to_string(),
        ],
        &clone_dir
    );
    // 4. remote update
    step!("remote-update", vec!["remote".to_string(), "update".to_string()], &clone_dir);

    // 5-8. checkout/merge branching
    if let Some(checkout) = args.checkout {
        step!("checkout", vec!["checkout".to_string(), checkout.to_string()], &clone_dir);
        if let Some(base_ref) = args.base_ref {
            step!(
                "merge-base",
                vec!["merge".to_string(), "--no-ff".to_string(), format!("origin/{base_ref}")],
                &clone_dir
            );
        }
    } else if args.is_merged && args.pull_request_number.is_some() {
        if let Some(base_ref) = args.base_ref {
            step!("checkout-base", vec!["checkout".to_string(), base_ref.to_string()], &clone_dir);
        }
    } else if let Some(tag) = args.tag_name {
        step!("checkout-tag", vec!["checkout".to_string(), tag.to_string()], &clone_dir);
    } else if let Some(pr_number) = args.pull_request_number {
        step!(
            "checkout-pr",
            vec!["checkout".to_string(), format!("origin/pr/{pr_number}")],
            &clone_dir
        );
        if let Some(base_ref) = args.base_ref {
            step!(
                "merge-base-pr",
                vec!["merge".to_string(), "--no-ff".to_string(), format!("origin/{base_ref}")],
                &clone_dir
            );
        }
    }

    Ok((
        workspace,
        PrepareOutcome {
            success: true,
            stdout: stdout_all,
            stderr: stderr_all,
        },
    ))
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn run_git(args: &[String], cwd: &Path) -> Result<GitOutput, WorkspaceError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await?;
    Ok(GitOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// The podman-bug workaround: if stderr matches the known boot-ID
/// mismatch message, the two stale storage directories are removed and
/// the command is retried exactly once.
pub const PODMAN_BOOT_ID_MESSAGE: &str =
    "current system boot ID differs from cached boot ID; an unhandled reboot has occurred";

pub async fn podman_boot_id_workaround_paths() -> [PathBuf; 2] {
    [
        PathBuf::from("/tmp/storage-run-1000/containers"),
        PathBuf::from("/tmp/storage-run-1000/libpod/tmp"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_podman_boot_id_message() {
        let stderr = "error: current system boot ID differs from cached boot ID; an unhandled reboot has occurred";
        assert!(stderr.contains(PODMAN_BOOT_ID_MESSAGE));
    }
}
