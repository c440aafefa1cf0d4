//! Webhook dispatcher: the single HTTP POST endpoint, admission pipeline,
//! event routing, and audit-log emission.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::app::AppState;
use crate::commands::{self, CommandEffect};
use crate::config::Config;
use crate::context::{DeliveryContext, StepError};
use crate::error::AppError;
use crate::github_api::Client;
use crate::labels::{self, LabelProjection, ReviewState};
use crate::models::{Mergeable, PullRequestView, RepositorySnapshot};
use crate::owners::{OwnersIndex, OwnersResolver};
use crate::review::{self, RawReviewState};
use crate::signature;
use crate::state_machine::{self, Operation, PrEvent};

/// Admission-pipeline outcome before any handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Forbidden,
    BadRequest,
}

pub fn check_ip_allowed(state: &AppState, remote_addr: Option<IpAddr>) -> Admission {
    if state.ip_allow_list.is_empty() {
        return Admission::Accept;
    }
    match remote_addr {
        Some(addr) if state.ip_allow_list.contains(addr) => Admission::Accept,
        _ => Admission::Forbidden,
    }
}

pub fn check_signature(secret: Option<&str>, body: &[u8], header: Option<&str>) -> Admission {
    match secret {
        None => Admission::Accept,
        Some(secret) => match header {
            Some(sig) if signature::verify(secret, body, sig) => Admission::Accept,
            _ => Admission::Forbidden,
        },
    }
}

#[instrument(skip(state, body, headers))]
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let remote_addr = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    if check_ip_allowed(&state, remote_addr) != Admission::Accept {
        return (StatusCode::FORBIDDEN, Json(json!({"status": "forbidden", "message": "ip not allowed"})));
    }

    let signature_header = headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok());
    if check_signature(state.webhook_secret(), &body, signature_header) != Admission::Accept {
        return (StatusCode::FORBIDDEN, Json(json!({"status": "forbidden", "message": "bad signature"})));
    }

    let Some(event_type) = headers.get("x-github-event").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"status": "error", "message": "missing X-GitHub-Event"})));
    };
    let Some(delivery_id) = headers.get("x-github-delivery").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"status": "error", "message": "missing X-GitHub-Delivery"})));
    };

    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"status": "error", "message": "malformed payload"})));
    };

    if event_type == "ping" {
        info!(delivery_id, "ping received");
        return (StatusCode::OK, Json(json!({"status": "ok", "message": "pong"})));
    }

    let action = payload.get("action").and_then(|v| v.as_str()).map(str::to_string);
    let repo_name = payload
        .pointer("/repository/name")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let repo_full_name = payload
        .pointer("/repository/full_name")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let ctx = Arc::new(DeliveryContext::new(
        delivery_id.to_string(),
        event_type.to_string(),
        action.clone(),
        repo_name,
        repo_full_name,
    ));

    ctx.start_step("webhook_routing");

    let result = route_event(&state, &ctx, event_type, &payload).await;

    match result {
        Ok(()) => ctx.complete_step("webhook_routing", Default::default()),
        Err(e) => {
            warn!(error = %e, "delivery failed");
            ctx.fail_step(
                "webhook_routing",
                StepError { kind: "AppError".into(), message: e.to_string(), traceback: None },
            );
            ctx.fail_delivery(StepError { kind: "AppError".into(), message: e.to_string(), traceback: None });
        }
    }
    ctx.finish();

    if let Err(e) = state.audit_log().append(&ctx.to_audit_record()) {
        warn!(error = %e, "failed to write audit log entry");
    }

    if ctx.success() {
        (StatusCode::OK, Json(json!({"status": "ok", "message": "processed"})))
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"status": "error", "message": "delivery failed"})))
    }
}

fn split_full_name(full_name: &str) -> (&str, &str) {
    full_name.split_once('/').unwrap_or((full_name, full_name))
}

fn mergeable_from_payload(value: Option<&serde_json::Value>) -> Mergeable {
    match value.and_then(|v| v.as_bool()) {
        Some(true) => Mergeable::True,
        Some(false) => Mergeable::False,
        None => Mergeable::Unknown,
    }
}

fn pr_view_from_payload(payload: &serde_json::Value) -> Option<PullRequestView> {
    let pr = payload.get("pull_request")?;
    Some(PullRequestView {
        node_id: pr.get("node_id")?.as_str()?.to_string(),
        number: pr.get("number")?.as_u64()?,
        title: pr.get("title")?.as_str()?.to_string(),
        draft: pr.get("draft").and_then(|v| v.as_bool()).unwrap_or(false),
        merged: pr.get("merged").and_then(|v| v.as_bool()).unwrap_or(false),
        base_ref: pr.pointer("/base/ref")?.as_str()?.to_string(),
        head_ref: pr.pointer("/head/ref")?.as_str()?.to_string(),
        head_sha: pr.pointer("/head/sha")?.as_str()?.to_string(),
        head_owner: pr.pointer("/head/repo/owner/login").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        author_login: pr.pointer("/user/login")?.as_str()?.to_string(),
        additions: pr.get("additions").and_then(|v| v.as_u64()).unwrap_or(0),
        deletions: pr.get("deletions").and_then(|v| v.as_u64()).unwrap_or(0),
        mergeable: mergeable_from_payload(pr.get("mergeable")),
        merge_commit_sha: pr.get("merge_commit_sha").and_then(|v| v.as_str()).map(str::to_string),
        labels: pr
            .get("labels")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|l| l.get("name").and_then(|v| v.as_str()).map(str::to_string))
            .collect(),
    })
}

fn pr_event_for_action(action: &str, pr: &PullRequestView, payload: &serde_json::Value) -> Option<PrEvent> {
    match action {
        "edited" => {
            let title_changed = payload.pointer("/changes/title").is_some();
            Some(PrEvent::Edited { title_changed })
        }
        "opened" => Some(PrEvent::Opened),
        "ready_for_review" => Some(PrEvent::ReadyForReview),
        "reopened" => Some(PrEvent::Reopened),
        "synchronize" => Some(PrEvent::Synchronize),
        "closed" if pr.merged => Some(PrEvent::ClosedMerged),
        "closed" => Some(PrEvent::ClosedUnmerged),
        "labeled" => Some(PrEvent::Labeled {
            label: payload.pointer("/label/name")?.as_str()?.to_string(),
        }),
        "unlabeled" => Some(PrEvent::Unlabeled {
            label: payload.pointer("/label/name")?.as_str()?.to_string(),
        }),
        _ => None,
    }
}

/// Fetches the repository snapshot and OWNERS index needed to resolve a
/// PR's approval/command authorization. Failures here are critical (§4.1
/// step 4): the delivery is aborted rather than proceeding with a stale or
/// partial view.
async fn load_repo_context(
    client: &Client,
    ctx: &DeliveryContext,
    owner: &str,
    name: &str,
    base_ref: &str,
    max_owners_files: usize,
) -> Result<(RepositorySnapshot, OwnersIndex), AppError> {
    let snapshot = client
        .fetch_repository_snapshot(ctx, owner, name, 100)
        .await
        .map_err(AppError::from)?;
    let owners_files = client
        .fetch_owners_files(ctx, owner, name, base_ref)
        .await
        .unwrap_or_default();
    let (index, _skipped) = OwnersIndex::build(owners_files, max_owners_files);
    Ok((snapshot, index))
}

/// Event routing (§4.1 step 3): `push` skips the repository snapshot
/// entirely (no PR context); `pull_request` reconstructs its view from
/// the payload; everything else that needs PR context fetches it via
/// GraphQL; unrecognized events are a no-op.
async fn route_event(
    state: &AppState,
    ctx: &DeliveryContext,
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<(), AppError> {
    match event_type {
        "push" => handle_push(state, ctx, payload).await,
        "pull_request" => handle_pull_request(state, ctx, payload).await,
        "issue_comment" => handle_issue_comment(state, ctx, payload).await,
        "pull_request_review" => handle_pull_request_review(state, ctx, payload).await,
        "check_run" => handle_check_run(state, ctx, payload).await,
        _ => Ok(()),
    }
}

async fn handle_push(state: &AppState, ctx: &DeliveryContext, payload: &serde_json::Value) -> Result<(), AppError> {
    let git_ref = payload.get("ref").and_then(|v| v.as_str()).unwrap_or_default();
    let Some(tag_name) = crate::push::tag_name_from_ref(git_ref) else {
        return Ok(());
    };

    let full_name = ctx.repository_full_name.clone();
    let (owner, name) = split_full_name(&full_name);
    let repo_config = state.config.repositories.get(&full_name);

    ctx.start_step("push_tag_release");
    let plan = crate::push::plan_push(
        Some(tag_name),
        repo_config.and_then(|r| r.pypi.as_ref()).is_some(),
        repo_config.and_then(|r| r.container.as_ref()).map(|c| c.release).unwrap_or(false),
    );
    if let Some(plan) = plan {
        if plan.build_and_push_container {
            let owner = owner.to_string();
            let name = name.to_string();
            let tag_name = tag_name.to_string();
            state
                .background_tasks
                .spawn(async move { tracing::info!(%owner, %name, %tag_name, "container release build queued") })
                .await;
        }
    }
    ctx.complete_step("push_tag_release", Default::default());
    Ok(())
}

async fn handle_pull_request(state: &AppState, ctx: &DeliveryContext, payload: &serde_json::Value) -> Result<(), AppError> {
    let Some(pr) = pr_view_from_payload(payload) else {
        return Ok(());
    };
    let allow_draft_commands = payload.pointer("/action").and_then(|v| v.as_str()) == Some("synchronize");
    if pr.draft && !allow_draft_commands {
        // Draft PRs only process synchronize (keeps checks current); every
        // other event is suppressed until the PR is marked ready.
        return Ok(());
    }

    let Some(action) = payload.get("action").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    let Some(event) = pr_event_for_action(action, &pr, payload) else {
        return Ok(());
    };

    let full_name = ctx.repository_full_name.clone();
    let (owner, name) = split_full_name(&full_name);
    let repo_config = state.config.repositories.get(&full_name);
    let cfg = Config { remote: None, repository: repo_config, root: &state.config };

    ctx.start_step("pr_state_evaluation");
    let (snapshot, owners_index) = load_repo_context(&state.user_client, ctx, owner, name, &pr.base_ref, cfg.max_owners_files())
        .await
        .inspect_err(|_| ctx.fail_step("pr_state_evaluation", StepError { kind: "AppError".into(), message: "failed to load repository context".into(), traceback: None }))?;

    let changed_files = state
        .user_client
        .fetch_pr_changed_files(ctx, owner, name, pr.number)
        .await
        .unwrap_or_default();

    let owners = OwnersResolver::new(&owners_index, changed_files, &snapshot);

    let ops = state_machine::plan(&event, &pr, &owners);
    let op_ctx = OperationContext { state, owner, name, pr: &pr, repo_config, snapshot: &snapshot, owners: &owners };
    execute_operations(ctx, &op_ctx, &ops).await;
    ctx.complete_step("pr_state_evaluation", Default::default());
    Ok(())
}

/// Everything an [`Operation`] needs beyond the shared [`AppState`]/
/// [`DeliveryContext`]: the PR it concerns, the repository's config tier,
/// and the snapshot already fetched for this delivery.
struct OperationContext<'a> {
    state: &'a AppState,
    owner: &'a str,
    name: &'a str,
    pr: &'a PullRequestView,
    repo_config: Option<&'a crate::config::RepositoryConfig>,
    snapshot: &'a RepositorySnapshot,
    owners: &'a OwnersResolver<'a>,
}

impl<'a> OperationContext<'a> {
    fn cfg(&self) -> Config<'_> {
        Config { remote: None, repository: self.repo_config, root: &self.state.config }
    }

    fn tracking_issue_title(&self) -> String {
        format!("Tracking PR #{}", self.pr.number)
    }
}

/// Runs every planned operation to completion independently, recording each
/// as its own step; one operation's failure never prevents the others from
/// running ("collect all, log failures" fan-out, per §4.2.1).
async fn execute_operations(ctx: &DeliveryContext, op_ctx: &OperationContext<'_>, ops: &[Operation]) {
    let futures = ops.iter().map(|op| execute_operation(ctx, op_ctx, op));
    futures::future::join_all(futures).await;
}

async fn execute_operation(ctx: &DeliveryContext, op_ctx: &OperationContext<'_>, op: &Operation) {
    let state = op_ctx.state;
    let owner = op_ctx.owner;
    let name = op_ctx.name;
    let pr = op_ctx.pr;

    let step_name = format!("op:{op:?}");
    ctx.start_step(&step_name);
    let result: Result<(), AppError> = match op {
        Operation::PostWelcomeCommentIfMissing => {
            let body = format!("Thanks for the contribution, @{}! A maintainer will take a look shortly.", pr.author_login);
            state.user_client.post_comment(ctx, owner, name, pr.number, &body).await.map_err(AppError::from)
        }
        Operation::AddLabel(label) | Operation::RemoveLabel(label) => {
            let add = matches!(op, Operation::AddLabel(_));
            mutate_one_label(state, ctx, &pr.node_id, label, add).await
        }
        Operation::TransitionVerifiedCheck { to_success } => {
            upsert_verified_check(state, ctx, owner, name, &pr.head_sha, if *to_success { Some(true) } else { None }).await
        }
        Operation::RunConventionalTitleCheck => run_conventional_title_check(op_ctx, ctx).await,
        Operation::ToggleWipTitlePrefix => toggle_wip_title_prefix(op_ctx, ctx).await,
        Operation::OpenTrackingIssueIfMissing => open_tracking_issue_if_missing(op_ctx, ctx).await,
        Operation::CloseTrackingIssue => close_tracking_issue(op_ctx, ctx).await,
        Operation::SetAutomergeIfApplicable => set_automerge_if_applicable(op_ctx, ctx).await,
        Operation::RemoveAllReviewStateLabels => remove_all_review_state_labels(op_ctx, ctx).await,
        Operation::RequeueVerifiedCheck => upsert_verified_check(state, ctx, owner, name, &pr.head_sha, None).await,
        Operation::RunSetupAndCiPipeline => run_setup_and_ci_pipeline(op_ctx, ctx).await,
        Operation::CherryPick { branch } => cherry_pick(op_ctx, ctx, branch).await,
        Operation::TriggerReleaseContainerBuild => trigger_release_container_build(op_ctx, ctx).await,
        Operation::DelayThenReevaluateConflictsForOpenPrs => delay_then_reevaluate_conflicts(op_ctx, ctx).await,
        Operation::DeleteContainerTag => delete_container_tag(op_ctx, ctx).await,
        Operation::ReevaluateCanBeMerged => reevaluate_can_be_merged(op_ctx, ctx).await,
        Operation::NoOp => Ok(()),
    };

    match result {
        Ok(()) => ctx.complete_step(&step_name, Default::default()),
        Err(e) => {
            let critical = e.critical();
            ctx.fail_step(&step_name, StepError { kind: "AppError".into(), message: e.to_string(), traceback: None });
            if critical {
                ctx.fail_delivery(StepError { kind: "AppError".into(), message: e.to_string(), traceback: None });
            }
        }
    }
}

async fn mutate_one_label(state: &AppState, ctx: &DeliveryContext, labelable_id: &str, label: &str, add: bool) -> Result<(), AppError> {
    state
        .user_client
        .mutate_labels(ctx, labelable_id, &[label.to_string()], add)
        .await
        .map(|_| ())
        .map_err(AppError::from)
}

async fn upsert_verified_check(
    state: &AppState,
    ctx: &DeliveryContext,
    owner: &str,
    name: &str,
    head_sha: &str,
    conclusion_success: Option<bool>,
) -> Result<(), AppError> {
    let request = crate::github_api::CheckRunRequest {
        name: "verified",
        head_sha,
        status: Some(if conclusion_success.is_some() { "completed" } else { "queued" }),
        conclusion: conclusion_success.map(|ok| if ok { "success" } else { "failure" }),
        output: None,
    };
    state.app_client.upsert_check_run(ctx, owner, name, &request).await.map(|_| ()).map_err(AppError::from)
}

async fn run_conventional_title_check(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let prefixes = op_ctx.repo_config.and_then(|r| r.conventional_title.clone()).unwrap_or_default();
    if prefixes.is_empty() {
        return Ok(());
    }
    let matches = crate::runner::conventional_title_matches(&op_ctx.pr.title, &prefixes);
    let request = crate::github_api::CheckRunRequest {
        name: "conventional-title",
        head_sha: &op_ctx.pr.head_sha,
        status: Some("completed"),
        conclusion: Some(if matches { "success" } else { "failure" }),
        output: None,
    };
    op_ctx
        .state
        .app_client
        .upsert_check_run(ctx, op_ctx.owner, op_ctx.name, &request)
        .await
        .map(|_| ())
        .map_err(AppError::from)
}

/// `[WIP]`/`WIP:`-prefixed titles get the `wip` label; any other title has
/// it removed if present. Idempotent, so re-running on an unrelated edit is
/// harmless.
async fn toggle_wip_title_prefix(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let lowered = op_ctx.pr.title.trim().to_ascii_lowercase();
    let has_marker = lowered.starts_with("wip:") || lowered.starts_with("[wip]") || lowered.starts_with("wip ");
    let has_label = op_ctx.pr.has_label(crate::models::static_labels::WIP.0);
    if has_marker == has_label {
        return Ok(());
    }
    mutate_one_label(op_ctx.state, ctx, &op_ctx.pr.node_id, crate::models::static_labels::WIP.0, has_marker).await
}

async fn open_tracking_issue_if_missing(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    if !op_ctx.cfg().create_issue_for_new_pr() {
        return Ok(());
    }
    let title = op_ctx.tracking_issue_title();
    if op_ctx.snapshot.open_issues.iter().any(|i| i.title == title) {
        return Ok(());
    }
    let body = format!("Tracking #{}: {}", op_ctx.pr.number, op_ctx.pr.title);
    op_ctx
        .state
        .user_client
        .create_issue(ctx, op_ctx.owner, op_ctx.name, &title, &body)
        .await
        .map(|_| ())
        .map_err(AppError::from)
}

async fn close_tracking_issue(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let title = op_ctx.tracking_issue_title();
    let Some(issue) = op_ctx.snapshot.open_issues.iter().find(|i| i.title == title) else {
        return Ok(());
    };
    op_ctx
        .state
        .user_client
        .close_issue(ctx, op_ctx.owner, op_ctx.name, issue.number)
        .await
        .map_err(AppError::from)
}

async fn set_automerge_if_applicable(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let targets = op_ctx.repo_config.and_then(|r| r.set_auto_merge_prs.as_deref()).unwrap_or(&[]);
    let applies = targets.iter().any(|t| t == "*" || t == &op_ctx.pr.base_ref);
    if !applies {
        return Ok(());
    }
    mutate_one_label(op_ctx.state, ctx, &op_ctx.pr.node_id, crate::models::static_labels::AUTOMERGE.0, true).await
}

async fn remove_all_review_state_labels(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let to_remove: Vec<String> = op_ctx
        .pr
        .labels
        .iter()
        .filter(|l| crate::models::DYNAMIC_PREFIXES.iter().any(|(prefix, _)| l.starts_with(*prefix)))
        .cloned()
        .collect();
    for label in to_remove {
        mutate_one_label(op_ctx.state, ctx, &op_ctx.pr.node_id, &label, false).await?;
    }
    Ok(())
}

/// `/assign-reviewer(s)`-equivalent performed automatically as part of
/// setup: reviewers and approvers over the PR's changed files, minus the
/// author, capped at two (§4.2.1 "assign_reviewers").
async fn assign_owners_reviewers(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let mut reviewers: Vec<String> =
        op_ctx.owners.reviewers_for_pr().into_iter().chain(op_ctx.owners.approvers_for_pr()).collect();
    reviewers.retain(|r| r != &op_ctx.pr.author_login);
    reviewers.sort();
    reviewers.dedup();
    reviewers.truncate(2);
    op_ctx
        .state
        .user_client
        .request_reviewers(ctx, op_ctx.owner, op_ctx.name, op_ctx.pr.number, &reviewers)
        .await
        .map_err(AppError::from)
}

/// `has-conflicts`/`needs-rebase` labels (§4.2.1 "conflict_labels"):
/// `mergeable == false` is a real content conflict; otherwise a diverged
/// or behind comparison against the base branch means the PR merely needs
/// a rebase.
async fn compute_conflict_labels(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let pr = op_ctx.pr;
    let has_conflicts = pr.mergeable == Mergeable::False;
    mutate_one_label(op_ctx.state, ctx, &pr.node_id, crate::models::static_labels::HAS_CONFLICTS.0, has_conflicts).await?;

    let needs_rebase = if has_conflicts {
        false
    } else {
        match op_ctx
            .state
            .user_client
            .compare_commits(ctx, op_ctx.owner, op_ctx.name, &pr.base_ref, &pr.head_sha)
            .await
        {
            Ok(status) => status == "diverged" || status == "behind",
            Err(_) => false,
        }
    };
    mutate_one_label(op_ctx.state, ctx, &pr.node_id, crate::models::static_labels::NEEDS_REBASE.0, needs_rebase).await
}

/// PR-author-as-assignee, falling back to a root OWNERS approver when the
/// author isn't a known contributor (e.g. a first-time external PR) —
/// §4.2.1 "assign_author_or_fallback".
async fn assign_author_or_fallback(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let assignee = if op_ctx.snapshot.is_contributor(&op_ctx.pr.author_login) {
        op_ctx.pr.author_login.clone()
    } else {
        op_ctx
            .owners
            .index
            .root()
            .and_then(|r| r.approvers.first().cloned())
            .unwrap_or_else(|| op_ctx.pr.author_login.clone())
    };
    op_ctx
        .state
        .user_client
        .add_assignees(ctx, op_ctx.owner, op_ctx.name, op_ctx.pr.number, &[assignee])
        .await
        .map_err(AppError::from)
}

/// Runs one named CI-stage check end to end: transitions the check to
/// in-progress, acquires a scoped workspace clone, shells out, and
/// transitions the check to its final state — the template every CI-stage
/// runner and `/retest` share. Unrecognized names (custom checks, branch
/// protection contexts this process doesn't itself satisfy) are left
/// queued for whatever external system owns them.
async fn run_named_check(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext, check_name: &str) -> Result<(), AppError> {
    match check_name {
        "tox" => {
            let python_version = op_ctx.repo_config.and_then(|r| r.tox_python_version.as_deref());
            let (program, args) = crate::runner::tox_command(python_version);
            run_workspace_check(op_ctx, ctx, "tox", &program, args, false).await
        }
        "pre-commit" => {
            let (program, args) = crate::runner::pre_commit_command();
            run_workspace_check(op_ctx, ctx, "pre-commit", &program, args, false).await
        }
        "python-module-install" => {
            let (program, args) = crate::runner::python_module_install_command();
            run_workspace_check(op_ctx, ctx, "python-module-install", &program, args, false).await
        }
        "build-container" => {
            let Some(container) = op_ctx.repo_config.and_then(|r| r.container.as_ref()) else {
                return Ok(());
            };
            let tag = format!("pr-{}", op_ctx.pr.number);
            let (program, args) = crate::runner::container_build_command(container, &tag);
            run_workspace_check(op_ctx, ctx, "build-container", &program, args, true).await
        }
        "conventional-title" => run_conventional_title_check(op_ctx, ctx).await,
        "verified" => upsert_verified_check(op_ctx.state, ctx, op_ctx.owner, op_ctx.name, &op_ctx.pr.head_sha, None).await,
        other => {
            let request = crate::github_api::CheckRunRequest {
                name: other,
                head_sha: &op_ctx.pr.head_sha,
                status: Some("queued"),
                conclusion: None,
                output: None,
            };
            op_ctx.state.app_client.upsert_check_run(ctx, op_ctx.owner, op_ctx.name, &request).await.map(|_| ()).map_err(AppError::from)
        }
    }
}

/// Shared set-in-progress -> acquire-workspace -> shell-out ->
/// transition-check template used by every CI-stage runner.
async fn run_workspace_check(
    op_ctx: &OperationContext<'_>,
    ctx: &DeliveryContext,
    check_name: &str,
    program: &str,
    args: Vec<String>,
    is_podman: bool,
) -> Result<(), AppError> {
    let state = op_ctx.state;
    let pr = op_ctx.pr;

    let in_progress = crate::github_api::CheckRunRequest {
        name: check_name,
        head_sha: &pr.head_sha,
        status: Some("in_progress"),
        conclusion: None,
        output: None,
    };
    state.app_client.upsert_check_run(ctx, op_ctx.owner, op_ctx.name, &in_progress).await.map_err(AppError::from)?;

    let clone_url = format!("https://github.com/{}/{}.git", op_ctx.owner, op_ctx.name);
    let redaction = crate::redact::RedactionList::new().with(state.user_client.token());
    let prepare_args = crate::workspace::PrepareArgs {
        clone_url: &clone_url,
        token: state.user_client.token(),
        owner_name: CHERRY_PICK_BOT_NAME,
        owner_email: CHERRY_PICK_BOT_EMAIL,
        checkout: None,
        pull_request_number: Some(pr.number),
        base_ref: Some(&pr.base_ref),
        is_merged: pr.merged,
        tag_name: None,
    };

    let (success, text) = match crate::workspace::prepare(&state.data_dir, &redaction, &prepare_args).await {
        Ok((workspace, outcome)) if outcome.success => {
            let run_outcome = if is_podman {
                crate::runner::run_podman(&args, &workspace.path, crate::runner::DEFAULT_TIMEOUT_SECS, &redaction).await
            } else {
                crate::runner::run_command(program, &args, &workspace.path, &[], crate::runner::DEFAULT_TIMEOUT_SECS, &redaction).await
            };
            (run_outcome.success, crate::checks::prepare_check_text(&run_outcome.stdout, &run_outcome.stderr, &redaction))
        }
        Ok((_, outcome)) => (false, crate::checks::prepare_check_text(&outcome.stdout, &outcome.stderr, &redaction)),
        Err(e) => (false, e.to_string()),
    };

    let request = crate::github_api::CheckRunRequest {
        name: check_name,
        head_sha: &pr.head_sha,
        status: Some("completed"),
        conclusion: Some(if success { "success" } else { "failure" }),
        output: Some(crate::github_api::CheckRunOutput {
            title: check_name,
            summary: if success { "passed" } else { "failed" },
            text: Some(&text),
        }),
    };
    state.app_client.upsert_check_run(ctx, op_ctx.owner, op_ctx.name, &request).await.map(|_| ()).map_err(AppError::from)
}

/// Two-stage setup+CI pipeline (§4.2.1): the setup stage runs reviewer
/// assignment, branch/size/conflict labels, the verified-check reset
/// policy, and author-assignment synchronously; the CI stage actually
/// invokes tox/pre-commit/python-module-install/container-build through
/// [`run_named_check`] rather than only queuing them, and queues whatever
/// remaining required checks this process doesn't itself run (custom
/// checks, external branch-protection contexts).
async fn run_setup_and_ci_pipeline(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let state = op_ctx.state;
    let pr = op_ctx.pr;
    let cfg = op_ctx.cfg();

    assign_owners_reviewers(op_ctx, ctx).await?;

    mutate_one_label(state, ctx, &pr.node_id, &format!("{}{}", crate::models::BRANCH_PREFIX, pr.base_ref), true).await?;

    compute_conflict_labels(op_ctx, ctx).await?;

    let thresholds = crate::labels::resolve_size_thresholds(op_ctx.repo_config.and_then(|r| r.pr_size_thresholds.as_ref()));
    let size_label = crate::labels::size_label_name(pr.size(), &thresholds);
    mutate_one_label(state, ctx, &pr.node_id, &size_label, true).await?;

    let auto_verified = cfg.auto_verified_and_merged_users().contains(&pr.author_login);
    let has_cherry_picked = pr.has_label(crate::models::static_labels::CHERRY_PICKED.0);
    match state_machine::verified_reset_policy(has_cherry_picked, cfg.auto_verify_cherry_picked_prs(), auto_verified) {
        state_machine::VerifiedResetOutcome::QueueOnly => {
            upsert_verified_check(state, ctx, op_ctx.owner, op_ctx.name, &pr.head_sha, None).await?;
        }
        state_machine::VerifiedResetOutcome::AddVerifiedAndSucceed => {
            upsert_verified_check(state, ctx, op_ctx.owner, op_ctx.name, &pr.head_sha, Some(true)).await?;
            mutate_one_label(state, ctx, &pr.node_id, crate::models::static_labels::VERIFIED.0, true).await?;
        }
        state_machine::VerifiedResetOutcome::RemoveVerifiedAndQueue => {
            mutate_one_label(state, ctx, &pr.node_id, crate::models::static_labels::VERIFIED.0, false).await?;
            upsert_verified_check(state, ctx, op_ctx.owner, op_ctx.name, &pr.head_sha, None).await?;
        }
    }

    assign_author_or_fallback(op_ctx, ctx).await?;

    let tox = op_ctx.repo_config.and_then(|r| r.tox).unwrap_or(false);
    let pre_commit = op_ctx.repo_config.and_then(|r| r.pre_commit).unwrap_or(false);
    let python_module_install = op_ctx.repo_config.and_then(|r| r.pypi.as_ref()).is_some();
    let build_container = op_ctx.repo_config.map(|r| r.container.is_some()).unwrap_or(false);

    let required = crate::checks::required_check_set(
        &[],
        false,
        tox,
        op_ctx.repo_config.and_then(|r| r.verified_job).unwrap_or(false),
        build_container,
        python_module_install,
        op_ctx.repo_config.map(|r| r.conventional_title.is_some()).unwrap_or(false),
        pre_commit,
        &op_ctx
            .repo_config
            .and_then(|r| r.custom_check_runs.as_ref())
            .into_iter()
            .flatten()
            .filter(|c| c.mandatory)
            .map(|c| c.name.clone())
            .collect::<Vec<_>>(),
    );

    let mut active: Vec<&str> = Vec::new();
    if tox {
        active.push("tox");
    }
    if pre_commit {
        active.push("pre-commit");
    }
    if python_module_install {
        active.push("python-module-install");
    }
    if build_container {
        active.push("build-container");
    }
    active.push("conventional-title");
    for check_name in &active {
        run_named_check(op_ctx, ctx, check_name).await?;
    }

    let handled: HashSet<&str> = active.iter().copied().chain(["verified", crate::checks::CAN_BE_MERGED_CHECK]).collect();
    for check_name in required.iter().filter(|n| !handled.contains(n.as_str())) {
        let request = crate::github_api::CheckRunRequest {
            name: check_name,
            head_sha: &pr.head_sha,
            status: Some("queued"),
            conclusion: None,
            output: None,
        };
        state.app_client.upsert_check_run(ctx, op_ctx.owner, op_ctx.name, &request).await.map_err(AppError::from)?;
    }
    Ok(())
}

const CHERRY_PICK_BOT_NAME: &str = "webhook-server";
const CHERRY_PICK_BOT_EMAIL: &str = "webhook-server@users.noreply.github.com";

async fn cherry_pick(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext, target_branch: &str) -> Result<(), AppError> {
    let state = op_ctx.state;
    let pr = op_ctx.pr;
    let Some(merge_commit_sha) = pr.merge_commit_sha.clone() else {
        return Ok(());
    };

    let clone_url = format!("https://github.com/{}/{}.git", op_ctx.owner, op_ctx.name);
    let redaction = crate::redact::RedactionList::new().with(state.user_client.token());
    let prepare_args = crate::workspace::PrepareArgs {
        clone_url: &clone_url,
        token: state.user_client.token(),
        owner_name: CHERRY_PICK_BOT_NAME,
        owner_email: CHERRY_PICK_BOT_EMAIL,
        checkout: Some(target_branch),
        pull_request_number: None,
        base_ref: None,
        is_merged: false,
        tag_name: None,
    };

    let cherry_pick_branch = crate::runner::cherry_pick_branch_name(&pr.head_ref);
    let failed = match crate::workspace::prepare(&state.data_dir, &redaction, &prepare_args).await {
        Ok((workspace, outcome)) if outcome.success => {
            let branch_outcome = crate::runner::run_command(
                "git",
                &["checkout".to_string(), "-b".to_string(), cherry_pick_branch.clone()],
                &workspace.path,
                &[],
                crate::runner::DEFAULT_TIMEOUT_SECS,
                &redaction,
            )
            .await;
            let pick_outcome = if branch_outcome.success {
                crate::runner::run_command(
                    "git",
                    &["cherry-pick".to_string(), merge_commit_sha.clone()],
                    &workspace.path,
                    &[],
                    crate::runner::DEFAULT_TIMEOUT_SECS,
                    &redaction,
                )
                .await
            } else {
                branch_outcome
            };
            if pick_outcome.success {
                let authenticated_url = clone_url.replacen("https://", &format!("https://x-access-token:{}@", state.user_client.token()), 1);
                let push_outcome = crate::runner::run_command(
                    "git",
                    &["push".to_string(), authenticated_url, cherry_pick_branch.clone()],
                    &workspace.path,
                    &[],
                    crate::runner::DEFAULT_TIMEOUT_SECS,
                    &redaction,
                )
                .await;
                !push_outcome.success
            } else {
                true
            }
        }
        _ => true,
    };

    if failed {
        let body = crate::runner::manual_cherry_pick_instructions(pr.number, target_branch, &merge_commit_sha);
        return state.user_client.post_comment(ctx, op_ctx.owner, op_ctx.name, pr.number, &body).await.map_err(AppError::from);
    }

    let title = format!("[cherry-pick] {} (#{})", pr.title, pr.number);
    let body = format!("Automatic cherry-pick of #{} onto `{target_branch}`.", pr.number);
    state
        .user_client
        .create_pull_request(ctx, op_ctx.owner, op_ctx.name, &title, &cherry_pick_branch, target_branch, &body)
        .await
        .map(|_| ())
        .map_err(AppError::from)
}

/// Builds and pushes the release container image tagged with the merged
/// PR's merge commit SHA plus `container.tag`, reusing the same
/// clone-then-shell-out template the CI-stage container check uses.
async fn trigger_release_container_build(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let state = op_ctx.state;
    let Some(container) = op_ctx.repo_config.and_then(|r| r.container.as_ref()) else {
        return Ok(());
    };
    if !container.release {
        return Ok(());
    }
    let image_tag = container.tag.clone().unwrap_or_else(|| "latest".to_string());
    let clone_url = format!("https://github.com/{}/{}.git", op_ctx.owner, op_ctx.name);
    let redaction = crate::redact::RedactionList::new().with(state.user_client.token());
    let prepare_args = crate::workspace::PrepareArgs {
        clone_url: &clone_url,
        token: state.user_client.token(),
        owner_name: CHERRY_PICK_BOT_NAME,
        owner_email: CHERRY_PICK_BOT_EMAIL,
        checkout: None,
        pull_request_number: None,
        base_ref: Some(&op_ctx.pr.base_ref),
        is_merged: true,
        tag_name: None,
    };

    let (workspace, outcome) = crate::workspace::prepare(&state.data_dir, &redaction, &prepare_args).await?;
    if !outcome.success {
        return Ok(());
    }
    let (_, build_args) = crate::runner::container_build_command(container, &image_tag);
    let build_outcome =
        crate::runner::run_podman(&build_args, &workspace.path, crate::runner::DEFAULT_TIMEOUT_SECS, &redaction).await;
    if !build_outcome.success {
        let body = crate::checks::prepare_check_text(&build_outcome.stdout, &build_outcome.stderr, &redaction);
        return state
            .user_client
            .post_comment(ctx, op_ctx.owner, op_ctx.name, op_ctx.pr.number, &format!("Release container build failed:\n\n{body}"))
            .await
            .map_err(AppError::from);
    }
    let (_, push_args) = crate::runner::container_push_command(container, &image_tag);
    let push_outcome =
        crate::runner::run_podman(&push_args, &workspace.path, crate::runner::DEFAULT_TIMEOUT_SECS, &redaction).await;
    if !push_outcome.success {
        let body = crate::checks::prepare_check_text(&push_outcome.stdout, &push_outcome.stderr, &redaction);
        return state
            .user_client
            .post_comment(ctx, op_ctx.owner, op_ctx.name, op_ctx.pr.number, &format!("Release container push failed:\n\n{body}"))
            .await
            .map_err(AppError::from);
    }
    Ok(())
}

/// Open PRs whose mergeability may have flipped because another PR just
/// merged get a delayed re-evaluation, giving GitHub time to update its own
/// `mergeable` computation before this process re-checks it.
async fn delay_then_reevaluate_conflicts(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    let state = op_ctx.state;
    for summary in &op_ctx.snapshot.open_pull_requests {
        let path = format!("/repos/{}/{}/pulls/{}", op_ctx.owner, op_ctx.name, summary.number);
        let Ok(rest_pr) = state.user_client.rest_get(ctx, &path).await else {
            continue;
        };
        let wrapped = json!({ "pull_request": rest_pr });
        let Some(pr) = pr_view_from_payload(&wrapped) else {
            continue;
        };
        let changed_files = state.user_client.fetch_pr_changed_files(ctx, op_ctx.owner, op_ctx.name, summary.number).await.unwrap_or_default();
        let owners = OwnersResolver::new(op_ctx.owners.index, changed_files, op_ctx.snapshot);
        let inner_ctx = OperationContext {
            state,
            owner: op_ctx.owner,
            name: op_ctx.name,
            pr: &pr,
            repo_config: op_ctx.repo_config,
            snapshot: op_ctx.snapshot,
            owners: &owners,
        };
        compute_conflict_labels(&inner_ctx, ctx).await?;
    }
    Ok(())
}

async fn delete_container_tag(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let Some(container) = op_ctx.repo_config.and_then(|r| r.container.as_ref()) else {
        return Ok(());
    };
    let pr_tag = format!("pr-{}", op_ctx.pr.number);
    let package_name = container.repository.rsplit('/').next().unwrap_or(&container.repository);
    let versions = op_ctx
        .state
        .user_client
        .list_package_versions(ctx, crate::external::RegistryScope::Org, op_ctx.owner, "container", package_name)
        .await
        .map_err(AppError::from)?;
    let Some(version_id) = crate::external::find_ghcr_version_id(&versions, &pr_tag) else {
        return Ok(());
    };
    let path = crate::external::ghcr_delete_path(crate::external::RegistryScope::Org, op_ctx.owner, "container", package_name, version_id);
    op_ctx.state.user_client.delete_package_version_at_path(ctx, &path).await.map_err(AppError::from)
}

async fn reevaluate_can_be_merged(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext) -> Result<(), AppError> {
    let state = op_ctx.state;
    let pr = op_ctx.pr;
    let cfg = op_ctx.cfg();

    let required = ctx
        .required_checks
        .get_or_init(|| async {
            crate::checks::required_check_set(
                &[],
                false,
                op_ctx.repo_config.and_then(|r| r.tox).unwrap_or(false),
                op_ctx.repo_config.and_then(|r| r.verified_job).unwrap_or(false),
                op_ctx.repo_config.map(|r| r.container.is_some()).unwrap_or(false),
                false,
                op_ctx.repo_config.map(|r| r.conventional_title.is_some()).unwrap_or(false),
                op_ctx.repo_config.and_then(|r| r.pre_commit).unwrap_or(false),
                &op_ctx
                    .repo_config
                    .and_then(|r| r.custom_check_runs.as_ref())
                    .into_iter()
                    .flatten()
                    .filter(|c| c.mandatory)
                    .map(|c| c.name.clone())
                    .collect::<Vec<_>>(),
            )
        })
        .await
        .clone();

    let check_runs = state.user_client.list_check_runs_for_ref(ctx, op_ctx.owner, op_ctx.name, &pr.head_sha).await.unwrap_or_default();
    let statuses = state.user_client.list_commit_statuses_for_ref(ctx, op_ctx.owner, op_ctx.name, &pr.head_sha).await.unwrap_or_default();
    let states = crate::checks::evaluate_required_checks(&required, &check_runs, &statuses);
    let required_check_states: Vec<(&str, crate::checks::RequiredCheckState)> =
        states.iter().map(|(k, v)| (k.as_str(), *v)).collect();

    let present_labels: HashSet<String> = pr.labels.iter().cloned().collect();
    let changes_requested: Vec<String> = pr.review_state_users("changes-requested-by-").into_iter().collect();
    let lgtm_users = pr.review_state_users("lgtm-by-");
    let approved_users = pr.review_state_users("approved-by-");

    let owners = op_ctx.owners;
    let pr_approvers = owners.approvers_for_pr();
    let pr_reviewers = owners.reviewers_for_pr();
    let root_entry = owners.index.root();
    let root_approvers: HashSet<String> = root_entry.map(|r| r.approvers.iter().cloned().collect()).unwrap_or_default();
    let mut root_reviewers_and_approvers: HashSet<String> =
        root_entry.map(|r| r.reviewers.iter().cloned().collect()).unwrap_or_default();
    root_reviewers_and_approvers.extend(root_approvers.iter().cloned());
    let owners_directories: Vec<(HashSet<String>,)> = owners
        .index
        .owners_data_for_changed_files(&owners.changed_files)
        .into_iter()
        .map(|(_, entry)| (entry.approvers.iter().cloned().collect(),))
        .collect();
    let missing_approvers =
        state_machine::compute_missing_approvers(&pr_approvers, &approved_users, &root_approvers, &owners_directories);
    let lgtm_count = state_machine::compute_lgtm_count(&lgtm_users, &pr_reviewers, &root_reviewers_and_approvers, &pr.author_login);

    let input = state_machine::MergeEvaluationInput {
        merged: pr.merged,
        mergeable_false: pr.mergeable == Mergeable::False,
        required_check_states: &required_check_states,
        hold: pr.has_label(crate::models::static_labels::HOLD.0),
        wip: pr.has_label(crate::models::static_labels::WIP.0),
        required_labels: cfg.can_be_merged_required_labels(),
        present_labels: &present_labels,
        changes_requested_by_approvers: &changes_requested,
        missing_approvers: &missing_approvers,
        lgtm_count,
        minimum_lgtm: cfg.minimum_lgtm(),
    };

    let (ok, summary) = match state_machine::evaluate_can_be_merged(&input) {
        state_machine::MergeEvaluation::AlreadyMerged => (true, "already merged".to_string()),
        state_machine::MergeEvaluation::Result { ok, reasons } => {
            (ok, if ok { "all required conditions met".to_string() } else { reasons.join("; ") })
        }
    };

    let request = crate::github_api::CheckRunRequest {
        name: crate::checks::CAN_BE_MERGED_CHECK,
        head_sha: &pr.head_sha,
        status: Some("completed"),
        conclusion: Some(if ok { "success" } else { "failure" }),
        output: Some(crate::github_api::CheckRunOutput { title: crate::checks::CAN_BE_MERGED_CHECK, summary: &summary, text: None }),
    };
    state.app_client.upsert_check_run(ctx, op_ctx.owner, op_ctx.name, &request).await.map_err(AppError::from)?;
    mutate_one_label(state, ctx, &pr.node_id, crate::models::static_labels::CAN_BE_MERGED.0, ok).await
}

/// Queues each named check as freshly in-progress, used by `/retest`. Each
/// queue is its own check-run creation; a later CI run transitions it to
/// success/failure the same way the original run would have.
/// `/retest [check ...]`: re-runs each named check through the same
/// template [`run_setup_and_ci_pipeline`]'s CI stage uses, rather than only
/// flipping it back to `queued` and waiting on an external system to pick
/// it up again.
async fn queue_checks(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext, checks: &[String]) -> Result<(), AppError> {
    for check_name in checks {
        run_named_check(op_ctx, ctx, check_name).await?;
    }
    Ok(())
}

/// `/assign-reviewer(s)`: an explicit login is requested verbatim; absent
/// one, up to two maintainers other than the PR author are picked.
async fn assign_reviewers_cmd(op_ctx: &OperationContext<'_>, ctx: &DeliveryContext, explicit: Option<&str>) -> Result<(), AppError> {
    let state = op_ctx.state;
    let pr = op_ctx.pr;
    let reviewers: Vec<String> = match explicit {
        Some(login) if !login.is_empty() => vec![login.to_string()],
        _ => op_ctx.snapshot.maintainers().filter(|m| *m != pr.author_login).take(2).map(str::to_string).collect(),
    };
    state.user_client.request_reviewers(ctx, op_ctx.owner, op_ctx.name, pr.number, &reviewers).await.map_err(AppError::from)
}

/// Re-evaluates `can-be-merged` for every open PR named by a completed
/// check-run. The check-run webhook carries only a minimal PR stub, so the
/// full view is pulled from the REST "get a pull request" endpoint, whose
/// JSON shape mirrors the `pull_request` object in the `pull_request`
/// webhook closely enough to reuse the same payload parser.
async fn handle_check_run(state: &AppState, ctx: &DeliveryContext, payload: &serde_json::Value) -> Result<(), AppError> {
    if payload.pointer("/check_run/status").and_then(|v| v.as_str()) != Some("completed") {
        return Ok(());
    }
    let full_name = ctx.repository_full_name.clone();
    let (owner, name) = split_full_name(&full_name);
    let pr_numbers: Vec<u64> = payload
        .pointer("/check_run/pull_requests")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|p| p.get("number").and_then(|v| v.as_u64()))
        .collect();
    if pr_numbers.is_empty() {
        return Ok(());
    }
    let repo_config = state.config.repositories.get(&full_name);
    let cfg = Config { remote: None, repository: repo_config, root: &state.config };

    ctx.start_step("check_run_reevaluation");
    let snapshot = match state.user_client.fetch_repository_snapshot(ctx, owner, name, 100).await {
        Ok(s) => s,
        Err(e) => {
            let err = AppError::from(e);
            ctx.fail_step("check_run_reevaluation", StepError { kind: "AppError".into(), message: err.to_string(), traceback: None });
            return Err(err);
        }
    };
    let owners_files = state.user_client.fetch_owners_files(ctx, owner, name, "HEAD").await.unwrap_or_default();
    let (owners_index, _skipped) = OwnersIndex::build(owners_files, cfg.max_owners_files());
    for number in pr_numbers {
        let path = format!("/repos/{owner}/{name}/pulls/{number}");
        let Ok(rest_pr) = state.user_client.rest_get(ctx, &path).await else {
            continue;
        };
        let wrapped = json!({ "pull_request": rest_pr });
        let Some(pr) = pr_view_from_payload(&wrapped) else {
            continue;
        };
        let changed_files = state.user_client.fetch_pr_changed_files(ctx, owner, name, number).await.unwrap_or_default();
        let owners = OwnersResolver::new(&owners_index, changed_files, &snapshot);
        let op_ctx = OperationContext { state, owner, name, pr: &pr, repo_config, snapshot: &snapshot, owners: &owners };
        if let Err(e) = reevaluate_can_be_merged(&op_ctx, ctx).await {
            ctx.fail_step("check_run_reevaluation", StepError { kind: "AppError".into(), message: e.to_string(), traceback: None });
            return Err(e);
        }
    }
    ctx.complete_step("check_run_reevaluation", Default::default());
    Ok(())
}

async fn handle_issue_comment(state: &AppState, ctx: &DeliveryContext, payload: &serde_json::Value) -> Result<(), AppError> {
    if payload.get("action").and_then(|v| v.as_str()) != Some("created") {
        return Ok(());
    }
    if payload.pointer("/issue/pull_request").is_none() {
        // Plain issue comment, not a PR comment; out of scope.
        return Ok(());
    }

    let Some(body) = payload.pointer("/comment/body").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    let Some(commenter) = payload.pointer("/comment/user/login").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    let Some(issue_node_id) = payload.pointer("/issue/node_id").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    let Some(pr_number) = payload.pointer("/issue/number").and_then(|v| v.as_u64()) else {
        return Ok(());
    };

    let full_name = ctx.repository_full_name.clone();
    let (owner, name) = split_full_name(&full_name);
    let repo_config = state.config.repositories.get(&full_name);
    let cfg = Config { remote: None, repository: repo_config, root: &state.config };

    ctx.start_step("issue_comment_commands");
    let snapshot = state.user_client.fetch_repository_snapshot(ctx, owner, name, 100).await.map_err(AppError::from)?;
    let owners_files = state.user_client.fetch_owners_files(ctx, owner, name, "HEAD").await.unwrap_or_default();
    let (owners_index, _skipped) = OwnersIndex::build(owners_files, cfg.max_owners_files());

    let rest_pr = state.user_client.rest_get(ctx, &format!("/repos/{owner}/{name}/pulls/{pr_number}")).await.ok();
    let pr_view = rest_pr.and_then(|v| pr_view_from_payload(&json!({ "pull_request": v })));
    let changed_files = state.user_client.fetch_pr_changed_files(ctx, owner, name, pr_number).await.unwrap_or_default();
    let owners = OwnersResolver::new(&owners_index, changed_files, &snapshot);

    // `/add-allowed-user` grants recorded in this process's lifetime are
    // folded in alongside the durable, comment-history-derived mechanism
    // (§4.3) so a grant takes effect immediately without waiting for the
    // comment to be re-fetched.
    let issue_comments = state.user_client.list_issue_comments(ctx, owner, name, pr_number).await.unwrap_or_default();
    let comment_refs: Vec<(&str, &str)> = issue_comments.iter().map(|(author, body)| (author.as_str(), body.as_str())).collect();
    let mut extra_allowed = owners.allowed_users_from_comments(comment_refs);
    extra_allowed.extend(state.allowed_users.snapshot(&full_name).await);
    if !owners.is_user_valid_to_run_commands(commenter, &extra_allowed) {
        let maintainers: Vec<&str> = snapshot.maintainers().collect();
        let body = format!(
            "@{commenter} is not authorized to run commands on this repository. Ask one of the maintainers ({}) or an OWNERS approver, or have a maintainer run `/add-allowed-user @{commenter}`.",
            maintainers.join(", ")
        );
        let _ = state.user_client.post_comment(ctx, owner, name, pr_number, &body).await;
        ctx.complete_step("issue_comment_commands", Default::default());
        return Ok(());
    }

    let configured: HashSet<String> = repo_config
        .and_then(|r| r.custom_check_runs.as_ref())
        .into_iter()
        .flatten()
        .map(|c| c.name.clone())
        .collect();

    let commands = commands::parse_commands(body);
    for cmd in &commands {
        if !commands::is_recognized(&cmd.name) {
            continue;
        }
        let Some(pr) = pr_view.as_ref() else { continue };
        if pr.draft && !commands::allowed_on_draft(&cmd.name, cfg.allow_commands_on_draft_prs()) {
            let body = format!("`/{}` is not allowed on draft pull requests in this repository.", cmd.name);
            let _ = state.user_client.post_comment(ctx, owner, name, pr_number, &body).await;
            continue;
        }

        let op_ctx = OperationContext { state, owner, name, pr, repo_config, snapshot: &snapshot, owners: &owners };
        match commands::resolve(cmd, &configured) {
            CommandEffect::ToggleLabel { label, add } => {
                let _ = state.user_client.mutate_labels(ctx, issue_node_id, &[label], add).await;
            }
            CommandEffect::RetestChecks(checks) => {
                let _ = queue_checks(&op_ctx, ctx, &checks).await;
            }
            CommandEffect::Reprocess => {
                let ops = [Operation::RunSetupAndCiPipeline, Operation::ReevaluateCanBeMerged];
                execute_operations(ctx, &op_ctx, &ops).await;
            }
            CommandEffect::CheckCanMerge => {
                let _ = reevaluate_can_be_merged(&op_ctx, ctx).await;
            }
            CommandEffect::CherryPick(branches) => {
                for branch in &branches {
                    let _ = cherry_pick(&op_ctx, ctx, branch).await;
                }
            }
            CommandEffect::AssignReviewers => {
                let _ = assign_reviewers_cmd(&op_ctx, ctx, None).await;
            }
            CommandEffect::AssignReviewer(login) => {
                let _ = assign_reviewers_cmd(&op_ctx, ctx, Some(&login)).await;
            }
            CommandEffect::BuildAndPushContainer(_args) => {
                let _ = trigger_release_container_build(&op_ctx, ctx).await;
            }
            CommandEffect::AcknowledgeAllowedUser(login) => {
                if !login.is_empty() {
                    state.allowed_users.grant(&full_name, &login).await;
                    let body = format!("@{login} is now allowed to run commands on this repository.");
                    let _ = state.user_client.post_comment(ctx, owner, name, pr_number, &body).await;
                }
            }
            CommandEffect::RegenerateWelcome => {
                let body = format!("Thanks for the contribution, @{}! A maintainer will take a look shortly.", pr.author_login);
                let _ = state.user_client.post_comment(ctx, owner, name, pr_number, &body).await;
            }
            CommandEffect::Unrecognized => {}
        }
    }
    ctx.complete_step("issue_comment_commands", Default::default());
    Ok(())
}

async fn handle_pull_request_review(state: &AppState, ctx: &DeliveryContext, payload: &serde_json::Value) -> Result<(), AppError> {
    if payload.get("action").and_then(|v| v.as_str()) != Some("submitted") {
        return Ok(());
    }
    let Some(raw_state) = payload.pointer("/review/state").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    let Some(reviewer) = payload.pointer("/review/user/login").and_then(|v| v.as_str()) else {
        return Ok(());
    };
    let Some(pr) = pr_view_from_payload(payload) else {
        return Ok(());
    };
    let body = payload.pointer("/review/body").and_then(|v| v.as_str()).unwrap_or_default();

    let raw = match raw_state {
        "approved" => RawReviewState::Approved,
        "changes_requested" => RawReviewState::ChangesRequested,
        _ => RawReviewState::Commented,
    };

    let full_name = ctx.repository_full_name.clone();
    let (owner, name) = split_full_name(&full_name);
    let repo_config = state.config.repositories.get(&full_name);
    let cfg = Config { remote: None, repository: repo_config, root: &state.config };

    ctx.start_step("review_state_projection");
    let (snapshot, owners_index) = load_repo_context(&state.user_client, ctx, owner, name, &pr.base_ref, cfg.max_owners_files())
        .await
        .inspect_err(|_| ctx.fail_step("review_state_projection", StepError { kind: "AppError".into(), message: "failed to load repository context".into(), traceback: None }))?;
    let owners = OwnersResolver::new(&owners_index, vec![], &snapshot);
    let extra_allowed = HashSet::new();
    let is_approver_or_root = owners.is_user_valid_to_run_commands(reviewer, &extra_allowed);

    let mut states = vec![review::review_state_for(raw)];
    if review::body_contains_approve_command(body) {
        states.push(ReviewState::Approve);
    }

    for state_value in states {
        if let Some(LabelProjection { target, paired_removal }) =
            labels::project_review_state(state_value, reviewer, &pr.author_login, is_approver_or_root)
        {
            if let Some(target) = target {
                let _ = state.user_client.mutate_labels(ctx, &pr.node_id, &[target], true).await;
            }
            if let Some(removal) = paired_removal {
                let _ = state.user_client.mutate_labels(ctx, &pr.node_id, &[removal], false).await;
            }
        }
    }
    ctx.complete_step("review_state_projection", Default::default());
    Ok(())
}
