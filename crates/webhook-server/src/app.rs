//! Process-wide application state.
//!
//! The only module-level mutable state this crate carries, per the design
//! notes: the startup IP-range cache and the background-task registry.
//! Everything delivery-scoped lives on [`crate::context::DeliveryContext`]
//! instead.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::audit_log::AuditLog;
use crate::config::RootConfig;
use crate::github_api::Client;
use crate::ipallow::IpAllowList;

/// In-process fast path for `/add-allowed-user` grants: authorization is
/// recomputed from scratch on every comment via
/// [`crate::owners::OwnersResolver::allowed_users_from_comments`], which
/// re-scans the issue's comment history, so this cache only saves that
/// re-fetch within a single process's uptime. Keyed by `owner/name`; a
/// restart drops it back to the comment-history-derived set, which is the
/// durable source of truth.
#[derive(Default)]
pub struct AllowedUserRegistry {
    by_repo: RwLock<HashMap<String, HashSet<String>>>,
}

impl AllowedUserRegistry {
    pub async fn grant(&self, repo_full_name: &str, login: &str) {
        self.by_repo
            .write()
            .await
            .entry(repo_full_name.to_string())
            .or_default()
            .insert(login.to_string());
    }

    pub async fn snapshot(&self, repo_full_name: &str) -> HashSet<String> {
        self.by_repo.read().await.get(repo_full_name).cloned().unwrap_or_default()
    }
}

/// Tracks fire-and-forget background tasks (test-oracle calls) so their
/// futures aren't dropped before completion. Entries are removed as they
/// finish; at shutdown the set is drained on a best-effort basis.
#[derive(Default)]
pub struct BackgroundTasks {
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub async fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(fut);
        self.handles.lock().await.push(handle);
        self.handles.lock().await.retain(|h| !h.is_finished());
    }

    pub async fn drain(&self) {
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

pub struct AppState {
    pub config: RootConfig,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub user_client: Client,
    pub app_client: Client,
    pub http: reqwest::Client,
    pub ip_allow_list: IpAllowList,
    pub background_tasks: Arc<BackgroundTasks>,
    pub audit_log: AuditLog,
    pub allowed_users: AllowedUserRegistry,
}

impl AppState {
    pub fn webhook_secret(&self) -> Option<&str> {
        self.config.webhook_secret.as_deref()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit_log
    }
}
