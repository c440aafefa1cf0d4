#![warn(clippy::all, clippy::dbg_macro)]

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::post;
use axum::Router;
use clap::Parser;
use clap_verbosity_flag::InfoLevel;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

mod app;
mod audit_log;
mod checks;
mod commands;
mod config;
mod context;
mod dispatcher;
mod error;
mod external;
mod github_api;
mod ipallow;
mod labels;
mod models;
mod owners;
mod push;
mod redact;
mod review;
mod runner;
mod signature;
mod state_machine;
mod workspace;

#[cfg(all(
    not(target_family = "windows"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Receives GitHub repository events and drives the per-event PR workflow.
#[derive(Parser)]
#[command(about, version)]
struct App {
    /// Path to `config.yaml`.
    #[arg(long, env = "WEBHOOK_SERVER_CONFIG")]
    config: PathBuf,

    /// Directory for the audit log and the GitHub API response cache.
    #[arg(long, env = "WEBHOOK_SERVER_DATA_DIR", default_value = "/var/lib/webhook-server")]
    data_dir: PathBuf,

    /// Override the bind address (`ip-bind`:`port` in config otherwise).
    #[arg(long)]
    bind: Option<String>,

    /// Additional GitHub API token, appended to the configured token pool.
    #[arg(long, env = "GH_TOKEN")]
    gh_token: Option<String>,

    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity<InfoLevel>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // human-panic's crash report goes to a temp file, which is only useful
    // when a human can be pointed at it; under a supervisor (systemd,
    // a container orchestrator) stderr is what actually gets captured, so
    // this process only wires it up when attached to a real terminal.
    if std::io::stderr().is_terminal() {
        human_panic::setup_panic!();
    } else {
        std::panic::set_hook(Box::new(|info| {
            let trace = std::backtrace::Backtrace::force_capture();
            tracing::error!(%info, %trace, "webhook-server crashed; this is a bug");
        }));
    }

    let args = App::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.verbose.to_string())))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let root_config = config::RootConfig::from_path(&args.config)?;

    let mut tokens = root_config.github_tokens.clone();
    if let Some(extra) = args.gh_token {
        tokens.push(extra);
    }
    let primary_token = tokens.first().cloned().unwrap_or_default();

    let cache_dir = args.data_dir.join("http-cache");
    std::fs::create_dir_all(&cache_dir)?;

    let user_client = github_api::Client::new("https://api.github.com", primary_token.clone(), cache_dir.clone());
    let app_client = github_api::Client::new("https://api.github.com", primary_token, cache_dir);

    let http = reqwest::Client::builder().build()?;

    let ip_allow_list = if root_config.verify_github_ips || root_config.verify_cloudflare_ips {
        let mut cidrs = Vec::new();
        if root_config.verify_github_ips {
            cidrs.extend(ipallow::fetch_github_hook_cidrs(&http).await.unwrap_or_default());
        }
        if root_config.verify_cloudflare_ips {
            cidrs.extend(ipallow::fetch_cloudflare_cidrs(&http).await.unwrap_or_default());
        }
        ipallow::IpAllowList::from_cidrs(cidrs)
    } else {
        ipallow::IpAllowList::default()
    };

    let bind_addr = args
        .bind
        .or_else(|| {
            let ip = root_config.ip_bind.clone().unwrap_or_else(|| "0.0.0.0".to_string());
            root_config.port.map(|port| format!("{ip}:{port}"))
        })
        .unwrap_or_else(|| "0.0.0.0:8080".to_string());

    let state = Arc::new(app::AppState {
        audit_log: audit_log::AuditLog::new(args.data_dir.clone()),
        config: root_config,
        data_dir: args.data_dir,
        cache_dir,
        user_client,
        app_client,
        http,
        ip_allow_list,
        background_tasks: Arc::new(app::BackgroundTasks::default()),
        allowed_users: app::AllowedUserRegistry::default(),
    });

    let app = Router::new()
        .route("/webhook_server", post(dispatcher::handle_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "webhook server listening");
    axum::serve(listener, app).await?;

    state.background_tasks.drain().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_cmd::Command;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_required_config_flag() {
        App::command().debug_assert();
    }

    #[test]
    fn missing_config_flag_exits_nonzero() {
        Command::cargo_bin("webhook-server")
            .expect("binary built by this workspace")
            .assert()
            .failure();
    }
}
