//! Crate-wide error types.
//!
//! Mirrors the config/component error split used throughout this crate:
//! component-local `thiserror` enums convert into [`AppError`] via `#[from]`,
//! and call sites that only need to propagate use `anyhow::Result` directly.

use thiserror::Error;

use crate::config::ConfigError;
use crate::github_api::GithubApiError;
use crate::owners::OwnersError;
use crate::workspace::WorkspaceError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    GithubApi(#[from] GithubApiError),

    #[error(transparent)]
    Owners(#[from] OwnersError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("delivery cancelled")]
    Cancelled,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("authentication/authorization failure: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Sub-classifies upstream-API failures into critical (abort the
    /// delivery) vs. transient (log and degrade to a no-op), per the
    /// text-sniffing rule the reference implementation uses: any of
    /// "auth", "permission", "forbidden", "rate limit", "401", "403"
    /// appearing in the error text marks it critical.
    pub fn critical(&self) -> bool {
        match self {
            AppError::Unauthorized(_) => true,
            AppError::GithubApi(e) => e.is_critical(),
            AppError::Cancelled => false,
            other => {
                let text = other.to_string().to_ascii_lowercase();
                ["auth", "permission", "forbidden", "rate limit", "401", "403"]
                    .iter()
                    .any(|needle| text.contains(needle))
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
