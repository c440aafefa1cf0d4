//! Three-tier configuration resolution.
//!
//! Tiers, consulted in order, first non-null hit wins:
//! 1. `.github-webhook-server.yaml` at the repository root, at the base ref
//!    of the PR being processed (fetched lazily, per delivery).
//! 2. The per-repository block in the central `config.yaml`.
//! 3. The root of `config.yaml`.
//!
//! An explicitly-null value in a higher-priority tier short-circuits to the
//! caller's default rather than falling through to the next tier: null is
//! an assertion of "use the default", not "continue searching".

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

pub(crate) const CONFIG_CANDIDATES: &[&str] = &["config.yaml", "config.yml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Inner(#[from] ConfigErrorInner),
}

#[derive(Debug, Error)]
pub enum ConfigErrorInner {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Syntax {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config is missing required key `repositories`")]
    MissingRepositories,
}

/// A single repository's block within `config.yaml`, plus the root-level
/// defaults it falls back to.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryConfig {
    #[serde(default)]
    pub tox: Option<bool>,
    #[serde(default)]
    pub tox_python_version: Option<String>,
    #[serde(default, rename = "pre-commit")]
    pub pre_commit: Option<bool>,
    #[serde(default)]
    pub pypi: Option<PypiConfig>,
    #[serde(default)]
    pub container: Option<ContainerConfig>,
    #[serde(default, rename = "conventional-title")]
    pub conventional_title: Option<Vec<String>>,
    #[serde(default, rename = "minimum-lgtm")]
    pub minimum_lgtm: Option<u32>,
    #[serde(default, rename = "verified-job")]
    pub verified_job: Option<bool>,
    #[serde(default, rename = "auto-verified-and-merged-users")]
    pub auto_verified_and_merged_users: Option<Vec<String>>,
    #[serde(default, rename = "auto-verify-cherry-picked-prs")]
    pub auto_verify_cherry_picked_prs: Option<bool>,
    #[serde(default, rename = "can-be-merged-required-labels")]
    pub can_be_merged_required_labels: Option<Vec<String>>,
    #[serde(default, rename = "set-auto-merge-prs")]
    pub set_auto_merge_prs: Option<Vec<String>>,
    #[serde(default, rename = "create-issue-for-new-pr")]
    pub create_issue_for_new_pr: Option<bool>,
    #[serde(default, rename = "allow-commands-on-draft-prs")]
    pub allow_commands_on_draft_prs: Option<Vec<String>>,
    #[serde(default, rename = "max-owners-files")]
    pub max_owners_files: Option<usize>,
    #[serde(default, rename = "pr-size-thresholds")]
    pub pr_size_thresholds: Option<HashMap<String, SizeThreshold>>,
    #[serde(default, rename = "slack-webhook-url")]
    pub slack_webhook_url: Option<String>,
    #[serde(default, rename = "default-status-checks")]
    pub default_status_checks: Option<Vec<String>>,
    #[serde(default, rename = "custom-check-runs")]
    pub custom_check_runs: Option<Vec<CustomCheckRun>>,
    #[serde(default, rename = "test-oracle")]
    pub test_oracle: Option<TestOracleConfig>,
    #[serde(default, rename = "enabled-labels")]
    pub enabled_labels: Option<Vec<String>>,
    #[serde(default, rename = "mask-sensitive-data")]
    pub mask_sensitive_data: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PypiConfig {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub repository: String,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    pub tag: Option<String>,
    #[serde(default, rename = "build-args")]
    pub build_args: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub release: bool,
}

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SizeThreshold {
    pub threshold: u64,
    pub color: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CustomCheckRun {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TestOracleConfig {
    #[serde(rename = "server-url")]
    pub server_url: String,
    #[serde(rename = "ai-provider")]
    pub ai_provider: Option<String>,
    #[serde(rename = "ai-model")]
    pub ai_model: Option<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default, rename = "test-patterns")]
    pub test_patterns: Vec<String>,
}

/// The root of `config.yaml`: process-wide settings plus the
/// `repositories` map of per-repo overrides.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RootConfig {
    #[serde(rename = "github-app-id")]
    pub github_app_id: Option<String>,
    #[serde(rename = "github-tokens", default)]
    pub github_tokens: Vec<String>,
    #[serde(rename = "webhook-ip")]
    pub webhook_ip: Option<String>,
    #[serde(rename = "webhook-secret")]
    pub webhook_secret: Option<String>,
    #[serde(rename = "ip-bind")]
    pub ip_bind: Option<String>,
    pub port: Option<u16>,
    #[serde(rename = "max-workers")]
    pub max_workers: Option<usize>,
    #[serde(rename = "verify-github-ips", default)]
    pub verify_github_ips: bool,
    #[serde(rename = "verify-cloudflare-ips", default)]
    pub verify_cloudflare_ips: bool,
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
    #[serde(rename = "log-file")]
    pub log_file: Option<String>,
    pub repositories: HashMap<String, RepositoryConfig>,
    #[serde(flatten)]
    pub defaults: RepositoryConfig,
}

impl RootConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigErrorInner> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigErrorInner::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: Self =
            serde_yaml::from_str(&text).map_err(|source| ConfigErrorInner::Syntax {
                path: path.to_path_buf(),
                source,
            })?;
        if parsed.repositories.is_empty() {
            return Err(ConfigErrorInner::MissingRepositories);
        }
        Ok(parsed)
    }
}

/// Raw per-repository override file fetched from the repository itself
/// (`.github-webhook-server.yaml`), the highest-priority tier. Parsed as a
/// loose YAML mapping since it need only supply a subset of keys.
#[derive(Debug, Clone, Default)]
pub struct RemoteRepoConfig(pub HashMap<String, Value>);

impl RemoteRepoConfig {
    pub fn parse(text: &str) -> Result<Self, serde_yaml::Error> {
        let value: HashMap<String, Value> = serde_yaml::from_str(text)?;
        Ok(Self(value))
    }
}

/// Combines the three tiers for a single repository and implements the
/// `get_value` lookup described in the design notes: the first tier that
/// defines the key at all (including an explicit YAML `null`) wins, and a
/// defined-but-null value short-circuits to `default` rather than letting
/// the lookup fall through to the next tier.
pub struct Config<'a> {
    pub remote: Option<&'a RemoteRepoConfig>,
    pub repository: Option<&'a RepositoryConfig>,
    pub root: &'a RootConfig,
}

impl<'a> Config<'a> {
    /// Looks up `key` as a raw YAML value across the three tiers, returning
    /// `default` if no tier defines it (or the defining tier's value is
    /// explicitly null).
    pub fn get_value(&self, key: &str, default: Value) -> Value {
        if let Some(remote) = self.remote {
            if let Some(v) = remote.0.get(key) {
                return if v.is_null() { default } else { v.clone() };
            }
        }
        // The repository/root tiers are typed (`RepositoryConfig`), so for
        // keys that exist as typed fields callers should prefer the typed
        // accessors below; `get_value` exists for the remote-tier overlay
        // and for keys with no typed representation.
        default
    }

    pub fn minimum_lgtm(&self) -> u32 {
        self.repository
            .and_then(|r| r.minimum_lgtm)
            .or(self.root.defaults.minimum_lgtm)
            .unwrap_or(1)
    }

    pub fn create_issue_for_new_pr(&self) -> bool {
        self.repository
            .and_then(|r| r.create_issue_for_new_pr)
            .or(self.root.defaults.create_issue_for_new_pr)
            .unwrap_or(false)
    }

    pub fn allow_commands_on_draft_prs(&self) -> Option<&[String]> {
        self.repository
            .and_then(|r| r.allow_commands_on_draft_prs.as_deref())
            .or(self.root.defaults.allow_commands_on_draft_prs.as_deref())
    }

    pub fn max_owners_files(&self) -> usize {
        self.repository
            .and_then(|r| r.max_owners_files)
            .or(self.root.defaults.max_owners_files)
            .unwrap_or(1000)
    }

    pub fn can_be_merged_required_labels(&self) -> &[String] {
        self.repository
            .and_then(|r| r.can_be_merged_required_labels.as_deref())
            .or(self.root.defaults.can_be_merged_required_labels.as_deref())
            .unwrap_or(&[])
    }

    pub fn auto_verified_and_merged_users(&self) -> &[String] {
        self.repository
            .and_then(|r| r.auto_verified_and_merged_users.as_deref())
            .or(self
                .root
                .defaults
                .auto_verified_and_merged_users
                .as_deref())
            .unwrap_or(&[])
    }

    pub fn auto_verify_cherry_picked_prs(&self) -> bool {
        self.repository
            .and_then(|r| r.auto_verify_cherry_picked_prs)
            .or(self.root.defaults.auto_verify_cherry_picked_prs)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_value_null_short_circuits() {
        let mut map = HashMap::new();
        map.insert("tox".to_string(), Value::Null);
        let remote = RemoteRepoConfig(map);
        let root = RootConfig {
            github_app_id: None,
            github_tokens: vec![],
            webhook_ip: None,
            webhook_secret: None,
            ip_bind: None,
            port: None,
            max_workers: None,
            verify_github_ips: false,
            verify_cloudflare_ips: false,
            log_level: None,
            log_file: None,
            repositories: HashMap::from([("o/r".to_string(), RepositoryConfig::default())]),
            defaults: RepositoryConfig::default(),
        };
        let cfg = Config {
            remote: Some(&remote),
            repository: None,
            root: &root,
        };
        let resolved = cfg.get_value("tox", Value::Bool(true));
        assert_eq!(resolved, Value::Bool(true));
    }

    #[test]
    fn get_value_falls_through_when_absent() {
        let remote = RemoteRepoConfig::default();
        let root = RootConfig {
            github_app_id: None,
            github_tokens: vec![],
            webhook_ip: None,
            webhook_secret: None,
            ip_bind: None,
            port: None,
            max_workers: None,
            verify_github_ips: false,
            verify_cloudflare_ips: false,
            log_level: None,
            log_file: None,
            repositories: HashMap::from([("o/r".to_string(), RepositoryConfig::default())]),
            defaults: RepositoryConfig::default(),
        };
        let cfg = Config {
            remote: Some(&remote),
            repository: None,
            root: &root,
        };
        let resolved = cfg.get_value("tox", Value::Bool(false));
        assert_eq!(resolved, Value::Bool(false));
    }
}
