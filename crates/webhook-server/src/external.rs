//! External interfaces: container-tag deletion on PR close, the
//! best-effort "test oracle" webhook, and Slack notification.

use serde::Serialize;
use std::time::Duration;

const EXTERNAL_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryScope {
    Org,
    User,
}

/// Finds, among a package's versions, the one whose tags contain
/// `pr_tag`, returning its numeric version id for deletion via the GHCR
/// Packages REST API (`DELETE /orgs|users/{owner}/packages/{type}/{name}/versions/{id}`).
pub fn find_ghcr_version_id(versions: &[(u64, Vec<String>)], pr_tag: &str) -> Option<u64> {
    versions
        .iter()
        .find(|(_, tags)| tags.iter().any(|t| t == pr_tag))
        .map(|(id, _)| *id)
}

pub fn ghcr_delete_path(scope: RegistryScope, owner: &str, package_type: &str, name: &str, version_id: u64) -> String {
    let scope_segment = match scope {
        RegistryScope::Org => "orgs",
        RegistryScope::User => "users",
    };
    format!("/{scope_segment}/{owner}/packages/{package_type}/{name}/versions/{version_id}")
}

/// For non-GHCR registries: the `regctl` invocation sequence
/// (login → tag ls → tag delete → logout), returned as argv lists for the
/// command runner to execute in order.
pub fn regctl_delete_tag_sequence(registry: &str, username: &str, repository: &str, tag: &str) -> Vec<Vec<String>> {
    vec![
        vec!["regctl".into(), "registry".into(), "login".into(), registry.into(), "-u".into(), username.into()],
        vec!["regctl".into(), "tag".into(), "ls".into(), format!("{repository}:{tag}")],
        vec!["regctl".into(), "tag".into(), "delete".into(), format!("{repository}:{tag}")],
        vec!["regctl".into(), "registry".into(), "logout".into(), registry.into()],
    ]
}

#[derive(Debug, Serialize)]
pub struct TestOraclePayload<'a> {
    pub pr_url: &'a str,
    pub ai_provider: Option<&'a str>,
    pub ai_model: Option<&'a str>,
}

/// Best-effort, non-blocking POST to an externally-configured test-oracle
/// service. Errors are swallowed by the caller (the dispatcher registers
/// this future into the process-wide tracked-task set on spawn and
/// removes it on completion, per the design notes' "fire and forget
/// background tasks → tracked task set" rewiring); this function itself
/// just performs the request.
pub async fn notify_test_oracle(
    client: &reqwest::Client,
    server_url: &str,
    payload: &TestOraclePayload<'_>,
) -> anyhow::Result<()> {
    client
        .post(server_url)
        .timeout(EXTERNAL_HTTP_TIMEOUT)
        .json(payload)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct SlackMessage<'a> {
    text: &'a str,
}

pub async fn notify_slack(client: &reqwest::Client, webhook_url: &str, text: &str) -> anyhow::Result<()> {
    client
        .post(webhook_url)
        .timeout(EXTERNAL_HTTP_TIMEOUT)
        .json(&SlackMessage { text })
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_version_matching_pr_tag() {
        let versions = vec![(1u64, vec!["latest".to_string()]), (2u64, vec!["pr-42".to_string()])];
        assert_eq!(find_ghcr_version_id(&versions, "pr-42"), Some(2));
        assert_eq!(find_ghcr_version_id(&versions, "pr-99"), None);
    }

    #[test]
    fn ghcr_path_respects_scope() {
        let path = ghcr_delete_path(RegistryScope::Org, "acme", "container", "app", 7);
        assert_eq!(path, "/orgs/acme/packages/container/app/versions/7");
    }

    #[test]
    fn regctl_sequence_has_four_steps() {
        let seq = regctl_delete_tag_sequence("ghcr.io", "bot", "acme/app", "pr-42");
        assert_eq!(seq.len(), 4);
        assert_eq!(seq[0][2], "login");
        assert_eq!(seq[3][2], "logout");
    }
}
