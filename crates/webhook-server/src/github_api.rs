//! GitHub REST + GraphQL client.
//!
//! Issues the single "comprehensive repository fetch" GraphQL query plus
//! targeted REST/GraphQL mutations, and tracks per-delivery API call count
//! and rate-limit delta via the [`crate::context::DeliveryContext`] handed
//! to each call.

use std::sync::atomic::{AtomicU32, Ordering};

use http_cache_reqwest::{CACacheManager, Cache, CacheMode, CacheOptions, HttpCache, HttpCacheOptions};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::context::DeliveryContext;
use crate::models::{Collaborator, OpenIssue, OpenPullRequest, Permission, RepositorySnapshot};

#[derive(Debug, Error)]
pub enum GithubApiError {
    #[error("github api request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),
    #[error("github api returned an error response: {status}: {body}")]
    Response { status: u16, body: String },
    #[error("failed to decode github api response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("no github token available (token pool exhausted or all invalid)")]
    NoValidToken,
}

impl GithubApiError {
    pub fn is_critical(&self) -> bool {
        let text = self.to_string().to_ascii_lowercase();
        ["auth", "permission", "forbidden", "rate limit", "401", "403"]
            .iter()
            .any(|needle| text.contains(needle))
    }
}

/// One token in the rotating pool, with its last-observed rate limit.
#[derive(Debug, Clone)]
pub struct PoolToken {
    pub token: String,
    pub remaining: u32,
}

/// Picks the token with the highest remaining rate limit, skipping any
/// token whose limit reads 60 (GitHub's unauthenticated-request ceiling,
/// which here indicates an invalid credential rather than a real budget).
pub fn select_token(pool: &[PoolToken]) -> Result<&PoolToken, GithubApiError> {
    pool.iter()
        .filter(|t| t.remaining != 60)
        .max_by_key(|t| t.remaining)
        .ok_or(GithubApiError::NoValidToken)
}

/// GitHub REST+GraphQL client for the installation/user token. A second,
/// separately-credentialed instance (constructed the same way, with the
/// GitHub App's installation token) is used exclusively for check-run
/// creation per the spec's App-authenticated-client requirement.
pub struct Client {
    http: ClientWithMiddleware,
    api_base: String,
    token: String,
    call_count: AtomicU32,
}

impl Client {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>, cache_dir: std::path::PathBuf) -> Self {
        let http = ClientBuilder::new(reqwest::Client::builder().build().expect("reqwest client"))
            .with(Cache(HttpCache {
                mode: CacheMode::Default,
                manager: CACacheManager { path: cache_dir },
                options: HttpCacheOptions {
                    // GitHub API responses are `Cache-Control: private`;
                    // this client is per-process, not shared, so caching
                    // private responses here is safe.
                    cache_options: Some(CacheOptions {
                        shared: false,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            }))
            .build();
        Self {
            http,
            api_base: api_base.into(),
            token: token.into(),
            call_count: AtomicU32::new(0),
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.token)).expect("valid header value"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("webhook-server"));
        headers
    }

    fn record(&self, ctx: &DeliveryContext) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        ctx.record_api_call();
    }

    pub async fn graphql(
        &self,
        ctx: &DeliveryContext,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<serde_json::Value, GithubApiError> {
        self.record(ctx);
        let resp = self
            .http
            .post(format!("{}/graphql", self.api_base))
            .headers(self.headers())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.map_err(|e| {
            GithubApiError::Response {
                status: status.as_u16(),
                body: e.to_string(),
            }
        })?;
        if !status.is_success() {
            return Err(GithubApiError::Response {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }
        Ok(body)
    }

    pub async fn rest_post(
        &self,
        ctx: &DeliveryContext,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, GithubApiError> {
        self.record(ctx);
        let resp = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GithubApiError::Response {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(GithubApiError::Decode)
    }

    pub async fn rest_patch(
        &self,
        ctx: &DeliveryContext,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, GithubApiError> {
        self.record(ctx);
        let resp = self
            .http
            .patch(format!("{}{}", self.api_base, path))
            .headers(self.headers())
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GithubApiError::Response {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(GithubApiError::Decode)
    }

    pub async fn rest_get(&self, ctx: &DeliveryContext, path: &str) -> Result<serde_json::Value, GithubApiError> {
        self.record(ctx);
        let resp = self.http.get(format!("{}{}", self.api_base, path)).headers(self.headers()).send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GithubApiError::Response {
                status: status.as_u16(),
                body: text,
            });
        }
        serde_json::from_str(&text).map_err(GithubApiError::Decode)
    }

    pub async fn rest_delete(&self, ctx: &DeliveryContext, path: &str) -> Result<(), GithubApiError> {
        self.record(ctx);
        let resp = self.http.delete(format!("{}{}", self.api_base, path)).headers(self.headers()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(GithubApiError::Response {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(())
    }

    /// Opens a tracking issue for a newly-opened PR (§4.3.1).
    pub async fn create_issue(&self, ctx: &DeliveryContext, owner: &str, name: &str, title: &str, body: &str) -> Result<u64, GithubApiError> {
        let resp = self
            .rest_post(ctx, &format!("/repos/{owner}/{name}/issues"), json!({ "title": title, "body": body }))
            .await?;
        Ok(resp.get("number").and_then(|v| v.as_u64()).unwrap_or_default())
    }

    pub async fn close_issue(&self, ctx: &DeliveryContext, owner: &str, name: &str, issue_number: u64) -> Result<(), GithubApiError> {
        self.rest_patch(ctx, &format!("/repos/{owner}/{name}/issues/{issue_number}"), json!({ "state": "closed" })).await?;
        Ok(())
    }

    /// Opens the follow-up PR cherry-picking a merged PR onto another branch.
    pub async fn create_pull_request(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> Result<u64, GithubApiError> {
        let resp = self
            .rest_post(
                ctx,
                &format!("/repos/{owner}/{name}/pulls"),
                json!({ "title": title, "head": head, "base": base, "body": body }),
            )
            .await?;
        Ok(resp.get("number").and_then(|v| v.as_u64()).unwrap_or_default())
    }

    /// Requests reviews from the given logins via the REST "request
    /// reviewers" endpoint, used by the `/assign-reviewer(s)` commands.
    pub async fn request_reviewers(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        number: u64,
        reviewers: &[String],
    ) -> Result<(), GithubApiError> {
        if reviewers.is_empty() {
            return Ok(());
        }
        self.rest_post(
            ctx,
            &format!("/repos/{owner}/{name}/pulls/{number}/requested_reviewers"),
            json!({ "reviewers": reviewers }),
        )
        .await?;
        Ok(())
    }

    /// Lists check-run contexts observed against `git_ref` (branch or SHA).
    pub async fn list_check_runs_for_ref(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        git_ref: &str,
    ) -> Result<Vec<crate::checks::ContextObservation>, GithubApiError> {
        let body = self
            .rest_get(ctx, &format!("/repos/{owner}/{name}/commits/{git_ref}/check-runs?per_page=100"))
            .await?;
        Ok(body
            .pointer("/check_runs")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|c| {
                let context = c.get("name")?.as_str()?.to_string();
                let id = c.get("id")?.as_u64()?;
                let status = match (c.get("status").and_then(|v| v.as_str()), c.get("conclusion").and_then(|v| v.as_str())) {
                    (Some("completed"), Some("success")) => crate::checks::CheckStatus::Success,
                    (Some("completed"), _) => crate::checks::CheckStatus::Failure,
                    (Some("in_progress"), _) => crate::checks::CheckStatus::InProgress,
                    _ => crate::checks::CheckStatus::Queued,
                };
                Some(crate::checks::ContextObservation { context, id, status })
            })
            .collect())
    }

    /// Lists legacy commit-status contexts observed against `git_ref`.
    pub async fn list_commit_statuses_for_ref(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        git_ref: &str,
    ) -> Result<Vec<crate::checks::ContextObservation>, GithubApiError> {
        let body = self
            .rest_get(ctx, &format!("/repos/{owner}/{name}/commits/{git_ref}/statuses?per_page=100"))
            .await?;
        Ok(body
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|s| {
                let context = s.get("context")?.as_str()?.to_string();
                let id = s.get("id")?.as_u64()?;
                let status = match s.get("state").and_then(|v| v.as_str()) {
                    Some("success") => crate::checks::CheckStatus::Success,
                    Some("failure") | Some("error") => crate::checks::CheckStatus::Failure,
                    _ => crate::checks::CheckStatus::InProgress,
                };
                Some(crate::checks::ContextObservation { context, id, status })
            })
            .collect())
    }

    /// Lists a GHCR package's versions with their tags, for locating the
    /// version created for a PR's container image.
    pub async fn list_package_versions(
        &self,
        ctx: &DeliveryContext,
        scope: crate::external::RegistryScope,
        owner: &str,
        package_type: &str,
        name: &str,
    ) -> Result<Vec<(u64, Vec<String>)>, GithubApiError> {
        let scope_segment = match scope {
            crate::external::RegistryScope::Org => "orgs",
            crate::external::RegistryScope::User => "users",
        };
        let body = self
            .rest_get(ctx, &format!("/{scope_segment}/{owner}/packages/{package_type}/{name}/versions?per_page=100"))
            .await?;
        Ok(body
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|v| {
                let id = v.get("id")?.as_u64()?;
                let tags = v
                    .pointer("/metadata/container/tags")
                    .and_then(|t| t.as_array())
                    .into_iter()
                    .flatten()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect();
                Some((id, tags))
            })
            .collect())
    }

    pub async fn delete_package_version_at_path(&self, ctx: &DeliveryContext, path: &str) -> Result<(), GithubApiError> {
        self.rest_delete(ctx, path).await
    }

    /// Builds the comprehensive-repository-fetch GraphQL document: repo
    /// id/name, collaborators with permission, mentionable users, open
    /// issues with labels, open PRs — all in a single round trip.
    pub fn comprehensive_repo_query(owner: &str, name: &str, per_collection: u32) -> (String, serde_json::Value) {
        let query = r#"
            query($owner: String!, $name: String!, $n: Int!) {
              repository(owner: $owner, name: $name) {
                id
                databaseId
                collaborators(first: $n) {
                  edges { permission node { login } }
                }
                mentionableUsers(first: $n) {
                  nodes { login }
                }
                issues(states: OPEN, first: $n) {
                  nodes { number title labels(first: 20) { nodes { name } } }
                }
                pullRequests(states: OPEN, first: $n) {
                  nodes { number title }
                }
              }
            }
        "#
        .to_string();
        let vars = json!({ "owner": owner, "name": name, "n": per_collection });
        (query, vars)
    }

    pub async fn fetch_repository_snapshot(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        per_collection: u32,
    ) -> Result<RepositorySnapshot, GithubApiError> {
        let (query, vars) = Self::comprehensive_repo_query(owner, name, per_collection);
        let body = self.graphql(ctx, &query, vars).await?;
        parse_repo_snapshot(&body)
    }

    /// `addLabelsToLabelable`/`removeLabelsFromLabelable`, returning the
    /// mutation's own updated-label nodes so callers can update their
    /// cached PR view without a re-fetch.
    pub async fn mutate_labels(
        &self,
        ctx: &DeliveryContext,
        labelable_id: &str,
        label_ids: &[String],
        add: bool,
    ) -> Result<Vec<String>, GithubApiError> {
        let mutation_name = if add {
            "addLabelsToLabelable"
        } else {
            "removeLabelsFromLabelable"
        };
        let query = format!(
            r#"
            mutation($input: {mutation_name}Input!) {{
              {mutation_name}(input: $input) {{
                labelable {{ ... on Labelable {{ labels(first: 100) {{ nodes {{ name }} }} }} }}
              }}
            }}
        "#
        );
        let vars = json!({ "input": { "labelableId": labelable_id, "labelIds": label_ids } });
        let body = self.graphql(ctx, &query, vars).await?;
        let nodes = body
            .pointer(&format!("/data/{mutation_name}/labelable/labels/nodes"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(nodes
            .into_iter()
            .filter_map(|n| n.get("name").and_then(|v| v.as_str()).map(str::to_string))
            .collect())
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Lists the paths changed by a pull request via the REST "list pull
    /// request files" endpoint (paginated at 100 per page, the API max).
    pub async fn fetch_pr_changed_files(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        number: u64,
    ) -> Result<Vec<String>, GithubApiError> {
        let mut files = Vec::new();
        let mut page = 1u32;
        loop {
            self.record(ctx);
            let resp = self
                .http
                .get(format!(
                    "{}/repos/{owner}/{name}/pulls/{number}/files?per_page=100&page={page}",
                    self.api_base
                ))
                .headers(self.headers())
                .send()
                .await?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(GithubApiError::Response { status: status.as_u16(), body: text });
            }
            let batch: Vec<serde_json::Value> = serde_json::from_str(&text).map_err(GithubApiError::Decode)?;
            let batch_len = batch.len();
            files.extend(batch.into_iter().filter_map(|f| f.get("filename")?.as_str().map(str::to_string)));
            if batch_len < 100 {
                break;
            }
            page += 1;
        }
        Ok(files)
    }

    /// Creates or updates a check run via the GitHub App installation
    /// client. Returns the check run's numeric id.
    pub async fn upsert_check_run(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        request: &CheckRunRequest<'_>,
    ) -> Result<u64, GithubApiError> {
        let payload = serde_json::to_value(request).map_err(GithubApiError::Decode)?;
        let body = self.rest_post(ctx, &format!("/repos/{owner}/{name}/check-runs"), payload).await?;
        let parsed: CheckRunResponse = serde_json::from_value(body).map_err(GithubApiError::Decode)?;
        Ok(parsed.id)
    }

    /// Posts an issue comment (used for PR comments too — GitHub models a
    /// PR as an issue for comment purposes).
    pub async fn post_comment(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<(), GithubApiError> {
        self.rest_post(
            ctx,
            &format!("/repos/{owner}/{name}/issues/{issue_number}/comments"),
            json!({ "body": body }),
        )
        .await?;
        Ok(())
    }

    /// Lists every `OWNERS` file in the repository's default branch via the
    /// recursive git-tree API, then fetches each one's raw content. Used to
    /// build the per-delivery [`crate::owners::OwnersIndex`].
    pub async fn fetch_owners_files(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Vec<(String, String)>, GithubApiError> {
        self.record(ctx);
        let resp = self
            .http
            .get(format!("{}/repos/{owner}/{name}/git/trees/{branch}?recursive=1", self.api_base))
            .headers(self.headers())
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GithubApiError::Response { status: status.as_u16(), body: text });
        }
        let tree: serde_json::Value = serde_json::from_str(&text).map_err(GithubApiError::Decode)?;
        let paths: Vec<String> = tree
            .pointer("/tree")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|n| {
                let path = n.get("path")?.as_str()?;
                (n.get("type")?.as_str()? == "blob" && (path == "OWNERS" || path.ends_with("/OWNERS")))
                    .then(|| path.to_string())
            })
            .collect();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            self.record(ctx);
            let resp = self
                .http
                .get(format!("{}/repos/{owner}/{name}/contents/{path}?ref={branch}", self.api_base))
                .headers(self.headers())
                .header(reqwest::header::ACCEPT, "application/vnd.github.raw")
                .send()
                .await?;
            let status = resp.status();
            let content = resp.text().await.unwrap_or_default();
            if status.is_success() {
                files.push((path, content));
            }
        }
        Ok(files)
    }

    /// Lists every comment on an issue/PR as `(author_login, body)` pairs,
    /// oldest first, used to re-derive `/add-allowed-user` grants from the
    /// comment history instead of keeping them in memory across deliveries.
    pub async fn list_issue_comments(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        issue_number: u64,
    ) -> Result<Vec<(String, String)>, GithubApiError> {
        let mut out = Vec::new();
        let mut page = 1u32;
        loop {
            self.record(ctx);
            let resp = self
                .http
                .get(format!(
                    "{}/repos/{owner}/{name}/issues/{issue_number}/comments?per_page=100&page={page}",
                    self.api_base
                ))
                .headers(self.headers())
                .send()
                .await?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(GithubApiError::Response { status: status.as_u16(), body: text });
            }
            let batch: Vec<serde_json::Value> = serde_json::from_str(&text).map_err(GithubApiError::Decode)?;
            let batch_len = batch.len();
            out.extend(batch.into_iter().filter_map(|c| {
                let author = c.pointer("/user/login")?.as_str()?.to_string();
                let body = c.get("body")?.as_str()?.to_string();
                Some((author, body))
            }));
            if batch_len < 100 {
                break;
            }
            page += 1;
        }
        Ok(out)
    }

    /// Adds assignees to an issue/PR via the REST "add assignees" endpoint.
    pub async fn add_assignees(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        issue_number: u64,
        assignees: &[String],
    ) -> Result<(), GithubApiError> {
        if assignees.is_empty() {
            return Ok(());
        }
        self.rest_post(
            ctx,
            &format!("/repos/{owner}/{name}/issues/{issue_number}/assignees"),
            json!({ "assignees": assignees }),
        )
        .await?;
        Ok(())
    }

    /// Compares `base...head` via the REST "compare two commits" endpoint,
    /// returning its `status` field (`"ahead"`, `"behind"`, `"identical"`,
    /// or `"diverged"`) — used to tell a rebase-needed PR apart from one
    /// that merely has a real content conflict.
    pub async fn compare_commits(
        &self,
        ctx: &DeliveryContext,
        owner: &str,
        name: &str,
        base: &str,
        head: &str,
    ) -> Result<String, GithubApiError> {
        let body = self.rest_get(ctx, &format!("/repos/{owner}/{name}/compare/{base}...{head}")).await?;
        Ok(body.get("status").and_then(|v| v.as_str()).unwrap_or_default().to_string())
    }
}

fn parse_repo_snapshot(body: &serde_json::Value) -> Result<RepositorySnapshot, GithubApiError> {
    let repo = body.pointer("/data/repository").ok_or_else(|| GithubApiError::Response {
        status: 0,
        body: "missing repository in graphql response".to_string(),
    })?;

    let node_id = repo.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let database_id = repo.get("databaseId").and_then(|v| v.as_u64()).unwrap_or_default();

    let collaborators = repo
        .pointer("/collaborators/edges")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|edge| {
            let login = edge.pointer("/node/login")?.as_str()?.to_string();
            let permission = match edge.get("permission").and_then(|v| v.as_str()) {
                Some("ADMIN") => Permission::Admin,
                Some("MAINTAIN") => Permission::Maintain,
                Some("WRITE") => Permission::Write,
                _ => Permission::Other,
            };
            Some(Collaborator { login, permission })
        })
        .collect();

    let mentionable_users = repo
        .pointer("/mentionableUsers/nodes")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|n| n.get("login").and_then(|v| v.as_str()).map(str::to_string))
        .collect();

    let open_issues = repo
        .pointer("/issues/nodes")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|n| {
            Some(OpenIssue {
                number: n.get("number")?.as_u64()?,
                title: n.get("title")?.as_str()?.to_string(),
                labels: n
                    .pointer("/labels/nodes")
                    .and_then(|v| v.as_array())
                    .into_iter()
                    .flatten()
                    .filter_map(|l| l.get("name").and_then(|v| v.as_str()).map(str::to_string))
                    .collect(),
            })
        })
        .collect();

    let open_pull_requests = repo
        .pointer("/pullRequests/nodes")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|n| {
            Some(OpenPullRequest {
                number: n.get("number")?.as_u64()?,
                title: n.get("title")?.as_str()?.to_string(),
            })
        })
        .collect();

    Ok(RepositorySnapshot {
        node_id,
        database_id,
        collaborators,
        mentionable_users,
        open_issues,
        open_pull_requests,
    })
}

/// Input/output shapes for check-run creation via the GitHub App
/// installation client.
#[derive(Debug, Serialize)]
pub struct CheckRunRequest<'a> {
    pub name: &'a str,
    pub head_sha: &'a str,
    pub status: Option<&'a str>,
    pub conclusion: Option<&'a str>,
    pub output: Option<CheckRunOutput<'a>>,
}

#[derive(Debug, Serialize)]
pub struct CheckRunOutput<'a> {
    pub title: &'a str,
    pub summary: &'a str,
    pub text: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct CheckRunResponse {
    pub id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_token_skips_invalid_limit() {
        let pool = vec![
            PoolToken { token: "a".into(), remaining: 60 },
            PoolToken { token: "b".into(), remaining: 4000 },
        ];
        let picked = select_token(&pool).unwrap();
        assert_eq!(picked.token, "b");
    }

    #[test]
    fn select_token_errors_when_all_invalid() {
        let pool = vec![PoolToken { token: "a".into(), remaining: 60 }];
        assert!(select_token(&pool).is_err());
    }

    #[test]
    fn parse_repo_snapshot_extracts_collaborators() {
        let body = json!({
            "data": {
                "repository": {
                    "id": "R_1",
                    "databaseId": 1,
                    "collaborators": { "edges": [{ "permission": "ADMIN", "node": { "login": "alice" } }] },
                    "mentionableUsers": { "nodes": [{ "login": "bob" }] },
                    "issues": { "nodes": [] },
                    "pullRequests": { "nodes": [] }
                }
            }
        });
        let snapshot = parse_repo_snapshot(&body).unwrap();
        assert_eq!(snapshot.collaborators.len(), 1);
        assert_eq!(snapshot.collaborators[0].permission, Permission::Admin);
    }
}
