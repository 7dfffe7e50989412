//! Upstream account probes: identity, quota buckets, tier and project lists.

pub mod projects;
pub mod tier;

use reqwest::header::USER_AGENT;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::UpstreamSettings;
use crate::credentials::CredentialStore;
use crate::roster::ProjectRef;

pub use projects::merge_projects;
pub use tier::TierResponse;

/// A probe failure, tagged with the credential file it concerns.
#[derive(Debug, Clone, Error)]
#[error("{filename}: {message}")]
pub struct ProbeError {
    pub filename: String,
    pub message: String,
}

impl ProbeError {
    fn new(filename: &str, message: impl ToString) -> Self {
        Self {
            filename: filename.to_string(),
            message: message.to_string(),
        }
    }
}

/// Everything one probe learns about an account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub filename: String,
    pub user: Value,
    pub quotas: Vec<Value>,
    pub is_pro: bool,
}

/// Wire form of a probe outcome, tagged by `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProbeReport {
    Success {
        filename: String,
        user: Value,
        quotas: Vec<Value>,
        is_pro: bool,
    },
    Error {
        filename: String,
        message: String,
    },
}

impl ProbeReport {
    pub fn is_pro(&self) -> Option<bool> {
        match self {
            Self::Success { is_pro, .. } => Some(*is_pro),
            Self::Error { .. } => None,
        }
    }
}

impl From<Result<AccountSnapshot, ProbeError>> for ProbeReport {
    fn from(result: Result<AccountSnapshot, ProbeError>) -> Self {
        match result {
            Ok(s) => Self::Success {
                filename: s.filename,
                user: s.user,
                quotas: s.quotas,
                is_pro: s.is_pro,
            },
            Err(e) => Self::Error {
                filename: e.filename,
                message: e.message,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct QuotaResponse {
    #[serde(default)]
    buckets: Option<Vec<Value>>,
}

/// Queries Google APIs on behalf of one credential at a time.
#[derive(Debug, Clone)]
pub struct AccountProbe {
    credentials: CredentialStore,
    client: Client,
    upstream: UpstreamSettings,
}

impl AccountProbe {
    pub fn new(credentials: CredentialStore, client: Client, upstream: UpstreamSettings) -> Self {
        Self {
            credentials,
            client,
            upstream,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Identity, quota buckets for `project_id`, and Pro classification.
    ///
    /// The credential is refreshed (and rewritten) first if needed; the three
    /// upstream calls then run concurrently with the fresh token.
    ///
    /// An upstream error status is not a failure by itself: its JSON body is
    /// read like any other, so a rejected quota call still yields the tier.
    /// Transport errors and unparseable bodies fail the probe.
    pub async fn fetch_account_data(
        &self,
        filename: &str,
        project_id: &str,
    ) -> Result<AccountSnapshot, ProbeError> {
        let token = self.fresh_token(filename).await?;

        let quota_url = self.upstream.code_assist_method("retrieveUserQuota");
        let tier_url = self.upstream.code_assist_method("loadCodeAssist");
        let (user, quota, tier) = tokio::try_join!(
            self.read_json::<Value>(self.get(&self.upstream.userinfo_url, &token)),
            self.read_json::<QuotaResponse>(
                self.post(&quota_url, &token).json(&json!({ "project": project_id }))
            ),
            self.read_json::<TierResponse>(self.post(&tier_url, &token).json(&json!({}))),
        )
        .map_err(|message| ProbeError::new(filename, message))?;

        let is_pro = tier.is_pro();
        debug!(file = filename, project = project_id, is_pro, "Probed account");

        Ok(AccountSnapshot {
            filename: filename.to_string(),
            user,
            quotas: quota.buckets.unwrap_or_default(),
            is_pro,
        })
    }

    /// Projects selectable for this credential: the preview project first,
    /// then the active resource-manager projects.
    ///
    /// Only a credential that cannot be loaded is an error; either upstream
    /// listing failing just leaves its half of the result empty.
    pub async fn list_projects(&self, filename: &str) -> Result<Vec<ProjectRef>, ProbeError> {
        let token = self.fresh_token(filename).await?;

        let (preview, active) = tokio::join!(
            self.fetch_preview_project(filename, &token),
            self.fetch_active_projects(filename, &token),
        );
        Ok(merge_projects(preview, active))
    }

    async fn fresh_token(&self, filename: &str) -> Result<String, ProbeError> {
        let record = self
            .credentials
            .load_fresh(filename)
            .await
            .map_err(|e| ProbeError::new(filename, e))?;
        Ok(record.token.unwrap_or_default())
    }

    async fn fetch_preview_project(&self, filename: &str, token: &str) -> Option<String> {
        let url = self.upstream.code_assist_method("loadCodeAssist");
        match self
            .send_json::<TierResponse>(self.post(&url, token).json(&json!({})))
            .await
        {
            Ok(tier) => tier.preview_project(),
            Err(e) => {
                warn!(file = filename, error = %e, "Preview project lookup failed");
                None
            }
        }
    }

    async fn fetch_active_projects(&self, filename: &str, token: &str) -> Option<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..projects::MAX_PROJECT_PAGES {
            let mut request = self.get(&self.upstream.projects_url, token);
            if let Some(ref t) = page_token {
                request = request.query(&[("pageToken", t.as_str())]);
            }

            let page = match self.send_json::<projects::ProjectPage>(request).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(file = filename, error = %e, "Project listing failed");
                    return None;
                }
            };

            ids.extend(page.active_ids().map(str::to_string));
            match page.next_token() {
                Some(next) => page_token = Some(next.to_string()),
                None => return Some(ids),
            }
        }

        warn!(
            file = filename,
            pages = projects::MAX_PROJECT_PAGES,
            "Project listing truncated"
        );
        Some(ids)
    }

    fn get(&self, url: &str, token: &str) -> RequestBuilder {
        self.client
            .get(url)
            .bearer_auth(token)
            .header(USER_AGENT, &self.upstream.user_agent)
    }

    fn post(&self, url: &str, token: &str) -> RequestBuilder {
        self.client
            .post(url)
            .bearer_auth(token)
            .header(USER_AGENT, &self.upstream.user_agent)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, String> {
        let resp = request.send().await.map_err(|e| e.to_string())?;
        let resp = crate::http::error_for_status_with_body(resp).await?;
        resp.json::<T>().await.map_err(|e| e.to_string())
    }

    /// Like `send_json`, but parses the body whatever the status.
    async fn read_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, String> {
        let resp = request.send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        let url = resp.url().clone();
        if !status.is_success() {
            debug!(%url, %status, "Upstream returned an error status");
        }
        resp.json::<T>()
            .await
            .map_err(|e| format!("{url} returned {status} with an unreadable body: {e}"))
    }
}
