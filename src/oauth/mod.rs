//! Browser consent flow that mints new credential files.

use chrono::Utc;
use reqwest::header::USER_AGENT;
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;

use crate::config::{OAuthSettings, UpstreamSettings};
use crate::credentials::{CredentialError, CredentialRecord, CredentialStore, TokenResponse};

/// Scopes requested during consent.
pub const SCOPES: [&str; 4] = [
    "https://www.googleapis.com/auth/cloud-platform",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
    "openid",
];

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("OAuth client is not configured (set oauth.client_id and oauth.client_secret)")]
    NotConfigured,
    #[error("invalid authorization endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("authorization code exchange failed: {0}")]
    Exchange(String),
    #[error("identity lookup returned no email")]
    MissingEmail,
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: Option<String>,
}

/// Builds consent URLs and turns returned codes into credential files.
#[derive(Debug, Clone)]
pub struct OAuthFlow {
    client: Client,
    credentials: CredentialStore,
    oauth: OAuthSettings,
    upstream: UpstreamSettings,
    redirect_uri: String,
}

impl OAuthFlow {
    pub fn new(
        client: Client,
        credentials: CredentialStore,
        oauth: OAuthSettings,
        upstream: UpstreamSettings,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client,
            credentials,
            oauth,
            upstream,
            redirect_uri: redirect_uri.into(),
        }
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Consent URL requesting offline access, always re-prompting so a
    /// refresh token is issued.
    pub fn authorization_url(&self) -> Result<String, OAuthError> {
        if !self.oauth.is_configured() {
            return Err(OAuthError::NotConfigured);
        }

        let state = uuid::Uuid::new_v4().simple().to_string();
        let scope = SCOPES.join(" ");
        let url = Url::parse_with_params(
            &self.upstream.auth_uri,
            &[
                ("response_type", "code"),
                ("client_id", self.oauth.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| OAuthError::InvalidEndpoint(format!("{}: {e}", self.upstream.auth_uri)))?;

        Ok(url.into())
    }

    /// Exchange an authorization code and store the result as `<email>.json`.
    ///
    /// Returns the account email.
    pub async fn exchange_code(&self, code: &str) -> Result<String, OAuthError> {
        if !self.oauth.is_configured() {
            return Err(OAuthError::NotConfigured);
        }

        let tokens = self.request_tokens(code).await?;
        let email = self.lookup_email(&tokens.access_token).await?;

        let mut record = CredentialRecord {
            token_uri: Some(self.upstream.token_uri.clone()),
            client_id: Some(self.oauth.client_id.clone()),
            client_secret: Some(self.oauth.client_secret.clone()),
            scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        record.apply_token_response(tokens, Utc::now());

        self.credentials.store_new(&email, &record).await?;
        Ok(email)
    }

    async fn request_tokens(&self, code: &str) -> Result<TokenResponse, OAuthError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
        ];

        let resp = self
            .client
            .post(&self.upstream.token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| OAuthError::Exchange(e.to_string()))?;
        let resp = crate::http::error_for_status_with_body(resp)
            .await
            .map_err(OAuthError::Exchange)?;

        resp.json::<TokenResponse>()
            .await
            .map_err(|e| OAuthError::Exchange(e.to_string()))
    }

    async fn lookup_email(&self, access_token: &str) -> Result<String, OAuthError> {
        let resp = self
            .client
            .get(&self.upstream.userinfo_url)
            .bearer_auth(access_token)
            .header(USER_AGENT, &self.upstream.user_agent)
            .send()
            .await
            .map_err(|e| OAuthError::Exchange(e.to_string()))?;
        let resp = crate::http::error_for_status_with_body(resp)
            .await
            .map_err(OAuthError::Exchange)?;
        let info = resp
            .json::<UserInfo>()
            .await
            .map_err(|e| OAuthError::Exchange(e.to_string()))?;

        info.email
            .filter(|e| !e.is_empty())
            .ok_or(OAuthError::MissingEmail)
    }
}
