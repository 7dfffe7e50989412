//! Per-account OAuth credential files.
//!
//! Each file in the credential directory is one JSON document in the
//! authorized-user format (`token`, `refresh_token`, `expiry`, client
//! identity, token endpoint). Files are read and refreshed per call; nothing
//! is cached in memory. A refreshed token is written back to its file before
//! the caller gets to use it.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::OAuthSettings;

/// Tokens this close to expiry are treated as already expired.
pub fn refresh_threshold() -> Duration {
    Duration::seconds(3 * 60 + 45)
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential file not found: {0}")]
    NotFound(String),
    #[error("credential file {name} is corrupt: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid credential file name: {0:?}")]
    InvalidName(String),
    #[error("token refresh failed: {0}")]
    Refresh(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// OAuth token material for one account.
///
/// Unknown fields are preserved so rewriting a file after a refresh never
/// drops data written by other tools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default, alias = "access_token", skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_expiry",
        deserialize_with = "deserialize_expiry"
    )]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn serialize_expiry<S: Serializer>(
    expiry: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match expiry {
        Some(at) => serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        None => serializer.serialize_none(),
    }
}

fn deserialize_expiry<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => parse_expiry(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid expiry timestamp: {s}"))),
    }
}

/// Accepts RFC 3339 and the naive `YYYY-MM-DDTHH:MM:SS[.ffffff]` form (UTC).
fn parse_expiry(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

impl CredentialRecord {
    /// True when the access token is missing or expires within the refresh threshold.
    ///
    /// A token without an expiry is assumed valid.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if matches!(self.token.as_deref(), None | Some("")) {
            return true;
        }
        self.expiry
            .is_some_and(|expiry| now + refresh_threshold() >= expiry)
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Fill in client identity and token endpoint missing from legacy files.
    pub fn backfill(&mut self, oauth: &OAuthSettings, default_token_uri: &str) {
        if self.client_id.is_none() {
            self.client_id = Some(oauth.client_id.clone());
        }
        if self.client_secret.is_none() {
            self.client_secret = Some(oauth.client_secret.clone());
        }
        if self.token_uri.is_none() {
            self.token_uri = Some(default_token_uri.to_string());
        }
    }

    /// Merge a token endpoint response into this record.
    pub fn apply_token_response(&mut self, resp: TokenResponse, now: DateTime<Utc>) {
        self.token = Some(resp.access_token);
        self.expiry = resp.expires_in.map(|secs| now + Duration::seconds(secs));
        if let Some(refresh) = resp.refresh_token {
            self.refresh_token = Some(refresh);
        }
        if let Some(scope) = resp.scope {
            self.scopes = scope.split_whitespace().map(str::to_string).collect();
        }
    }
}

/// Successful body of an OAuth token endpoint call (refresh or code grant).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// A credential file name is a plain file name without path components.
pub fn is_valid_token_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
        && Path::new(name).file_name().is_some_and(|f| f == name)
}

/// Credential directory accessor with token refresh.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    dir: PathBuf,
    client: Client,
    oauth: OAuthSettings,
    token_uri: String,
}

impl CredentialStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        client: Client,
        oauth: OAuthSettings,
        token_uri: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            client,
            oauth,
            token_uri: token_uri.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path of a credential file, rejecting names that escape the directory.
    pub fn path_for(&self, filename: &str) -> Result<PathBuf, CredentialError> {
        if !is_valid_token_file_name(filename) {
            return Err(CredentialError::InvalidName(filename.to_string()));
        }
        if self.dir.is_absolute() {
            return Ok(self.dir.join(filename));
        }
        Ok(std::env::current_dir()?.join(&self.dir).join(filename))
    }

    /// List credential file names (`*.json`), sorted. Creates the directory if needed.
    pub async fn list(&self) -> io::Result<Vec<String>> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".json") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn read(&self, filename: &str) -> Result<CredentialRecord, CredentialError> {
        let path = self.path_for(filename)?;
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CredentialError::NotFound(filename.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&contents).map_err(|source| CredentialError::Corrupt {
            name: filename.to_string(),
            source,
        })
    }

    /// Persist a record under `filename`, owner-readable only.
    pub async fn write(
        &self,
        filename: &str,
        record: &CredentialRecord,
    ) -> Result<(), CredentialError> {
        let path = self.path_for(filename)?;
        let serialized = serde_json::to_vec_pretty(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        tokio::task::spawn_blocking(move || {
            crate::atomic_file::write_atomic_private(&path, &serialized)
        })
        .await
        .map_err(io::Error::other)??;

        debug!(file = filename, "Wrote credential");
        Ok(())
    }

    /// Store a credential obtained through consent as `<email>.json`.
    ///
    /// Returns the file name written.
    pub async fn store_new(
        &self,
        email: &str,
        record: &CredentialRecord,
    ) -> Result<String, CredentialError> {
        let filename = format!("{email}.json");
        self.write(&filename, record).await?;

        info!(file = %filename, "Stored new credential");
        Ok(filename)
    }

    /// Backfill defaults and refresh the token if it has expired.
    ///
    /// The refreshed record is written to `filename` before it is returned.
    /// An expired record without a refresh token comes back unchanged.
    pub async fn ensure_fresh(
        &self,
        filename: &str,
        mut record: CredentialRecord,
    ) -> Result<CredentialRecord, CredentialError> {
        record.backfill(&self.oauth, &self.token_uri);

        if !record.is_expired(Utc::now()) || !record.has_refresh_token() {
            return Ok(record);
        }

        let resp = self.request_refresh(&record).await?;
        record.apply_token_response(resp, Utc::now());
        self.write(filename, &record).await?;

        info!(file = filename, "Refreshed access token");
        Ok(record)
    }

    /// Read a credential and make sure its access token is usable.
    pub async fn load_fresh(&self, filename: &str) -> Result<CredentialRecord, CredentialError> {
        let record = self.read(filename).await?;
        self.ensure_fresh(filename, record).await
    }

    async fn request_refresh(
        &self,
        record: &CredentialRecord,
    ) -> Result<TokenResponse, CredentialError> {
        let token_uri = record.token_uri.as_deref().unwrap_or(&self.token_uri);
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", record.refresh_token.as_deref().unwrap_or_default()),
            ("client_id", record.client_id.as_deref().unwrap_or_default()),
            ("client_secret", record.client_secret.as_deref().unwrap_or_default()),
        ];

        let resp = self
            .client
            .post(token_uri)
            .form(&form)
            .send()
            .await
            .map_err(|e| CredentialError::Refresh(e.to_string()))?;
        let resp = crate::http::error_for_status_with_body(resp)
            .await
            .map_err(CredentialError::Refresh)?;

        resp.json::<TokenResponse>()
            .await
            .map_err(|e| CredentialError::Refresh(e.to_string()))
    }
}
