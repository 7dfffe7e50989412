//! Management operations behind the HTTP API.
//!
//! Roster read-modify-write cycles are serialized by `roster_lock`. Upstream
//! probes never run while it is held; the update path re-validates what it
//! read before the probe once it has the lock again.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::credentials::CredentialStore;
use crate::oauth::{OAuthError, OAuthFlow};
use crate::probe::{AccountProbe, ProbeReport};
use crate::roster::{generate_id, ProjectRef, RosterStore, ServerDraft, ServerEntry};
use crate::supervisor::{ProcessSupervisor, SupervisorError};

/// Times an update re-probes after the entry's credential changed underneath it.
const MAX_UPDATE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("server {0} not found")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("failed to save roster: {0}")]
    Roster(#[source] io::Error),
    #[error(transparent)]
    OAuth(#[from] OAuthError),
    #[error("{0}")]
    Listing(String),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Probe report for a configured server, annotated with its name.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaReport {
    #[serde(flatten)]
    pub report: ProbeReport,
    pub config_name: String,
}

pub struct ManagementService {
    settings: Settings,
    roster: RosterStore,
    credentials: CredentialStore,
    probe: AccountProbe,
    oauth: OAuthFlow,
    supervisor: Arc<ProcessSupervisor>,
    roster_lock: Mutex<()>,
    probe_permits: Semaphore,
}

impl ManagementService {
    /// Wire up stores, probe and OAuth flow from `settings`.
    pub fn new(settings: Settings) -> reqwest::Result<Self> {
        let client = crate::http::build_http_client(&settings.upstream)?;
        let credentials = CredentialStore::new(
            settings.tokens_dir(),
            client.clone(),
            settings.oauth.clone(),
            settings.upstream.token_uri.clone(),
        );
        let probe = AccountProbe::new(
            credentials.clone(),
            client.clone(),
            settings.upstream.clone(),
        );
        let oauth = OAuthFlow::new(
            client,
            credentials.clone(),
            settings.oauth.clone(),
            settings.upstream.clone(),
            settings.redirect_uri(),
        );
        let supervisor = Arc::new(ProcessSupervisor::new(settings.proxy.clone()));
        let permits = settings.upstream.max_concurrent_probes.max(1);

        Ok(Self {
            roster: RosterStore::new(settings.roster_file()),
            credentials,
            probe,
            oauth,
            supervisor,
            roster_lock: Mutex::new(()),
            probe_permits: Semaphore::new(permits),
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    fn tokens_dir(&self) -> PathBuf {
        self.credentials.dir().to_path_buf()
    }

    // --- credentials ---

    pub async fn list_tokens(&self) -> Result<Vec<String>, ServiceError> {
        self.credentials
            .list()
            .await
            .map_err(|e| ServiceError::Listing(format!("cannot list credentials: {e}")))
    }

    pub async fn list_projects(&self, filename: &str) -> Result<Vec<ProjectRef>, ServiceError> {
        let _permit = self.probe_permit().await;
        self.probe
            .list_projects(filename)
            .await
            .map_err(|e| ServiceError::Listing(e.message))
    }

    // --- roster ---

    /// The roster with `status` reflecting the live registry.
    pub async fn list_servers(&self) -> Result<Vec<ServerEntry>, ServiceError> {
        let mut entries = self.load_roster().await?;
        self.supervisor.apply_status(&mut entries);
        Ok(entries)
    }

    /// Append a new entry. The account is probed once to seed `is_pro`.
    pub async fn add_server(&self, draft: ServerDraft) -> Result<ServerEntry, ServiceError> {
        draft.validate().map_err(ServiceError::InvalidRequest)?;

        let is_pro = self.classify(&draft.token_file, &draft.project_id).await;
        let entry = draft.into_entry(generate_id(), is_pro);

        let _guard = self.roster_lock.lock().await;
        let mut entries = self.load_roster().await?;
        entries.push(entry.clone());
        self.save_roster(entries).await?;

        info!(server = %entry.id, port = entry.port, is_pro, "Added server");
        Ok(entry)
    }

    /// Replace entry `id`. `is_pro` is carried over unless the credential
    /// file changed, in which case the new credential is probed.
    pub async fn update_server(
        &self,
        id: &str,
        draft: ServerDraft,
    ) -> Result<ServerEntry, ServiceError> {
        draft.validate().map_err(ServiceError::InvalidRequest)?;

        let mut probed: Option<(String, bool)> = None;
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let guard = self.roster_lock.lock().await;
            let mut entries = self.load_roster().await?;
            let index = find_index(&entries, id)?;
            let prior = &entries[index];

            let is_pro = if prior.token_file == draft.token_file {
                Some(prior.is_pro)
            } else {
                probed
                    .as_ref()
                    .filter(|(seen_token, _)| *seen_token == prior.token_file)
                    .map(|(_, is_pro)| *is_pro)
            };

            if let Some(is_pro) = is_pro {
                let entry = draft.into_entry(id.to_string(), is_pro);
                entries[index] = entry.clone();
                self.save_roster(entries).await?;
                info!(server = id, port = entry.port, is_pro, "Updated server");
                return Ok(entry);
            }

            // Credential changed: probe without holding the lock, then
            // confirm the prior credential is still the one we compared with.
            let prior_token = prior.token_file.clone();
            drop(guard);
            if attempt > 1 {
                debug!(server = id, attempt, "Server changed during update, re-probing");
            }
            let is_pro = self.classify(&draft.token_file, &draft.project_id).await;
            probed = Some((prior_token, is_pro));
        }

        // Every attempt raced with another writer; the probe still reflects
        // the credential being written.
        warn!(server = id, "Server kept changing during update, applying last probe");
        let is_pro = probed.map(|(_, is_pro)| is_pro).unwrap_or(false);
        let _guard = self.roster_lock.lock().await;
        let mut entries = self.load_roster().await?;
        let index = find_index(&entries, id)?;
        let entry = draft.into_entry(id.to_string(), is_pro);
        entries[index] = entry.clone();
        self.save_roster(entries).await?;
        Ok(entry)
    }

    /// Remove entry `id`, stopping its proxy first. Unknown ids are a no-op.
    pub async fn delete_server(&self, id: &str) -> Result<(), ServiceError> {
        let _guard = self.roster_lock.lock().await;
        let mut entries = self.load_roster().await?;
        let Some(index) = entries.iter().position(|e| e.id == id) else {
            debug!(server = id, "Delete of unknown server ignored");
            return Ok(());
        };

        let removed = entries.remove(index);
        self.supervisor.stop(removed.port);
        self.save_roster(entries).await?;

        info!(server = id, port = removed.port, "Deleted server");
        Ok(())
    }

    // --- processes ---

    /// Spawn the proxy for entry `id`.
    ///
    /// Holds the roster lock through the spawn, so a concurrent delete
    /// either sees the new child and stops it or removes the entry first.
    pub async fn start_server(&self, id: &str) -> Result<(), ServiceError> {
        let _guard = self.roster_lock.lock().await;
        let entries = self.load_roster().await?;
        let entry = find(&entries, id)?;
        self.supervisor.start(entry, &self.tokens_dir())?;
        Ok(())
    }

    pub async fn stop_server(&self, id: &str) -> Result<(), ServiceError> {
        let _guard = self.roster_lock.lock().await;
        let entries = self.load_roster().await?;
        let entry = find(&entries, id)?;
        self.supervisor.stop(entry.port);
        Ok(())
    }

    /// Probe the account behind entry `id`. A successful probe refreshes
    /// the stored `is_pro`; a failed one is reported, not raised.
    pub async fn server_quota(&self, id: &str) -> Result<QuotaReport, ServiceError> {
        let entry = {
            let entries = self.load_roster().await?;
            find(&entries, id)?.clone()
        };

        let result = {
            let _permit = self.probe_permit().await;
            self.probe
                .fetch_account_data(&entry.token_file, &entry.project_id)
                .await
        };
        if let Err(ref e) = result {
            warn!(server = id, error = %e, "Quota probe failed");
        }
        let report = ProbeReport::from(result);

        if let Some(is_pro) = report.is_pro() {
            self.record_tier(id, &entry.token_file, is_pro).await?;
        }

        Ok(QuotaReport {
            report,
            config_name: entry.name,
        })
    }

    async fn record_tier(
        &self,
        id: &str,
        token_file: &str,
        is_pro: bool,
    ) -> Result<(), ServiceError> {
        let _guard = self.roster_lock.lock().await;
        let mut entries = self.load_roster().await?;
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.id == id && e.token_file == token_file)
        else {
            return Ok(());
        };
        if entry.is_pro == is_pro {
            return Ok(());
        }

        entry.is_pro = is_pro;
        self.save_roster(entries).await?;
        info!(server = id, is_pro, "Updated account tier");
        Ok(())
    }

    // --- oauth ---

    pub fn auth_url(&self) -> Result<String, ServiceError> {
        Ok(self.oauth.authorization_url()?)
    }

    /// Complete consent: returns the email whose credential was stored.
    pub async fn complete_auth(&self, code: &str) -> Result<String, ServiceError> {
        Ok(self.oauth.exchange_code(code).await?)
    }

    // --- lifecycle ---

    /// Stop every running proxy, waiting up to the configured grace period.
    pub async fn shutdown(&self) {
        let grace = Duration::from_secs(self.settings.proxy.shutdown_grace_secs);
        self.supervisor.shutdown(grace).await;
    }

    // --- helpers ---

    async fn classify(&self, token_file: &str, project_id: &str) -> bool {
        let _permit = self.probe_permit().await;
        match self.probe.fetch_account_data(token_file, project_id).await {
            Ok(snapshot) => snapshot.is_pro,
            Err(e) => {
                warn!(error = %e, "Tier probe failed, assuming non-Pro");
                false
            }
        }
    }

    async fn probe_permit(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        // The semaphore is never closed, so this only fails in theory.
        self.probe_permits.acquire().await.ok()
    }

    async fn load_roster(&self) -> Result<Vec<ServerEntry>, ServiceError> {
        let roster = self.roster.clone();
        Ok(tokio::task::spawn_blocking(move || roster.load()).await?)
    }

    async fn save_roster(&self, entries: Vec<ServerEntry>) -> Result<(), ServiceError> {
        let roster = self.roster.clone();
        tokio::task::spawn_blocking(move || roster.save(&entries))
            .await?
            .map_err(ServiceError::Roster)
    }
}

fn find_index(entries: &[ServerEntry], id: &str) -> Result<usize, ServiceError> {
    entries
        .iter()
        .position(|e| e.id == id)
        .ok_or_else(|| ServiceError::NotFound(id.to_string()))
}

fn find<'a>(entries: &'a [ServerEntry], id: &str) -> Result<&'a ServerEntry, ServiceError> {
    find_index(entries, id).map(|i| &entries[i])
}
