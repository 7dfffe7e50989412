//! Proxy child processes, one per port.
//!
//! The registry maps a port to the child serving it. It is the only state
//! shared across request handlers, guarded by one `std::sync::Mutex` that is
//! never held across an `.await`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ProxySettings;
use crate::roster::{ServerEntry, ServerStatus};

pub const ENV_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
pub const ENV_PROJECT: &str = "GOOGLE_CLOUD_PROJECT";
pub const ENV_PORT: &str = "PORT";
pub const ENV_PASSWORD: &str = "GEMINI_AUTH_PASSWORD";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("a proxy is already running on port {port}")]
    AlreadyRunning { port: u16 },
    #[error("failed to spawn proxy on port {port}: {source}")]
    SpawnFailed {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// Environment handed to a proxy child on top of the manager's own.
pub fn build_proxy_env(entry: &ServerEntry, tokens_dir: &Path) -> Vec<(String, String)> {
    let credential = absolutize(tokens_dir.join(&entry.token_file));
    vec![
        (
            ENV_CREDENTIALS.to_string(),
            credential.to_string_lossy().into_owned(),
        ),
        (ENV_PROJECT.to_string(), entry.project_id.clone()),
        (ENV_PORT.to_string(), entry.port.to_string()),
        (ENV_PASSWORD.to_string(), entry.password.clone()),
    ]
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

/// Owns the port → child registry.
#[derive(Debug)]
pub struct ProcessSupervisor {
    launch: ProxySettings,
    registry: Mutex<HashMap<u16, Child>>,
}

impl ProcessSupervisor {
    pub fn new(launch: ProxySettings) -> Self {
        Self {
            launch,
            registry: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<u16, Child>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the proxy for `entry` and register it under `entry.port`.
    ///
    /// Returns the child's pid. A live child on the port is never replaced;
    /// one that has already exited is.
    pub fn start(
        &self,
        entry: &ServerEntry,
        tokens_dir: &Path,
    ) -> Result<Option<u32>, SupervisorError> {
        let port = entry.port;
        let mut registry = self.registry();

        if let Some(existing) = registry.get_mut(&port) {
            match existing.try_wait() {
                Ok(None) => return Err(SupervisorError::AlreadyRunning { port }),
                Ok(Some(status)) => {
                    debug!(port, %status, "Replacing exited proxy handle");
                }
                Err(e) => {
                    warn!(port, error = %e, "Could not poll previous proxy, replacing handle");
                }
            }
            registry.remove(&port);
        }

        let mut cmd = Command::new(&self.launch.program);
        cmd.args(&self.launch.args)
            .envs(build_proxy_env(entry, tokens_dir))
            .stdin(Stdio::null());
        if let Some(ref dir) = self.launch.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|source| SupervisorError::SpawnFailed { port, source })?;
        let pid = child.id();
        registry.insert(port, child);

        info!(port, pid, server = %entry.id, "Started proxy");
        Ok(pid)
    }

    /// Deregister the child on `port` and ask it to terminate. Does not wait.
    pub fn stop(&self, port: u16) {
        let Some(mut child) = self.registry().remove(&port) else {
            return;
        };
        if let Err(e) = terminate(&mut child) {
            warn!(port, error = %e, "Failed to signal proxy");
        }
        info!(port, pid = child.id(), "Stopped proxy");
    }

    /// Like [`stop`](Self::stop), but waits up to `timeout` for the child to
    /// exit and kills it once the timeout expires.
    ///
    /// Returns `false` only when the child had to be killed.
    pub async fn stop_and_wait(&self, port: u16, timeout: Duration) -> bool {
        let Some(mut child) = self.registry().remove(&port) else {
            return true;
        };
        if let Err(e) = terminate(&mut child) {
            warn!(port, error = %e, "Failed to signal proxy");
        }
        reap(port, child, Instant::now() + timeout).await
    }

    /// True iff a child is registered on `port` and has not exited.
    ///
    /// An exited child is deregistered as a side effect.
    pub fn is_running(&self, port: u16) -> bool {
        let mut registry = self.registry();
        let Some(child) = registry.get_mut(&port) else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!(port, %status, "Proxy exited");
                registry.remove(&port);
                false
            }
            Err(e) => {
                warn!(port, error = %e, "Could not poll proxy, dropping handle");
                registry.remove(&port);
                false
            }
        }
    }

    /// Overwrite each entry's status with the live registry state.
    pub fn apply_status(&self, entries: &mut [ServerEntry]) {
        for entry in entries {
            entry.status = if self.is_running(entry.port) {
                ServerStatus::Running
            } else {
                ServerStatus::Stopped
            };
        }
    }

    /// Ports with a registered child, sorted. Exited children are included
    /// until the next `is_running` poll.
    pub fn running_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.registry().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Terminate every registered child, killing those still alive after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let children: Vec<(u16, Child)> = self.registry().drain().collect();
        if children.is_empty() {
            return;
        }

        info!(count = children.len(), "Stopping all proxies");
        let deadline = Instant::now() + timeout;
        let mut pending = Vec::with_capacity(children.len());
        for (port, mut child) in children {
            if let Err(e) = terminate(&mut child) {
                warn!(port, error = %e, "Failed to signal proxy");
            }
            pending.push((port, child));
        }
        for (port, child) in pending {
            reap(port, child, deadline).await;
        }
    }
}

/// Wait for `child` until `deadline`, then kill it. `false` if it was killed.
async fn reap(port: u16, mut child: Child, deadline: Instant) -> bool {
    match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(port, %status, "Proxy exited after stop");
            true
        }
        Ok(Err(e)) => {
            warn!(port, error = %e, "Failed waiting for proxy");
            true
        }
        Err(_) => {
            warn!(port, "Proxy ignored termination, killing");
            if let Err(e) = child.kill().await {
                warn!(port, error = %e, "Failed to kill proxy");
            }
            false
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    // `id()` is None once the child has been reaped.
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::ProjectRef;

    fn entry(port: u16) -> ServerEntry {
        ServerEntry {
            id: format!("srv-{port}"),
            name: "test".to_string(),
            token_file: "alice@example.com.json".to_string(),
            project_id: "proj-a".to_string(),
            project_ids: vec![ProjectRef::bare("proj-a")],
            port,
            password: "hunter2".to_string(),
            is_pro: false,
            status: ServerStatus::Stopped,
        }
    }

    fn launching(program: &str, args: &[&str]) -> ProcessSupervisor {
        ProcessSupervisor::new(ProxySettings {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
            shutdown_grace_secs: 1,
        })
    }

    #[test]
    fn proxy_env_carries_contract_variables() {
        let env: HashMap<String, String> = build_proxy_env(&entry(8001), Path::new("tokens"))
            .into_iter()
            .collect();

        let credential = PathBuf::from(&env[ENV_CREDENTIALS]);
        assert!(credential.is_absolute());
        assert!(credential.ends_with("tokens/alice@example.com.json"));
        assert_eq!(env[ENV_PROJECT], "proj-a");
        assert_eq!(env[ENV_PORT], "8001");
        assert_eq!(env[ENV_PASSWORD], "hunter2");
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn proxy_env_keeps_absolute_tokens_dir() {
        let env: HashMap<String, String> =
            build_proxy_env(&entry(8001), Path::new("/srv/tokens"))
                .into_iter()
                .collect();
        assert_eq!(env[ENV_CREDENTIALS], "/srv/tokens/alice@example.com.json");
    }

    #[tokio::test]
    async fn stop_on_unregistered_port_is_noop() {
        let supervisor = launching("sleep", &["30"]);
        supervisor.stop(9);
        assert!(!supervisor.is_running(9));
        assert!(supervisor.stop_and_wait(9, Duration::from_millis(10)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_twice_reports_already_running() {
        let supervisor = launching("sleep", &["30"]);
        let tokens = Path::new("/tmp");

        let pid = supervisor.start(&entry(8101), tokens).unwrap();
        assert!(supervisor.is_running(8101));

        let err = supervisor.start(&entry(8101), tokens).unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning { port: 8101 }));
        assert_eq!(supervisor.running_ports(), vec![8101]);
        {
            let registry = supervisor.registry();
            assert_eq!(registry[&8101].id(), pid);
        }

        supervisor.stop(8101);
        assert!(!supervisor.is_running(8101));
        assert!(supervisor.running_ports().is_empty());
        supervisor.stop(8101);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_child_is_deregistered() {
        let supervisor = launching("true", &[]);
        supervisor.start(&entry(8102), Path::new("/tmp")).unwrap();

        let mut exited = false;
        for _ in 0..100 {
            if !supervisor.is_running(8102) {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(exited);
        assert!(supervisor.running_ports().is_empty());
        assert!(!supervisor.is_running(8102));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_handle_is_replaced_on_start() {
        let supervisor = launching("true", &[]);
        supervisor.start(&entry(8103), Path::new("/tmp")).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(supervisor.start(&entry(8103), Path::new("/tmp")).is_ok());
    }

    #[tokio::test]
    async fn spawn_failure_leaves_registry_untouched() {
        let supervisor = launching("/nonexistent/proxydeck-proxy", &[]);
        let err = supervisor
            .start(&entry(8104), Path::new("/tmp"))
            .unwrap_err();

        assert!(matches!(err, SupervisorError::SpawnFailed { port: 8104, .. }));
        assert!(supervisor.running_ports().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_and_wait_terminates_gracefully() {
        let supervisor = launching("sleep", &["30"]);
        supervisor.start(&entry(8105), Path::new("/tmp")).unwrap();

        assert!(supervisor.stop_and_wait(8105, Duration::from_secs(5)).await);
        assert!(!supervisor.is_running(8105));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_stops_every_child_and_statuses_follow() {
        let supervisor = launching("sleep", &["30"]);
        let mut entries = vec![entry(8106), entry(8107)];
        supervisor.start(&entries[0], Path::new("/tmp")).unwrap();

        supervisor.apply_status(&mut entries);
        assert_eq!(entries[0].status, ServerStatus::Running);
        assert_eq!(entries[1].status, ServerStatus::Stopped);

        supervisor.start(&entries[1], Path::new("/tmp")).unwrap();
        supervisor.shutdown(Duration::from_secs(5)).await;

        assert!(supervisor.running_ports().is_empty());
        supervisor.apply_status(&mut entries);
        assert!(entries.iter().all(|e| e.status == ServerStatus::Stopped));
    }
}
