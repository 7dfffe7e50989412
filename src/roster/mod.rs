//! Durable roster of configured proxy servers.
//!
//! The roster is a single JSON array, replaced as a whole on every save.
//! Field names match the format the dashboard already speaks
//! (`token_file`, `project_ids`, `is_pro`, ...).

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Live state of a server, derived from the process registry at read time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    #[default]
    Stopped,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A cloud project known to a server entry.
///
/// Older rosters stored bare project id strings; those deserialize with the
/// id doubling as the display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ProjectRefRepr")]
pub struct ProjectRef {
    pub id: String,
    pub name: String,
}

impl ProjectRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// A project whose display name is its id.
    pub fn bare(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProjectRefRepr {
    Bare(String),
    Full { id: String, name: Option<String> },
}

impl From<ProjectRefRepr> for ProjectRef {
    fn from(repr: ProjectRefRepr) -> Self {
        match repr {
            ProjectRefRepr::Bare(id) => ProjectRef::bare(id),
            ProjectRefRepr::Full { id, name } => match name {
                Some(name) => ProjectRef::new(id, name),
                None => ProjectRef::bare(id),
            },
        }
    }
}

/// A configured, possibly running, proxy instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub name: String,
    pub token_file: String,
    pub project_id: String,
    #[serde(default)]
    pub project_ids: Vec<ProjectRef>,
    pub port: u16,
    pub password: String,
    #[serde(default)]
    pub is_pro: bool,
    /// Never trusted from disk; see `ProcessSupervisor::apply_status`.
    #[serde(default)]
    pub status: ServerStatus,
}

impl ServerEntry {
    /// Make the active project a member of `project_ids`, exactly once.
    ///
    /// Duplicate ids already present are collapsed (first occurrence wins),
    /// and the active project is appended when missing.
    pub fn ensure_active_project(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.project_ids.retain(|p| seen.insert(p.id.clone()));

        if !self.project_ids.iter().any(|p| p.id == self.project_id) {
            self.project_ids.push(ProjectRef::bare(self.project_id.clone()));
        }
    }
}

/// Request payload for creating or replacing an entry: everything but the
/// id, the cached tier and the live status.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDraft {
    pub name: String,
    pub token_file: String,
    pub project_id: String,
    #[serde(default)]
    pub project_ids: Vec<ProjectRef>,
    pub port: u16,
    pub password: String,
}

impl ServerDraft {
    /// Reject drafts that could never be started.
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("port must be between 1 and 65535".to_string());
        }
        if !crate::credentials::is_valid_token_file_name(&self.token_file) {
            return Err(format!("invalid token file name: {:?}", self.token_file));
        }
        Ok(())
    }

    /// Build the persisted entry, enforcing the project membership rule.
    pub fn into_entry(self, id: String, is_pro: bool) -> ServerEntry {
        let mut entry = ServerEntry {
            id,
            name: self.name,
            token_file: self.token_file,
            project_id: self.project_id,
            project_ids: self.project_ids,
            port: self.port,
            password: self.password,
            is_pro,
            status: ServerStatus::Stopped,
        };
        entry.ensure_active_project();
        entry
    }
}

static LAST_ID: AtomicU64 = AtomicU64::new(0);

/// Generate a new entry id from the current time in milliseconds.
///
/// Ids strictly increase within the process, even for calls landing in the
/// same millisecond.
pub fn generate_id() -> String {
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_ID.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next.to_string(),
            Err(actual) => last = actual,
        }
    }
}

/// File-backed roster. Cheap to clone; holds only the path.
///
/// There is no locking here: callers serialize read-modify-write cycles.
#[derive(Debug, Clone)]
pub struct RosterStore {
    path: PathBuf,
}

impl RosterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the roster. A missing or unreadable roster is an empty roster.
    pub fn load(&self) -> Vec<ServerEntry> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Failed to read roster at {}: {e}", self.path.display());
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<ServerEntry>>(&contents) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to parse roster at {}: {e}", self.path.display());
                Vec::new()
            }
        }
    }

    /// Replace the whole roster atomically.
    ///
    /// Writes to a temporary sibling with a PID suffix, syncs it, then renames
    /// over the target so readers never observe a half-written file.
    pub fn save(&self, entries: &[ServerEntry]) -> io::Result<()> {
        let serialized = serde_json::to_string_pretty(entries)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        crate::atomic_file::write_atomic(&self.path, serialized.as_bytes())?;

        debug!(
            count = entries.len(),
            "Saved roster to {}",
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: &str, port: u16) -> ServerEntry {
        ServerEntry {
            id: id.to_string(),
            name: format!("server {id}"),
            token_file: "alice@example.com.json".to_string(),
            project_id: "proj-a".to_string(),
            project_ids: vec![ProjectRef::bare("proj-a")],
            port,
            password: "pw".to_string(),
            is_pro: false,
            status: ServerStatus::Stopped,
        }
    }

    fn draft(project_id: &str, project_ids: Vec<ProjectRef>) -> ServerDraft {
        ServerDraft {
            name: "Main".to_string(),
            token_file: "alice@example.com.json".to_string(),
            project_id: project_id.to_string(),
            project_ids,
            port: 8001,
            password: "pw".to_string(),
        }
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = RosterStore::new(temp_dir.path().join("nonexistent.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn load_corrupt_file_returns_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("servers_config.json");
        fs::write(&path, "[{ this is not json").unwrap();

        let store = RosterStore::new(&path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn load_wrong_shape_returns_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("servers_config.json");
        fs::write(&path, r#"{"servers": []}"#).unwrap();

        assert!(RosterStore::new(&path).load().is_empty());
    }

    #[test]
    fn save_then_load_preserves_entries() {
        let temp_dir = TempDir::new().unwrap();
        let store = RosterStore::new(temp_dir.path().join("servers_config.json"));

        let mut second = entry("2", 8002);
        second.is_pro = true;
        second.project_ids.push(ProjectRef::new("proj-b", "Project B"));
        store.save(&[entry("1", 8001), second.clone()]).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "1");
        assert_eq!(loaded[1], second);
    }

    #[test]
    fn save_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("servers.json");

        RosterStore::new(&path).save(&[]).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn save_is_pretty_printed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("servers_config.json");
        RosterStore::new(&path).save(&[entry("1", 8001)]).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  {"));
        assert!(raw.contains("\"token_file\": \"alice@example.com.json\""));
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("servers_config.json");
        RosterStore::new(&path).save(&[entry("1", 8001)]).unwrap();

        let names: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("servers_config.json")]);
    }

    #[test]
    fn legacy_entries_load_with_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("servers_config.json");
        fs::write(
            &path,
            r#"[{
                "id": "1700000000000",
                "name": "old",
                "token_file": "a.json",
                "project_id": "p1",
                "project_ids": ["p1", {"id": "p2", "name": "Second"}, {"id": "p3"}],
                "port": 8001,
                "password": "x"
            }]"#,
        )
        .unwrap();

        let loaded = RosterStore::new(&path).load();
        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].is_pro);
        assert_eq!(loaded[0].status, ServerStatus::Stopped);
        assert_eq!(
            loaded[0].project_ids,
            vec![
                ProjectRef::bare("p1"),
                ProjectRef::new("p2", "Second"),
                ProjectRef::bare("p3"),
            ]
        );
    }

    #[test]
    fn status_serializes_lowercase() {
        let mut e = entry("1", 8001);
        e.status = ServerStatus::Running;
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["status"], "running");
    }

    #[test]
    fn draft_appends_missing_active_project() {
        let e = draft("proj-new", vec![ProjectRef::new("proj-old", "Old")])
            .into_entry("1".to_string(), false);

        assert_eq!(
            e.project_ids,
            vec![
                ProjectRef::new("proj-old", "Old"),
                ProjectRef::bare("proj-new")
            ]
        );
    }

    #[test]
    fn draft_keeps_existing_active_project_once() {
        let e = draft(
            "proj-a",
            vec![
                ProjectRef::new("proj-a", "Labelled"),
                ProjectRef::bare("proj-b"),
                ProjectRef::bare("proj-a"),
            ],
        )
        .into_entry("1".to_string(), true);

        let count = e.project_ids.iter().filter(|p| p.id == "proj-a").count();
        assert_eq!(count, 1);
        assert_eq!(e.project_ids[0], ProjectRef::new("proj-a", "Labelled"));
        assert_eq!(e.project_ids.len(), 2);
        assert!(e.is_pro);
        assert_eq!(e.status, ServerStatus::Stopped);
    }

    #[test]
    fn draft_validation() {
        assert!(draft("p", vec![]).validate().is_ok());

        let mut bad_port = draft("p", vec![]);
        bad_port.port = 0;
        assert!(bad_port.validate().is_err());

        let mut traversal = draft("p", vec![]);
        traversal.token_file = "../secrets.json".to_string();
        assert!(traversal.validate().is_err());
    }

    #[test]
    fn generated_ids_strictly_increase() {
        let ids: Vec<u64> = (0..100).map(|_| generate_id().parse().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
