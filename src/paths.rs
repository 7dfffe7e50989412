//! Centralized path resolution for application data files.
//!
//! This module provides a unified interface for resolving paths to:
//! - Settings (`~/.config/proxydeck[-dev]/config.toml`)
//! - Data directory (`~/.local/share/proxydeck[-dev]/`), which holds the
//!   server roster, the `tokens/` credential directory and log files
//!
//! Dev builds (`0.0.0-dev`) use `proxydeck-dev` subdirectories to avoid
//! interfering with an installed release binary.
//!
//! ## Production Behavior
//!
//! By default, uses XDG Base Directory Specification:
//! - Prefers `$XDG_CONFIG_HOME` for config, fallback to `$HOME/.config`
//! - Prefers `$XDG_DATA_HOME` for data, fallback to `$HOME/.local/share`
//!
//! ## Testing Behavior
//!
//! Tests can override path resolution using `TestPathGuard`:
//! ```ignore
//! #[test]
//! fn test_with_custom_paths() {
//!     let temp_dir = tempfile::TempDir::new().unwrap();
//!     let _guard = TestPathGuard::new(temp_dir.path());
//!
//!     // All paths now resolve under temp_dir
//!     let config = config_file().unwrap();
//!     assert_eq!(config, temp_dir.path().join("config.toml"));
//! }
//! ```

use std::cell::RefCell;
use std::path::{Path, PathBuf};

/// File name of the persisted server roster inside the data directory.
pub const ROSTER_FILE_NAME: &str = "servers_config.json";

/// Name of the credential directory inside the data directory.
pub const TOKENS_DIR_NAME: &str = "tokens";

/// Returns "proxydeck-dev" for dev builds, "proxydeck" for release builds.
fn app_dir_name() -> &'static str {
    if cfg!(dev_build) {
        "proxydeck-dev"
    } else {
        "proxydeck"
    }
}

/// Categories of application paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Settings file: `~/.config/proxydeck/config.toml`
    Config,
    /// Data directory: `~/.local/share/proxydeck/`
    DataDir,
    /// Log directory: `~/.local/share/proxydeck/logs/`
    LogDir,
}

/// Path resolution strategy (thread-local).
#[derive(Debug, PartialEq)]
enum PathStrategy {
    /// Production: Use XDG Base Directory Specification.
    Xdg,
    /// Testing: Use custom base directory for all paths.
    Override(PathBuf),
}

thread_local! {
    static PATH_STRATEGY: RefCell<PathStrategy> = const { RefCell::new(PathStrategy::Xdg) };
}

/// Resolve a path based on the current strategy.
///
/// # Returns
///
/// - `Some(path)` - Successfully resolved path
/// - `None` - Could not resolve path (e.g., HOME not set in XDG mode)
pub fn resolve(kind: PathKind) -> Option<PathBuf> {
    PATH_STRATEGY.with(|strategy| {
        let s = strategy.borrow();
        match *s {
            PathStrategy::Xdg => resolve_xdg(kind),
            PathStrategy::Override(ref base) => Some(resolve_override(base, kind)),
        }
    })
}

/// `$XDG_*_HOME/<app>` if the variable is set, otherwise `$HOME/<fallback>/<app>`.
fn xdg_app_dir(xdg_var: &str, home_fallback: &[&str]) -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os(xdg_var) {
        let mut p = PathBuf::from(xdg);
        p.push(app_dir_name());
        return Some(p);
    }

    std::env::var_os("HOME").map(|h| {
        let mut p = PathBuf::from(h);
        for part in home_fallback {
            p.push(part);
        }
        p.push(app_dir_name());
        p
    })
}

/// Resolve a path using XDG Base Directory Specification.
fn resolve_xdg(kind: PathKind) -> Option<PathBuf> {
    match kind {
        PathKind::Config => {
            xdg_app_dir("XDG_CONFIG_HOME", &[".config"]).map(|p| p.join("config.toml"))
        }
        PathKind::DataDir => xdg_app_dir("XDG_DATA_HOME", &[".local", "share"]),
        PathKind::LogDir => {
            xdg_app_dir("XDG_DATA_HOME", &[".local", "share"]).map(|p| p.join("logs"))
        }
    }
}

/// Resolve a path using a custom base directory (for testing).
fn resolve_override(base: &Path, kind: PathKind) -> PathBuf {
    match kind {
        PathKind::Config => base.join("config.toml"),
        PathKind::DataDir => base.to_path_buf(),
        PathKind::LogDir => base.join("logs"),
    }
}

/// Resolve the settings file path.
///
/// Returns: `$XDG_CONFIG_HOME/proxydeck/config.toml` or `$HOME/.config/proxydeck/config.toml`
pub fn config_file() -> Option<PathBuf> {
    resolve(PathKind::Config)
}

/// Resolve the data directory.
///
/// Returns: `$XDG_DATA_HOME/proxydeck/` or `$HOME/.local/share/proxydeck/`
pub fn data_directory() -> Option<PathBuf> {
    resolve(PathKind::DataDir)
}

/// Resolve the log directory path.
pub fn log_directory() -> Option<PathBuf> {
    resolve(PathKind::LogDir)
}

/// Roster file inside the given data directory.
pub fn roster_file_in(data_dir: &Path) -> PathBuf {
    data_dir.join(ROSTER_FILE_NAME)
}

/// Credential directory inside the given data directory.
pub fn tokens_dir_in(data_dir: &Path) -> PathBuf {
    data_dir.join(TOKENS_DIR_NAME)
}

/// Override path resolution for all paths to use a custom base directory.
///
/// This is primarily intended for testing. All paths will resolve under the given base:
/// - `config_file()` → `base/config.toml`
/// - `data_directory()` → `base/`
/// - `log_directory()` → `base/logs`
///
/// # Note
///
/// This change is thread-local and affects only the current thread.
/// Use `reset_to_xdg()` or `TestPathGuard` to restore XDG behavior.
pub fn set_test_dir(base: impl Into<PathBuf>) {
    PATH_STRATEGY.with(|strategy| {
        *strategy.borrow_mut() = PathStrategy::Override(base.into());
    });
}

/// Reset path resolution back to XDG Base Directory Specification.
pub fn reset_to_xdg() {
    PATH_STRATEGY.with(|strategy| {
        *strategy.borrow_mut() = PathStrategy::Xdg;
    });
}

/// RAII guard for test path overrides.
///
/// Automatically resets to XDG behavior when dropped.
pub struct TestPathGuard;

impl TestPathGuard {
    /// Create a new test path guard with the given base directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        set_test_dir(base_dir);
        TestPathGuard
    }
}

impl Drop for TestPathGuard {
    fn drop(&mut self) {
        reset_to_xdg();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_is_xdg() {
        reset_to_xdg();
        PATH_STRATEGY.with(|s| {
            assert_eq!(*s.borrow(), PathStrategy::Xdg);
        });
    }

    #[test]
    fn override_isolates_paths() {
        let base = PathBuf::from("/test/base");
        set_test_dir(&base);

        assert_eq!(config_file(), Some(base.join("config.toml")));
        assert_eq!(data_directory(), Some(base.clone()));
        assert_eq!(log_directory(), Some(base.join("logs")));

        reset_to_xdg();
    }

    #[test]
    fn guard_resets_on_drop() {
        let base = PathBuf::from("/test/base");
        {
            let _guard = TestPathGuard::new(&base);
            assert_eq!(config_file(), Some(base.join("config.toml")));
        }
        PATH_STRATEGY.with(|s| {
            assert_eq!(*s.borrow(), PathStrategy::Xdg);
        });
    }

    #[test]
    fn thread_local_isolation() {
        let base1 = PathBuf::from("/test/base1");
        set_test_dir(&base1);

        let handle = std::thread::spawn(|| {
            // New thread should start with Xdg (default)
            PATH_STRATEGY.with(|s| matches!(*s.borrow(), PathStrategy::Xdg))
        });

        assert!(handle.join().unwrap());
        assert_eq!(data_directory(), Some(base1.clone()));

        reset_to_xdg();
    }

    #[test]
    fn data_files_live_under_data_directory() {
        let base = Path::new("/data");
        assert_eq!(
            roster_file_in(base),
            PathBuf::from("/data/servers_config.json")
        );
        assert_eq!(tokens_dir_in(base), PathBuf::from("/data/tokens"));
    }

    #[test]
    fn resolve_override_all_kinds() {
        let base = Path::new("/data");

        assert_eq!(
            resolve_override(base, PathKind::Config),
            PathBuf::from("/data/config.toml")
        );
        assert_eq!(
            resolve_override(base, PathKind::DataDir),
            PathBuf::from("/data")
        );
        assert_eq!(
            resolve_override(base, PathKind::LogDir),
            PathBuf::from("/data/logs")
        );
    }
}
