//! proxydeck: web manager for a fleet of credential-bound API proxy processes.

pub mod api;
pub mod atomic_file;
pub mod config;
pub mod credentials;
pub mod http;
pub mod oauth;
pub mod paths;
pub mod probe;
pub mod roster;
pub mod service;
pub mod supervisor;

/// Build version, injected by `build.rs`.
pub const VERSION: &str = env!("PROXYDECK_VERSION");
