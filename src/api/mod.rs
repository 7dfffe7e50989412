//! HTTP surface: the dashboard page and its JSON API.

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::service::ManagementService;

pub use error::{ApiError, ErrorCode};

/// Build the management router over a shared service.
pub fn router(service: Arc<ManagementService>) -> Router {
    Router::new()
        .route("/", get(handlers::dashboard))
        .route("/api/health", get(handlers::health))
        .route("/api/tokens", get(handlers::list_tokens))
        .route("/api/tokens/{filename}/projects", get(handlers::list_projects))
        .route(
            "/api/servers",
            get(handlers::list_servers).post(handlers::add_server),
        )
        .route(
            "/api/servers/{id}",
            axum::routing::put(handlers::update_server).delete(handlers::delete_server),
        )
        .route("/api/servers/{id}/start", post(handlers::start_server))
        .route("/api/servers/{id}/stop", post(handlers::stop_server))
        .route("/api/servers/{id}/quota", get(handlers::server_quota))
        .route("/api/auth/url", get(handlers::auth_url))
        .route("/api/auth/callback", get(handlers::auth_callback))
        .with_state(service)
}
