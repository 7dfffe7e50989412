use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::response::Html;
use axum::Json;
use minijinja::{context, Environment};
use serde::Deserialize;
use serde_json::{json, Value};

use super::error::{ApiError, ErrorCode};
use crate::roster::{ProjectRef, ServerDraft, ServerEntry};
use crate::service::{ManagementService, QuotaReport};

type AppState = State<Arc<ManagementService>>;
type ApiResult<T> = Result<T, ApiError>;

const DASHBOARD_HTML: &str = include_str!("../../assets/dashboard.html");
const AUTH_SUCCESS_HTML: &str = include_str!("../../assets/auth_success.html");

pub async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": crate::VERSION }))
}

pub async fn list_tokens(State(service): AppState) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(service.list_tokens().await?))
}

pub async fn list_projects(
    State(service): AppState,
    Path(filename): Path<String>,
) -> ApiResult<Json<Vec<ProjectRef>>> {
    Ok(Json(service.list_projects(&filename).await?))
}

pub async fn list_servers(State(service): AppState) -> ApiResult<Json<Vec<ServerEntry>>> {
    Ok(Json(service.list_servers().await?))
}

pub async fn add_server(
    State(service): AppState,
    payload: Result<Json<ServerDraft>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(draft) = payload?;
    service.add_server(draft).await?;
    Ok(success())
}

pub async fn update_server(
    State(service): AppState,
    Path(id): Path<String>,
    payload: Result<Json<ServerDraft>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(draft) = payload?;
    service.update_server(&id, draft).await?;
    Ok(success())
}

pub async fn delete_server(
    State(service): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    service.delete_server(&id).await?;
    Ok(success())
}

pub async fn start_server(
    State(service): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    service.start_server(&id).await?;
    Ok(Json(json!({ "status": "started" })))
}

pub async fn stop_server(
    State(service): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    service.stop_server(&id).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

pub async fn server_quota(
    State(service): AppState,
    Path(id): Path<String>,
) -> ApiResult<Json<QuotaReport>> {
    Ok(Json(service.server_quota(&id).await?))
}

pub async fn auth_url(State(service): AppState) -> ApiResult<Json<Value>> {
    let url = service.auth_url()?;
    Ok(Json(json!({ "url": url })))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
}

pub async fn auth_callback(
    State(service): AppState,
    Query(params): Query<CallbackParams>,
) -> ApiResult<Html<String>> {
    if let Some(error) = params.error {
        return Err(ApiError::new(
            ErrorCode::OAuthRejected,
            format!("consent was not granted: {error}"),
        ));
    }
    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::new(ErrorCode::InvalidRequest, "missing authorization code"))?;

    let email = service.complete_auth(&code).await?;
    let page = render_auth_success(&email).map_err(|e| {
        ApiError::new(
            ErrorCode::Internal,
            format!("failed to render success page: {e}"),
        )
    })?;
    Ok(Html(page))
}

fn success() -> Json<Value> {
    Json(json!({ "status": "success" }))
}

/// The `.html` template name turns on HTML autoescaping.
fn render_auth_success(email: &str) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("auth_success.html", AUTH_SUCCESS_HTML)?;
    env.get_template("auth_success.html")?
        .render(context! { email })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_page_escapes_email() {
        let page = render_auth_success("<b>\"x\"&'y'</b>").unwrap();
        assert!(page.contains("&lt;b&gt;&quot;x&quot;&amp;"));
        assert!(!page.contains("<b>"));
        assert!(!page.contains("{{"));
    }

    #[test]
    fn success_page_shows_plain_email() {
        let page = render_auth_success("alice@example.com").unwrap();
        assert!(page.contains("<code>alice@example.com</code>"));
    }
}
