//! Shared HTTP client for upstream Google APIs.

use reqwest::Client;

use crate::config::UpstreamSettings;

/// Build the client used for token refresh, probes and the consent flow.
///
/// Every request inherits the configured upstream timeout.
pub fn build_http_client(upstream: &UpstreamSettings) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(upstream.timeout())
        .connect_timeout(upstream.timeout())
        .build()
}

/// Turn a non-success response into an error carrying the response body.
///
/// Google APIs put the useful part (`error_description`, `error.message`)
/// in the body, which `error_for_status` would discard.
pub async fn error_for_status_with_body(
    resp: reqwest::Response,
) -> Result<reqwest::Response, String> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().clone();
    let body = resp.text().await.unwrap_or_default();
    let body = body.trim();
    if body.is_empty() {
        Err(format!("{url} returned {status}"))
    } else {
        Err(format!("{url} returned {status}: {body}"))
    }
}
