use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use proxydeck::config::Settings;
use proxydeck::service::ManagementService;

/// proxydeck: manage API proxy processes bound to Google accounts.
#[derive(Parser, Debug)]
#[command(name = "proxydeck", version = proxydeck::VERSION)]
struct Cli {
    /// Settings file (default: ~/.config/proxydeck/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host address to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind.
    #[arg(long)]
    port: Option<u16>,

    /// Directory holding the roster and credential files.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Also write logs to a daily rolling file under the log directory.
    #[arg(long)]
    log_file: bool,
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut settings = match self.config {
            Some(ref path) => Settings::load(path),
            None => Settings::load_default(),
        };
        if let Some(ref host) = self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref dir) = self.data_dir {
            settings.storage.data_dir = Some(dir.clone());
        }
        settings
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.settings();

    let file_writer = cli.log_file.then(|| {
        let appender = tracing_appender::rolling::daily(settings.log_dir(), "proxydeck.log");
        tracing_appender::non_blocking(appender)
    });
    let (file_writer, _log_guard) = match file_writer {
        Some((writer, guard)) => (Some(writer), Some(guard)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w)))
        .init();

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    tracing::info!(
        version = proxydeck::VERSION,
        roster = %settings.roster_file().display(),
        tokens = %settings.tokens_dir().display(),
        "Starting proxydeck"
    );
    if !settings.oauth.is_configured() {
        tracing::warn!("OAuth client not configured; adding accounts from the dashboard is disabled");
    }

    let service = Arc::new(
        ManagementService::new(settings).context("Failed to build HTTP client")?,
    );
    let router = proxydeck::api::router(service.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Dashboard listening on http://{addr}");

    let ct = CancellationToken::new();
    tokio::spawn({
        let ct = ct.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutting down...");
                    ct.cancel();
                }
                Err(e) => tracing::error!("Failed to listen for ctrl+c: {e}"),
            }
        }
    });

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .context("HTTP server failed")?;

    service.shutdown().await;
    Ok(())
}
