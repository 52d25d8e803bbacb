//! # opus-gateway
//!
//! Opus message gateway binary: loads settings, installs logging and
//! metrics, then serves WebSocket clients until Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use opus_settings::loader::apply_overrides_from;
use opus_settings::{GatewaySettings, LogFormat, SettingsError};
use opus_server::GatewayServer;
use opus_server::shutdown::{self, DEFAULT_DRAIN_TIMEOUT};
use tokio::task::JoinHandle;

/// Opus message gateway.
#[derive(Parser, Debug)]
#[command(name = "opus-gateway", about = "Real-time WebSocket message gateway")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default: `~/.opus/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn apply(&self, settings: &mut GatewaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if self.json_logs {
            settings.logging.format = LogFormat::Json;
        }
    }
}

fn log_format(format: LogFormat) -> opus_logging::Format {
    match format {
        LogFormat::Pretty => opus_logging::Format::Pretty,
        LogFormat::Json => opus_logging::Format::Json,
    }
}

/// Load `path`, falling back to defaults when it is unreadable.
///
/// `OPUS_*` overrides still apply on the fallback, read through `lookup`.
fn load_or_defaults<F>(path: &Path, lookup: F) -> (GatewaySettings, Option<SettingsError>)
where
    F: Fn(&str) -> Option<String>,
{
    match opus_settings::load_settings_from_path(path) {
        Ok(settings) => (settings, None),
        Err(e) => {
            let mut settings = GatewaySettings::default();
            apply_overrides_from(&mut settings, lookup);
            (settings, Some(e))
        }
    }
}

/// Wait for `signal`. Fails if the hub task ends first, since the gateway
/// cannot accept or route anything without it.
async fn supervise<F>(hub_task: &mut JoinHandle<()>, signal: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::select! {
        () = signal => Ok(()),
        joined = hub_task => match joined {
            Err(e) if e.is_panic() => Err(anyhow!("hub task panicked: {e}")),
            Err(e) => Err(anyhow!("hub task failed: {e}")),
            Ok(()) => Err(anyhow!("hub stopped unexpectedly")),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Settings come first so the configured log level applies from the start.
    let settings_path = args.config.clone().unwrap_or_else(opus_settings::settings_path);
    let (mut settings, load_error) =
        load_or_defaults(&settings_path, |name| std::env::var(name).ok());
    args.apply(&mut settings);

    opus_logging::init_subscriber(
        settings.logging.level.as_filter_str(),
        log_format(settings.logging.format),
    )
    .context("Failed to initialize logging")?;
    if let Some(e) = load_error {
        tracing::warn!(path = %settings_path.display(), error = %e, "failed to load settings, using defaults");
    }
    settings.validate().context("Invalid settings")?;

    let metrics_handle = match opus_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable, /metrics disabled");
            None
        }
    };

    let server = GatewayServer::new(settings.server, metrics_handle);
    let (addr, serve_task) = server.listen().await.context("Failed to start server")?;
    tracing::info!(%addr, "opus gateway ready");

    let mut hub_task = server.take_hub_task().context("hub task already taken")?;
    if let Err(e) = supervise(&mut hub_task, shutdown::wait_for_signal()).await {
        tracing::error!(error = %e, "hub failed, exiting");
        server.shutdown().shutdown();
        return Err(e);
    }

    let handles = vec![
        tokio::spawn(async move {
            if let Ok(Err(e)) = serve_task.await {
                tracing::error!(error = %e, "server exited with error");
            }
        }),
        hub_task,
    ];
    if !server
        .shutdown()
        .graceful_shutdown(handles, Some(DEFAULT_DRAIN_TIMEOUT))
        .await
    {
        tracing::warn!("forcing exit with connections still open");
    }
    tracing::info!("shutdown complete");
    Ok(())
}
