//! # opus-logging
//!
//! Structured logging with `tracing`.
//!
//! Installs one global subscriber: an [`EnvFilter`] (where `RUST_LOG` wins
//! over the configured default) feeding either a human-readable or a JSON
//! line formatter.

#![deny(unsafe_code)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// A global subscriber was already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Output format for log lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    /// Human-readable, one event per line.
    #[default]
    Pretty,
    /// Newline-delimited JSON objects.
    Json,
}

/// Build the event filter.
///
/// `RUST_LOG` takes precedence; otherwise `default_level` applies (e.g.
/// `"info"` or `"opus_server=debug,info"`). An unparsable default falls back
/// to `info`.
pub fn build_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global tracing subscriber.
pub fn init_subscriber(default_level: &str, format: Format) -> Result<(), LoggingError> {
    let filter = build_filter(default_level);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        Format::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?,
        Format::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()?,
    }

    tracing::debug!(?format, "tracing subscriber installed");
    Ok(())
}
