//! Tracing subscriber setup.
//!
//! The configured `logLevel` applies to this crate; dependencies log at
//! `info`. Setting `RUST_LOG` replaces the whole filter and pins it, in which
//! case configuration reloads no longer change verbosity.

use crate::config::SyncConfig;
use crate::error::SyncError;
use anyhow::{Context, Result};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{
    EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for structured logging (ELK, Loki).
    Json,
    /// Human-readable pretty format with colors.
    Pretty,
    /// Compact single-line format.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(SyncError::InvalidConfig(format!(
                "logFormat must be 'json', 'pretty' or 'compact', found '{}'",
                other
            ))),
        }
    }
}

/// Build the filter for a configured log level.
pub fn filter_for_level(level: &str) -> EnvFilter {
    EnvFilter::try_new(format!("info,service_sync={}", level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Handle for changing the log level after initialization.
#[derive(Clone)]
pub struct LogLevelHandle {
    inner: reload::Handle<EnvFilter, Registry>,
    pinned_by_env: bool,
}

impl LogLevelHandle {
    /// Apply a new log level. No-op when `RUST_LOG` pinned the filter.
    pub fn set_level(&self, level: &str) {
        if self.pinned_by_env {
            return;
        }
        if let Err(e) = self.inner.reload(filter_for_level(level)) {
            tracing::warn!(error = %e, level = %level, "Failed to apply log level");
        } else {
            tracing::info!(level = %level, "Log level applied");
        }
    }

    /// Follow configuration snapshots, applying `logLevel` whenever it changes.
    pub fn follow(self, mut rx: watch::Receiver<Arc<SyncConfig>>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut current = rx.borrow_and_update().log_level.clone();
            while rx.changed().await.is_ok() {
                let next = rx.borrow_and_update().log_level.clone();
                if next != current {
                    self.set_level(&next);
                    current = next;
                }
            }
        })
    }
}

/// Initialize the global tracing subscriber from configuration.
pub fn init_tracing(config: &SyncConfig) -> Result<LogLevelHandle> {
    let (filter, pinned_by_env) = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => (
            EnvFilter::try_new(&directives).context("Invalid RUST_LOG directives")?,
            true,
        ),
        _ => (filter_for_level(&config.log_level), false),
    };

    let (filter_layer, handle) = reload::Layer::new(filter);
    let registry = tracing_subscriber::registry().with(filter_layer);

    match config.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
    }
    .context("Failed to initialize tracing subscriber")?;

    Ok(LogLevelHandle {
        inner: handle,
        pinned_by_env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn level_filter_scopes_crate() {
        let filter = filter_for_level("DEBUG");
        assert!(filter.to_string().contains("service_sync=debug"));
    }

    #[test]
    fn invalid_level_falls_back_to_info() {
        let filter = filter_for_level("not a level!");
        assert_eq!(filter.to_string(), "info");
    }
}
