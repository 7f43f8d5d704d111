//! YAML configuration file parsing and validation.

use super::{DEFAULT_LISTEN_ADDRESS, DEFAULT_PEER_TIMEOUT, RunMode, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::observability::LogFormat;
use regex::Regex;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Where the configuration is mounted inside the container.
pub const DEFAULT_CONFIG_PATH: &str = "/defaults/config.yaml";

/// On-disk representation, before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigFile {
    run_mode: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    log_format: Option<String>,
    #[serde(default)]
    peers: Vec<String>,
    #[serde(default)]
    sync_namespaces: Vec<String>,
    #[serde(default)]
    skip_service_regex: String,
    #[serde(default)]
    listen_address: Option<String>,
    #[serde(default)]
    peer_timeout_seconds: Option<u64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Read and validate the configuration file at `path`.
pub fn load_config(path: impl AsRef<Path>) -> SyncResult<SyncConfig> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).map_err(|e| {
        SyncError::Io(format!(
            "failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    parse_config(&data).map_err(|e| match e {
        SyncError::InvalidConfig(msg) => {
            SyncError::InvalidConfig(format!("{}: {}", path.display(), msg))
        }
        SyncError::Serialization(msg) => SyncError::InvalidConfig(format!(
            "failed to process config {}: {}",
            path.display(),
            msg
        )),
        other => other,
    })
}

/// Parse and validate a YAML configuration document.
pub fn parse_config(yaml: &str) -> SyncResult<SyncConfig> {
    let file: ConfigFile = serde_yaml::from_str(yaml)?;

    let run_mode: RunMode = file.run_mode.parse()?;

    for peer in &file.peers {
        if !peer.starts_with("http://") && !peer.starts_with("https://") {
            return Err(SyncError::InvalidConfig(format!(
                "peer URL must start with http:// or https://, got: {}",
                peer
            )));
        }
    }

    let skip_service_regex = if file.skip_service_regex.is_empty() {
        None
    } else {
        Some(Regex::new(&file.skip_service_regex).map_err(|e| {
            SyncError::InvalidConfig(format!(
                "invalid skipServiceRegex '{}': {}",
                file.skip_service_regex, e
            ))
        })?)
    };

    let listen_address: SocketAddr = file
        .listen_address
        .as_deref()
        .unwrap_or(DEFAULT_LISTEN_ADDRESS)
        .parse()
        .map_err(|e| SyncError::InvalidConfig(format!("invalid listenAddress: {}", e)))?;

    let log_format = match file.log_format.as_deref() {
        None => LogFormat::default(),
        Some(raw) => raw.parse()?,
    };

    let peer_timeout = match file.peer_timeout_seconds {
        Some(0) => {
            return Err(SyncError::InvalidConfig(
                "peerTimeoutSeconds must be greater than zero".into(),
            ));
        }
        Some(secs) => Duration::from_secs(secs),
        None => DEFAULT_PEER_TIMEOUT,
    };

    Ok(SyncConfig {
        run_mode,
        log_level: file.log_level,
        log_format,
        peers: file.peers,
        sync_namespaces: file.sync_namespaces.into_iter().collect(),
        skip_service_regex,
        listen_address,
        peer_timeout,
    })
}
