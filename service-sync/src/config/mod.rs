//! Runtime configuration.
//!
//! Configuration is read from a YAML file and held in a [`ConfigHandle`],
//! which hands out immutable snapshots. A reload replaces the whole snapshot,
//! so a reader never observes a half-applied change.
//!
//! ```yaml
//! runMode: controller
//! logLevel: info
//! peers:
//!   - http://service-sync.europe.example.com:8080
//! syncNamespaces:
//!   - shop
//!   - payments
//! skipServiceRegex: "^(kube-|default-http-backend)"
//! ```

mod file;
mod watch;

pub use file::{DEFAULT_CONFIG_PATH, load_config, parse_config};
pub use watch::ConfigWatcher;

use crate::error::SyncError;
use crate::observability::LogFormat;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch as snapshot;

/// Default listen address of the target role.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8080";

/// Default timeout for a single push to a peer.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(30);

/// Which roles this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Watch the local cluster and push pairs to peers.
    Controller,
    /// Receive pairs from peers and apply them locally.
    Target,
    /// Run both roles.
    Sync,
}

impl RunMode {
    /// Whether the controller role is active.
    pub fn runs_controller(self) -> bool {
        matches!(self, RunMode::Controller | RunMode::Sync)
    }

    /// Whether the target role is active.
    pub fn runs_target(self) -> bool {
        matches!(self, RunMode::Target | RunMode::Sync)
    }

    /// Configuration spelling of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Controller => "controller",
            RunMode::Target => "target",
            RunMode::Sync => "sync",
        }
    }
}

impl FromStr for RunMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(RunMode::Controller),
            "target" => Ok(RunMode::Target),
            "sync" => Ok(RunMode::Sync),
            other => Err(SyncError::InvalidConfig(format!(
                "runMode must be either 'controller', 'target' or 'sync', found '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated configuration snapshot.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Roles to run.
    pub run_mode: RunMode,
    /// Log level directive, e.g. `info` or `debug`.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Peer base URLs, in configured order.
    pub peers: Vec<String>,
    /// Namespaces eligible for replication.
    pub sync_namespaces: BTreeSet<String>,
    /// Names matching this pattern are never replicated.
    pub skip_service_regex: Option<Regex>,
    /// Address the target role listens on.
    pub listen_address: SocketAddr,
    /// Timeout for a single push to a peer.
    pub peer_timeout: Duration,
}

impl SyncConfig {
    /// Minimal configuration for the given mode: no peers, no namespaces.
    pub fn new(run_mode: RunMode) -> Self {
        Self {
            run_mode,
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            peers: Vec::new(),
            sync_namespaces: BTreeSet::new(),
            skip_service_regex: None,
            listen_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            peer_timeout: DEFAULT_PEER_TIMEOUT,
        }
    }

    /// Whether `namespace` is in the allow-list.
    pub fn allows_namespace(&self, namespace: &str) -> bool {
        self.sync_namespaces.contains(namespace)
    }

    /// Whether `name` matches the skip pattern.
    pub fn skips_name(&self, name: &str) -> bool {
        self.skip_service_regex
            .as_ref()
            .is_some_and(|re| re.is_match(name))
    }
}

/// Shared handle to the current configuration snapshot.
///
/// Cloning the handle is cheap; all clones observe the same snapshot.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    tx: Arc<snapshot::Sender<Arc<SyncConfig>>>,
}

impl ConfigHandle {
    /// Create a handle holding `config`.
    pub fn new(config: SyncConfig) -> Self {
        let (tx, _rx) = snapshot::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<SyncConfig> {
        Arc::clone(&*self.tx.borrow())
    }

    /// Replace the snapshot and notify subscribers.
    pub fn replace(&self, config: SyncConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> snapshot::Receiver<Arc<SyncConfig>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_parsing() {
        assert_eq!("controller".parse::<RunMode>().unwrap(), RunMode::Controller);
        assert_eq!("target".parse::<RunMode>().unwrap(), RunMode::Target);
        assert_eq!("sync".parse::<RunMode>().unwrap(), RunMode::Sync);

        let err = "both".parse::<RunMode>().unwrap_err();
        assert!(err.to_string().contains("found 'both'"));
    }

    #[test]
    fn run_mode_roles() {
        assert!(RunMode::Controller.runs_controller());
        assert!(!RunMode::Controller.runs_target());
        assert!(RunMode::Target.runs_target());
        assert!(!RunMode::Target.runs_controller());
        assert!(RunMode::Sync.runs_controller() && RunMode::Sync.runs_target());
    }

    #[test]
    fn empty_allow_list_allows_nothing() {
        let config = SyncConfig::new(RunMode::Controller);
        assert!(!config.allows_namespace("default"));
        assert!(!config.allows_namespace(""));
    }

    #[test]
    fn missing_skip_pattern_skips_nothing() {
        let config = SyncConfig::new(RunMode::Controller);
        assert!(!config.skips_name("kube-dns"));
    }

    #[test]
    fn handle_swaps_whole_snapshot() {
        let handle = ConfigHandle::new(SyncConfig::new(RunMode::Controller));
        let before = handle.snapshot();

        let mut next = SyncConfig::new(RunMode::Controller);
        next.peers.push("http://peer-a:8080".into());
        handle.replace(next);

        assert!(before.peers.is_empty());
        assert_eq!(handle.snapshot().peers, vec!["http://peer-a:8080"]);
    }

    #[tokio::test]
    async fn subscribers_are_notified() {
        let handle = ConfigHandle::new(SyncConfig::new(RunMode::Target));
        let mut rx = handle.subscribe();

        let mut next = SyncConfig::new(RunMode::Target);
        next.log_level = "debug".into();
        handle.replace(next);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().log_level, "debug");
    }
}
