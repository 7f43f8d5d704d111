//! Service Sync
//!
//! Replicates Kubernetes Service and Endpoints pairs from a source cluster
//! to one or more peer clusters, so workloads in one cluster can address
//! services running in another by their usual DNS name.
//!
//! # Roles
//!
//! - **controller**: watches Endpoints in the local cluster, pairs each with
//!   its Service and POSTs the pair to every peer's `/services` endpoint
//! - **target**: serves `/services` and applies received pairs to the local
//!   cluster, never overwriting resources it did not create
//! - **sync**: both of the above in one process
//!
//! # Example
//!
//! ```yaml
//! runMode: controller
//! logLevel: info
//! peers:
//!   - http://service-sync.eu-west.example.com:8080
//! syncNamespaces:
//!   - shop
//! skipServiceRegex: "^kube-"
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod filter;
pub mod observability;
pub mod resources;
pub mod sanitize;
pub mod shutdown;
pub mod target;

pub use cluster::{ClusterApi, InMemoryCluster, KubeCluster};
pub use config::{ConfigHandle, RunMode, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use resources::ResourcePair;
