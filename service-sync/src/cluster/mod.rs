//! Access to the Kubernetes API.
//!
//! Everything the pipeline needs from a cluster goes through [`ClusterApi`]:
//!
//! - [`KubeCluster`]: backed by a live cluster via kube-rs
//! - [`InMemoryCluster`]: in-process store for tests and local runs
//!
//! Optimistic concurrency is left to the implementation: replacing an object
//! with a stale resource version fails with a conflict.

mod kube_api;
mod memory;

pub use kube_api::KubeCluster;
pub use memory::{InMemoryCluster, Mutation, Operation};

use crate::error::SyncResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Service};
use kube::api::WatchEvent;

/// Stream of Endpoints events across all namespaces.
///
/// The stream ending means the server closed the watch.
pub type EndpointsWatch = BoxStream<'static, SyncResult<WatchEvent<Endpoints>>>;

/// Cluster operations used by the controller and target roles.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Whether the cluster serves EndpointSlice objects.
    async fn uses_endpoint_slices(&self) -> SyncResult<bool>;

    /// Open a watch on Endpoints in all namespaces.
    async fn watch_endpoints(&self) -> SyncResult<EndpointsWatch>;

    /// Get a Namespace, `None` if it does not exist.
    async fn get_namespace(&self, name: &str) -> SyncResult<Option<Namespace>>;

    /// Create a Namespace.
    async fn create_namespace(&self, namespace: &Namespace) -> SyncResult<Namespace>;

    /// Get a Service, `None` if it does not exist.
    async fn get_service(&self, namespace: &str, name: &str) -> SyncResult<Option<Service>>;

    /// Create a Service in its own namespace.
    async fn create_service(&self, service: &Service) -> SyncResult<Service>;

    /// Get an Endpoints object, `None` if it does not exist.
    async fn get_endpoints(&self, namespace: &str, name: &str) -> SyncResult<Option<Endpoints>>;

    /// Create an Endpoints object in its own namespace.
    async fn create_endpoints(&self, endpoints: &Endpoints) -> SyncResult<Endpoints>;

    /// Replace an existing Endpoints object.
    ///
    /// The resource version carried by `endpoints` must match the stored one.
    async fn replace_endpoints(&self, endpoints: &Endpoints) -> SyncResult<Endpoints>;
}
