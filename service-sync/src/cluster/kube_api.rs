//! [`ClusterApi`] backed by a live cluster.

use super::{ClusterApi, EndpointsWatch};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{ListParams, PostParams, WatchParams};
use kube::{Api, Client, ResourceExt};

/// Resource version that starts a watch with the current state replayed as `ADDED` events.
const WATCH_FROM_ANY: &str = "0";

/// Cluster access through the Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster configuration or the local kubeconfig.
    pub async fn try_default() -> SyncResult<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    fn namespace_of<K: ResourceExt>(resource: &K) -> SyncResult<String> {
        resource.namespace().ok_or_else(|| {
            SyncError::InvalidConfig(format!(
                "resource '{}' has no namespace",
                resource.name_any()
            ))
        })
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn uses_endpoint_slices(&self) -> SyncResult<bool> {
        let slices: Api<EndpointSlice> = Api::all(self.client.clone());
        let list = slices.list(&ListParams::default().limit(1)).await?;
        Ok(!list.items.is_empty())
    }

    async fn watch_endpoints(&self) -> SyncResult<EndpointsWatch> {
        let endpoints: Api<Endpoints> = Api::all(self.client.clone());
        let stream = endpoints
            .watch(&WatchParams::default(), WATCH_FROM_ANY)
            .await?;
        Ok(stream.map(|event| event.map_err(SyncError::from)).boxed())
    }

    async fn get_namespace(&self, name: &str) -> SyncResult<Option<Namespace>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces.get_opt(name).await?)
    }

    async fn create_namespace(&self, namespace: &Namespace) -> SyncResult<Namespace> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces.create(&PostParams::default(), namespace).await?)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> SyncResult<Option<Service>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(services.get_opt(name).await?)
    }

    async fn create_service(&self, service: &Service) -> SyncResult<Service> {
        let namespace = Self::namespace_of(service)?;
        let services: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        Ok(services.create(&PostParams::default(), service).await?)
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> SyncResult<Option<Endpoints>> {
        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(endpoints.get_opt(name).await?)
    }

    async fn create_endpoints(&self, endpoints: &Endpoints) -> SyncResult<Endpoints> {
        let namespace = Self::namespace_of(endpoints)?;
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), endpoints).await?)
    }

    async fn replace_endpoints(&self, endpoints: &Endpoints) -> SyncResult<Endpoints> {
        let namespace = Self::namespace_of(endpoints)?;
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api
            .replace(&endpoints.name_any(), &PostParams::default(), endpoints)
            .await?)
    }
}
