//! In-memory cluster for tests and local development.
//!
//! Mimics the API server closely enough for replication logic: objects get a
//! uid and a resource version on write, replacing with a stale resource
//! version conflicts, creating into a missing namespace fails, and watch
//! streams are scripted ahead of time.

use super::{ClusterApi, EndpointsWatch};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Service};
use kube::{Resource, ResourceExt};
use kube::api::WatchEvent;
use kube::error::ErrorResponse;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Cluster operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// [`ClusterApi::uses_endpoint_slices`].
    ListEndpointSlices,
    /// [`ClusterApi::watch_endpoints`].
    WatchEndpoints,
    /// [`ClusterApi::get_namespace`].
    GetNamespace,
    /// [`ClusterApi::create_namespace`].
    CreateNamespace,
    /// [`ClusterApi::get_service`].
    GetService,
    /// [`ClusterApi::create_service`].
    CreateService,
    /// [`ClusterApi::get_endpoints`].
    GetEndpoints,
    /// [`ClusterApi::create_endpoints`].
    CreateEndpoints,
    /// [`ClusterApi::replace_endpoints`].
    ReplaceEndpoints,
}

/// A successful write, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Namespace created.
    CreateNamespace(String),
    /// Service created (`namespace/name`).
    CreateService(String),
    /// Endpoints created (`namespace/name`).
    CreateEndpoints(String),
    /// Endpoints replaced (`namespace/name`).
    ReplaceEndpoints(String),
}

type Key = (String, String);

#[derive(Default)]
struct Store {
    namespaces: HashMap<String, Namespace>,
    services: HashMap<Key, Service>,
    endpoints: HashMap<Key, Endpoints>,
    endpoint_slices: bool,
    failing: HashSet<Operation>,
    watches: VecDeque<Vec<SyncResult<WatchEvent<Endpoints>>>>,
    mutations: Vec<Mutation>,
    next_version: u64,
}

impl Store {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn check(&self, op: Operation) -> SyncResult<()> {
        if self.failing.contains(&op) {
            return Err(api_error(500, "InternalError", format!("injected failure for {:?}", op)));
        }
        Ok(())
    }

    fn require_namespace(&self, namespace: &str) -> SyncResult<()> {
        if self.namespaces.contains_key(namespace) {
            Ok(())
        } else {
            Err(api_error(404, "NotFound", format!("namespaces \"{}\" not found", namespace)))
        }
    }
}

fn api_error(code: u16, reason: &str, message: String) -> SyncError {
    SyncError::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    }))
}

fn key_of<K: ResourceExt>(resource: &K) -> SyncResult<Key> {
    let namespace = resource.namespace().ok_or_else(|| {
        api_error(400, "BadRequest", "the namespace of the object is missing".to_string())
    })?;
    let name = resource
        .meta()
        .name
        .clone()
        .ok_or_else(|| api_error(422, "Invalid", "metadata.name: Required value".to_string()))?;
    Ok((namespace, name))
}

fn key_display(key: &Key) -> String {
    format!("{}/{}", key.0, key.1)
}

/// In-process cluster store.
#[derive(Default)]
pub struct InMemoryCluster {
    store: Mutex<Store>,
    watch_calls: AtomicUsize,
}

impl InMemoryCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the cluster serves EndpointSlices.
    pub fn with_endpoint_slices(self) -> Self {
        self.store.lock().endpoint_slices = true;
        self
    }

    /// Make an operation fail with an internal server error until cleared.
    pub fn fail(&self, op: Operation) {
        self.store.lock().failing.insert(op);
    }

    /// Stop failing an operation.
    pub fn clear_failure(&self, op: Operation) {
        self.store.lock().failing.remove(&op);
    }

    /// Queue the events of the next watch. The stream ends after the last one.
    ///
    /// Once all scripted watches are used, further watches stay open and silent.
    pub fn push_watch(&self, events: Vec<SyncResult<WatchEvent<Endpoints>>>) {
        self.store.lock().watches.push_back(events);
    }

    /// Number of watches opened so far.
    pub fn watch_count(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Insert a Namespace as-is, bypassing failure injection and the mutation log.
    pub fn seed_namespace(&self, name: &str) {
        let mut store = self.store.lock();
        let mut namespace = Namespace::default();
        namespace.metadata.name = Some(name.to_string());
        namespace.metadata.resource_version = Some(store.bump());
        store.namespaces.insert(name.to_string(), namespace);
    }

    /// Insert a Service, bypassing failure injection and the mutation log.
    pub fn seed_service(&self, mut service: Service) {
        let mut store = self.store.lock();
        if let Ok(key) = key_of(&service) {
            service.metadata.resource_version = Some(store.bump());
            store.services.insert(key, service);
        }
    }

    /// Insert an Endpoints object, bypassing failure injection and the mutation log.
    pub fn seed_endpoints(&self, mut endpoints: Endpoints) {
        let mut store = self.store.lock();
        if let Ok(key) = key_of(&endpoints) {
            endpoints.metadata.resource_version = Some(store.bump());
            store.endpoints.insert(key, endpoints);
        }
    }

    /// Stored Namespace.
    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.store.lock().namespaces.get(name).cloned()
    }

    /// Stored Service.
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.store
            .lock()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Stored Endpoints.
    pub fn endpoints(&self, namespace: &str, name: &str) -> Option<Endpoints> {
        self.store
            .lock()
            .endpoints
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Writes performed through [`ClusterApi`], oldest first.
    pub fn mutations(&self) -> Vec<Mutation> {
        self.store.lock().mutations.clone()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn uses_endpoint_slices(&self) -> SyncResult<bool> {
        let store = self.store.lock();
        store.check(Operation::ListEndpointSlices)?;
        Ok(store.endpoint_slices)
    }

    async fn watch_endpoints(&self) -> SyncResult<EndpointsWatch> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let mut store = self.store.lock();
        store.check(Operation::WatchEndpoints)?;

        match store.watches.pop_front() {
            Some(events) => Ok(futures::stream::iter(events).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    async fn get_namespace(&self, name: &str) -> SyncResult<Option<Namespace>> {
        let store = self.store.lock();
        store.check(Operation::GetNamespace)?;
        Ok(store.namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, namespace: &Namespace) -> SyncResult<Namespace> {
        let mut store = self.store.lock();
        store.check(Operation::CreateNamespace)?;

        let name = namespace.name_any();
        if store.namespaces.contains_key(&name) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("namespaces \"{}\" already exists", name),
            ));
        }

        let mut created = namespace.clone();
        created.metadata.uid = Some(format!("ns-{}", name));
        created.metadata.resource_version = Some(store.bump());
        store.namespaces.insert(name.clone(), created.clone());
        store.mutations.push(Mutation::CreateNamespace(name));
        Ok(created)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> SyncResult<Option<Service>> {
        let store = self.store.lock();
        store.check(Operation::GetService)?;
        Ok(store
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_service(&self, service: &Service) -> SyncResult<Service> {
        let mut store = self.store.lock();
        store.check(Operation::CreateService)?;

        let key = key_of(service)?;
        store.require_namespace(&key.0)?;
        if store.services.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("services \"{}\" already exists", key.1),
            ));
        }

        let mut created = service.clone();
        created.metadata.uid = Some(format!("svc-{}", key_display(&key)));
        created.metadata.resource_version = Some(store.bump());
        store.services.insert(key.clone(), created.clone());
        store.mutations.push(Mutation::CreateService(key_display(&key)));
        Ok(created)
    }

    async fn get_endpoints(&self, namespace: &str, name: &str) -> SyncResult<Option<Endpoints>> {
        let store = self.store.lock();
        store.check(Operation::GetEndpoints)?;
        Ok(store
            .endpoints
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_endpoints(&self, endpoints: &Endpoints) -> SyncResult<Endpoints> {
        let mut store = self.store.lock();
        store.check(Operation::CreateEndpoints)?;

        let key = key_of(endpoints)?;
        store.require_namespace(&key.0)?;
        if store.endpoints.contains_key(&key) {
            return Err(api_error(
                409,
                "AlreadyExists",
                format!("endpoints \"{}\" already exists", key.1),
            ));
        }

        let mut created = endpoints.clone();
        created.metadata.uid = Some(format!("ep-{}", key_display(&key)));
        created.metadata.resource_version = Some(store.bump());
        store.endpoints.insert(key.clone(), created.clone());
        store.mutations.push(Mutation::CreateEndpoints(key_display(&key)));
        Ok(created)
    }

    async fn replace_endpoints(&self, endpoints: &Endpoints) -> SyncResult<Endpoints> {
        let mut store = self.store.lock();
        store.check(Operation::ReplaceEndpoints)?;

        let key = key_of(endpoints)?;
        let stored_version = match store.endpoints.get(&key) {
            Some(existing) => existing.metadata.resource_version.clone(),
            None => {
                return Err(api_error(
                    404,
                    "NotFound",
                    format!("endpoints \"{}\" not found", key.1),
                ));
            }
        };

        if let Some(version) = endpoints.metadata.resource_version.as_ref()
            && Some(version) != stored_version.as_ref()
        {
            return Err(api_error(
                409,
                "Conflict",
                format!(
                    "Operation cannot be fulfilled on endpoints \"{}\": the object has been modified; please apply your changes to the latest version and try again",
                    key.1
                ),
            ));
        }

        let mut replaced = endpoints.clone();
        replaced.metadata.resource_version = Some(store.bump());
        store.endpoints.insert(key.clone(), replaced.clone());
        store.mutations.push(Mutation::ReplaceEndpoints(key_display(&key)));
        Ok(replaced)
    }
}
