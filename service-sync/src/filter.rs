//! Replication eligibility rules.

use crate::config::SyncConfig;
use crate::resources::is_synced;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::ResourceExt;

/// Service type that triggers an advisory warning.
const LOAD_BALANCER: &str = "LoadBalancer";

/// Why a candidate pair was not replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    /// Namespace is not in `syncNamespaces`.
    Namespace,
    /// Name matches `skipServiceRegex`.
    SkipPattern,
    /// The Service was created by this system.
    AlreadySynced,
}

/// Decides which pairs qualify for replication under a configuration snapshot.
pub struct FilterPolicy<'a> {
    config: &'a SyncConfig,
}

impl<'a> FilterPolicy<'a> {
    /// Create a policy over a configuration snapshot.
    pub fn new(config: &'a SyncConfig) -> Self {
        Self { config }
    }

    /// Checks that need only the Endpoints (namespace, then name).
    ///
    /// Lets the watcher skip the Service lookup for pairs that can never qualify.
    pub fn precheck(&self, endpoints: &Endpoints) -> Result<(), Exclusion> {
        let namespace = endpoints.namespace().unwrap_or_default();
        let name = endpoints.name_any();

        if !self.config.allows_namespace(&namespace) {
            tracing::debug!(
                namespace = %namespace,
                name = %name,
                allowed = ?self.config.sync_namespaces,
                "Skipping endpoints outside syncNamespaces"
            );
            return Err(Exclusion::Namespace);
        }

        if self.config.skips_name(&name) {
            tracing::debug!(namespace = %namespace, name = %name, "Skipping service matching skipServiceRegex");
            return Err(Exclusion::SkipPattern);
        }

        Ok(())
    }

    /// Full evaluation, in order: namespace, skip pattern, synced marker.
    pub fn evaluate(&self, service: &Service, endpoints: &Endpoints) -> Result<(), Exclusion> {
        self.precheck(endpoints)?;

        if is_synced(service) {
            tracing::debug!(
                namespace = %service.namespace().unwrap_or_default(),
                name = %service.name_any(),
                "Skipping service already managed by service-sync"
            );
            return Err(Exclusion::AlreadySynced);
        }

        let is_load_balancer = service
            .spec
            .as_ref()
            .and_then(|spec| spec.type_.as_deref())
            == Some(LOAD_BALANCER);
        if is_load_balancer {
            tracing::warn!(
                namespace = %service.namespace().unwrap_or_default(),
                name = %service.name_any(),
                "Service of type LoadBalancer detected; replicating anyway"
            );
        }

        Ok(())
    }

    /// Whether the pair qualifies for replication.
    pub fn qualifies(&self, service: &Service, endpoints: &Endpoints) -> bool {
        self.evaluate(service, endpoints).is_ok()
    }
}
