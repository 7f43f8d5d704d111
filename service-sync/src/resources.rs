//! The Service/Endpoints pair that flows through the replication pipeline.

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation key marking a resource as owned by the replication pipeline.
pub const SYNCED_ANNOTATION: &str = "gke-service-sync/synced";

/// Expected value of [`SYNCED_ANNOTATION`].
pub const SYNCED_ANNOTATION_VALUE: &str = "synced";

/// A Service and its matching Endpoints object.
///
/// Both halves share the same name and namespace. On the wire the pair is a
/// JSON document of the form `{"service": {...}, "endpoints": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePair {
    /// The Service describing the stable access point.
    pub service: Service,
    /// The Endpoints listing the backends serving it.
    pub endpoints: Endpoints,
}

impl ResourcePair {
    /// Create a pair from a Service and its Endpoints.
    pub fn new(service: Service, endpoints: Endpoints) -> Self {
        Self { service, endpoints }
    }

    /// Namespace of the pair (taken from the Service).
    pub fn namespace(&self) -> String {
        self.service.namespace().unwrap_or_default()
    }

    /// Name of the pair (taken from the Service).
    pub fn name(&self) -> String {
        self.service.name_any()
    }

    /// Whether both halves agree on name and namespace.
    pub fn is_consistent(&self) -> bool {
        self.service.metadata.name == self.endpoints.metadata.name
            && self.service.metadata.namespace == self.endpoints.metadata.namespace
    }

    /// Display-friendly identity used in log fields.
    pub fn identity(&self) -> PairIdentity {
        PairIdentity {
            namespace: self.namespace(),
            name: self.name(),
        }
    }

    /// Stamp the synced marker on both the Service and the Endpoints.
    pub fn mark_synced(&mut self) {
        mark_synced(self.service.annotations_mut());
        mark_synced(self.endpoints.annotations_mut());
    }
}

/// `namespace/name` identity of a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairIdentity {
    /// Namespace.
    pub namespace: String,
    /// Name.
    pub name: String,
}

impl fmt::Display for PairIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Insert the synced marker into an annotation map.
pub fn mark_synced(annotations: &mut BTreeMap<String, String>) {
    annotations.insert(
        SYNCED_ANNOTATION.to_string(),
        SYNCED_ANNOTATION_VALUE.to_string(),
    );
}

/// Whether a resource carries the synced marker with its expected value.
pub fn is_synced<K: ResourceExt>(resource: &K) -> bool {
    resource
        .annotations()
        .get(SYNCED_ANNOTATION)
        .is_some_and(|v| v == SYNCED_ANNOTATION_VALUE)
}
