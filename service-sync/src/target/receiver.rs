//! Applies pairs pushed by a controller to the local cluster.
//!
//! | Existing Service | Synced marker | Action                                  | Status |
//! |------------------|---------------|-----------------------------------------|--------|
//! | no               |               | ensure namespace, create Service + Endpoints | 201 |
//! | yes              | yes           | replace (or create missing) Endpoints only | 201 |
//! | yes              | no            | leave untouched                         | 304    |

use crate::cluster::ClusterApi;
use crate::error::{SyncError, SyncResult};
use crate::resources::{ResourcePair, SYNCED_ANNOTATION, SYNCED_ANNOTATION_VALUE, is_synced};
use crate::sanitize::sanitize;
use http::{Method, StatusCode};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What [`SyncReceiver::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Service and Endpoints were created.
    Created,
    /// The Endpoints of an already synced Service were replaced.
    Updated,
    /// A Service not managed by this system already exists.
    Skipped,
}

impl ApplyOutcome {
    /// HTTP status reported to the controller.
    pub fn status(self) -> StatusCode {
        match self {
            ApplyOutcome::Created | ApplyOutcome::Updated => StatusCode::CREATED,
            ApplyOutcome::Skipped => StatusCode::NOT_MODIFIED,
        }
    }
}

/// Status and plain-text body of a handled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response body. Empty for `304`.
    pub body: String,
}

impl ReceiverResponse {
    fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Target-side request handling for `/services`.
#[derive(Clone)]
pub struct SyncReceiver {
    cluster: Arc<dyn ClusterApi>,
}

impl SyncReceiver {
    /// Create a receiver writing into `cluster`.
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Handle one request with the given method and raw body.
    pub async fn handle(&self, method: &Method, body: &[u8]) -> ReceiverResponse {
        if method != Method::POST {
            tracing::warn!(method = %method, "Received unsupported method on /services");
            return ReceiverResponse::new(
                StatusCode::METHOD_NOT_ALLOWED,
                "Only POST method supported.",
            );
        }

        let pair = match decode(body) {
            Ok(pair) => pair,
            Err(message) => {
                tracing::warn!(error = %message, "Rejected pair");
                return ReceiverResponse::new(StatusCode::BAD_REQUEST, message);
            }
        };

        let identity = pair.identity();
        match self.apply(pair).await {
            Ok(outcome) => {
                let body = match outcome {
                    ApplyOutcome::Created => format!("created {}", identity),
                    ApplyOutcome::Updated => format!("updated endpoints {}", identity),
                    ApplyOutcome::Skipped => String::new(),
                };
                ReceiverResponse::new(outcome.status(), body)
            }
            Err(e) => {
                tracing::error!(pair = %identity, error = %e, "Failed to apply pair");
                ReceiverResponse::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    /// Sanitize, mark and apply a decoded pair.
    ///
    /// # Errors
    ///
    /// Any cluster API failure aborts the apply and is returned as is.
    pub async fn apply(&self, mut pair: ResourcePair) -> SyncResult<ApplyOutcome> {
        sanitize(&mut pair);
        pair.mark_synced();
        tracing::debug!(pair = ?pair, "Applying pair");

        let namespace = pair.namespace();
        let name = pair.name();

        let existing = self
            .cluster
            .get_service(&namespace, &name)
            .await
            .map_err(|e| context(e, format!("failed to get service '{}' (ns:{})", name, namespace)))?;

        match existing {
            None => {
                self.create(pair).await?;
                tracing::info!(namespace = %namespace, name = %name, "Created service and endpoints");
                Ok(ApplyOutcome::Created)
            }
            Some(service) if is_synced(&service) => {
                self.update_endpoints(pair).await?;
                tracing::info!(namespace = %namespace, name = %name, "Updated endpoints");
                Ok(ApplyOutcome::Updated)
            }
            Some(_) => {
                tracing::info!(
                    namespace = %namespace,
                    name = %name,
                    "Skipping existing service not managed by service-sync"
                );
                Ok(ApplyOutcome::Skipped)
            }
        }
    }

    async fn create(&self, pair: ResourcePair) -> SyncResult<()> {
        let namespace = pair.namespace();
        let name = pair.name();

        self.ensure_namespace(&namespace).await?;

        self.cluster
            .create_service(&pair.service)
            .await
            .map_err(|e| context(e, format!("failed to create service '{}' (ns:{})", name, namespace)))?;

        self.cluster
            .create_endpoints(&pair.endpoints)
            .await
            .map_err(|e| context(e, format!("failed to create endpoints '{}' (ns:{})", name, namespace)))?;

        Ok(())
    }

    /// Replace the Endpoints, carrying over the stored resource version.
    ///
    /// A concurrent writer bumping the version in between makes the replace
    /// fail with a conflict. Endpoints missing next to a synced Service (an
    /// earlier create stopped halfway) are created instead.
    async fn update_endpoints(&self, mut pair: ResourcePair) -> SyncResult<()> {
        let namespace = pair.namespace();
        let name = pair.name();

        let current = self
            .cluster
            .get_endpoints(&namespace, &name)
            .await
            .map_err(|e| context(e, format!("failed to get endpoints '{}' (ns:{})", name, namespace)))?;

        let Some(current) = current else {
            tracing::warn!(
                namespace = %namespace,
                name = %name,
                "Synced service has no endpoints, creating them"
            );
            self.cluster
                .create_endpoints(&pair.endpoints)
                .await
                .map_err(|e| context(e, format!("failed to create endpoints '{}' (ns:{})", name, namespace)))?;
            return Ok(());
        };

        pair.endpoints.metadata.resource_version = current.metadata.resource_version;

        self.cluster
            .replace_endpoints(&pair.endpoints)
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    SyncError::Conflict {
                        kind: "Endpoints".to_string(),
                        name: format!("{}/{}", namespace, name),
                        cause: e.to_string(),
                    }
                } else {
                    context(e, format!("failed to update endpoints '{}' (ns:{})", name, namespace))
                }
            })?;

        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> SyncResult<()> {
        let found = self
            .cluster
            .get_namespace(namespace)
            .await
            .map_err(|e| context(e, format!("failed to get namespace '{}'", namespace)))?;
        if found.is_some() {
            return Ok(());
        }

        let created = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                annotations: Some(BTreeMap::from([(
                    SYNCED_ANNOTATION.to_string(),
                    SYNCED_ANNOTATION_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        match self.cluster.create_namespace(&created).await {
            Ok(_) => {
                tracing::info!(namespace = %namespace, "Created namespace");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                tracing::debug!(namespace = %namespace, "Namespace created concurrently");
                Ok(())
            }
            Err(e) => Err(context(e, format!("failed to create namespace '{}'", namespace))),
        }
    }
}

/// Decode and validate a request body.
fn decode(body: &[u8]) -> Result<ResourcePair, String> {
    let pair: ResourcePair =
        serde_json::from_slice(body).map_err(|e| format!("failed to decode pair: {}", e))?;

    if pair.service.metadata.name.as_deref().unwrap_or_default().is_empty()
        || pair.service.metadata.namespace.as_deref().unwrap_or_default().is_empty()
    {
        return Err("service name and namespace are required".to_string());
    }
    if !pair.is_consistent() {
        return Err(format!(
            "service and endpoints must share name and namespace ({})",
            pair.identity()
        ));
    }
    Ok(pair)
}

/// Attach what was being attempted to a cluster error.
fn context(err: SyncError, action: String) -> SyncError {
    SyncError::Apply {
        action,
        source: Box::new(err),
    }
}
