//! Removal of server-assigned and cluster-specific fields.
//!
//! A pair read from one cluster carries identity, bookkeeping and topology
//! fields that belong to that cluster only. Sanitizing clears them so the
//! pair can be transmitted and re-created elsewhere.

use crate::resources::ResourcePair;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Annotation written by `kubectl apply` on the source Service.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Annotation written by the endpoints controller on the source Endpoints.
pub const LAST_CHANGE_TRIGGER_ANNOTATION: &str = "endpoints.kubernetes.io/last-change-trigger-time";

/// Sanitize a pair in place.
///
/// Idempotent: sanitizing an already sanitized pair changes nothing.
pub fn sanitize(pair: &mut ResourcePair) {
    sanitize_service(&mut pair.service);
    sanitize_endpoints(&mut pair.endpoints);
}

/// Return a sanitized copy of a pair, leaving the original untouched.
pub fn sanitized(pair: &ResourcePair) -> ResourcePair {
    let mut copy = pair.clone();
    sanitize(&mut copy);
    copy
}

fn clear_server_metadata(meta: &mut ObjectMeta) {
    meta.self_link = None;
    meta.uid = None;
    meta.resource_version = None;
    meta.creation_timestamp = None;
    meta.managed_fields = None;
}

fn remove_annotation(meta: &mut ObjectMeta, key: &str) {
    if let Some(annotations) = meta.annotations.as_mut() {
        annotations.remove(key);
    }
}

fn sanitize_service(service: &mut Service) {
    clear_server_metadata(&mut service.metadata);
    remove_annotation(&mut service.metadata, LAST_APPLIED_ANNOTATION);
    service.status = None;

    if let Some(spec) = service.spec.as_mut() {
        spec.cluster_ip = None;
        spec.cluster_ips = None;
        spec.selector = None;
    }
}

fn sanitize_endpoints(endpoints: &mut Endpoints) {
    clear_server_metadata(&mut endpoints.metadata);
    remove_annotation(&mut endpoints.metadata, LAST_CHANGE_TRIGGER_ANNOTATION);

    for subset in endpoints.subsets.iter_mut().flatten() {
        for address in subset.addresses.iter_mut().flatten() {
            address.node_name = None;
            address.target_ref = None;
        }
        subset.not_ready_addresses = None;
    }
}
