//! Fan-out of pairs to target peers.

use crate::error::{SyncError, SyncResult};
use crate::resources::{PairIdentity, ResourcePair};
use crate::sanitize::sanitized;
use bytes::Bytes;
use reqwest::{Client as HttpClient, StatusCode, header};
use std::time::Duration;
use tokio::task::JoinSet;

/// Path the target role serves pairs on.
pub const SERVICES_PATH: &str = "/services";

/// Longest response body kept in a failure message.
const MAX_ERROR_BODY: usize = 256;

/// Result of pushing one pair to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOutcome {
    /// The peer applied the pair.
    Delivered(StatusCode),
    /// The peer already had it (`304 Not Modified`).
    Skipped,
    /// Transport failure or non-success status.
    Failed(String),
}

/// Per-pair delivery summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Peers that applied the pair.
    pub delivered: usize,
    /// Peers that reported no change.
    pub skipped: usize,
    /// Peers that could not be reached or returned an error.
    pub failed: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: &PeerOutcome) {
        match outcome {
            PeerOutcome::Delivered(_) => self.delivered += 1,
            PeerOutcome::Skipped => self.skipped += 1,
            PeerOutcome::Failed(_) => self.failed += 1,
        }
    }

    /// Number of peers attempted.
    pub fn total(&self) -> usize {
        self.delivered + self.skipped + self.failed
    }
}

/// Full URL of a peer's services endpoint.
pub fn services_url(peer: &str) -> String {
    format!("{}{}", peer.trim_end_matches('/'), SERVICES_PATH)
}

/// Sends sanitized pairs to every peer concurrently.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    http: HttpClient,
}

impl Dispatcher {
    /// Create a dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> SyncResult<Self> {
        let http = HttpClient::builder()
            .build()
            .map_err(|e| SyncError::Http(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    /// Push `pair` to each of `peers`, waiting for all of them.
    ///
    /// The pair is sanitized and encoded once. Each request is bounded by
    /// `timeout`; one slow or failing peer never affects the others.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pair cannot be serialized.
    pub async fn dispatch(
        &self,
        pair: &ResourcePair,
        peers: &[String],
        timeout: Duration,
    ) -> SyncResult<DispatchReport> {
        let identity = pair.identity();
        let body = Bytes::from(serde_json::to_vec(&sanitized(pair))?);

        let mut pushes = JoinSet::new();
        for peer in peers {
            let http = self.http.clone();
            let url = services_url(peer);
            let body = body.clone();
            let identity = identity.clone();
            pushes.spawn(async move { push(http, url, body, timeout, identity).await });
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = pushes.join_next().await {
            let outcome = joined.unwrap_or_else(|e| PeerOutcome::Failed(format!("push task failed: {}", e)));
            report.record(&outcome);
        }

        tracing::debug!(
            pair = %identity,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "Dispatched pair"
        );
        Ok(report)
    }
}

async fn push(
    http: HttpClient,
    url: String,
    body: Bytes,
    timeout: Duration,
    identity: PairIdentity,
) -> PeerOutcome {
    tracing::debug!(peer = %url, pair = %identity, "Pushing pair");

    let response = http
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .timeout(timeout)
        .body(body)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(peer = %url, pair = %identity, error = %e, "Failed to push pair");
            return PeerOutcome::Failed(e.to_string());
        }
    };

    let status = response.status();
    if status == StatusCode::NOT_MODIFIED {
        tracing::info!(peer = %url, pair = %identity, "Peer already has pair");
        return PeerOutcome::Skipped;
    }
    if status.is_success() {
        tracing::info!(peer = %url, pair = %identity, status = status.as_u16(), "Pushed pair");
        return PeerOutcome::Delivered(status);
    }

    let mut text = response.text().await.unwrap_or_default();
    if text.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    tracing::warn!(
        peer = %url,
        pair = %identity,
        status = status.as_u16(),
        body = %text.trim(),
        "Peer rejected pair"
    );
    PeerOutcome::Failed(format!("{}: {}", status, text.trim()))
}
