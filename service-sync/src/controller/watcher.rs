//! Resilient watch on the source cluster's Endpoints.
//!
//! State machine:
//!
//! ```text
//!   Connecting ──opened──▶ Watching ──closed──▶ Connecting (immediately)
//!        ▲                    │
//!        └──backoff── error ──┘
//!
//!   any state ──shutdown──▶ Stopping ──EndOfStream sent──▶ Stopped
//! ```
//!
//! Every qualifying add/modify event is resolved into a [`ResourcePair`] and
//! sent downstream as [`WatchOutput::Pair`]. The last value sent is always
//! [`WatchOutput::EndOfStream`].

use crate::cluster::{ClusterApi, EndpointsWatch};
use crate::config::ConfigHandle;
use crate::error::{SyncError, SyncResult};
use crate::filter::FilterPolicy;
use crate::resources::ResourcePair;
use crate::shutdown::ShutdownSignal;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::ResourceExt;
use kube::api::WatchEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Delay before the first reconnect after an error.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on the reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Value emitted by the watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutput {
    /// A pair that qualifies for replication.
    Pair(ResourcePair),
    /// No further pairs will arrive.
    EndOfStream,
}

/// Lifecycle state of the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Checking the cluster and opening a watch.
    Connecting,
    /// Consuming watch events.
    Watching,
    /// Shutting down, about to emit end-of-stream.
    Stopping,
    /// Finished.
    Stopped,
}

/// Why a watch stopped being consumed.
enum WatchEnd {
    /// The server closed the stream.
    Closed,
    /// The stream reported an error.
    Failed,
    /// Shutdown was requested.
    Shutdown,
    /// Nobody is listening for pairs anymore.
    ReceiverGone,
}

/// Doubling reconnect delay between `initial` and `max`, without jitter.
fn reconnect_policy(initial: Duration, max: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(initial)
        .with_max_delay(max.max(initial))
        .with_factor(2.0)
        .with_max_times(usize::MAX)
}

/// Watches Endpoints in all namespaces and emits qualifying pairs.
pub struct SourceWatcher {
    cluster: Arc<dyn ClusterApi>,
    config: ConfigHandle,
    policy: ExponentialBuilder,
    backoff: ExponentialBackoff,
    max_backoff: Duration,
    state: watch::Sender<WatcherState>,
}

impl SourceWatcher {
    /// Create a watcher over `cluster` using the live configuration in `config`.
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ConfigHandle) -> Self {
        let (state, _) = watch::channel(WatcherState::Connecting);
        let policy = reconnect_policy(INITIAL_BACKOFF, MAX_BACKOFF);
        Self {
            cluster,
            config,
            policy,
            backoff: policy.build(),
            max_backoff: MAX_BACKOFF,
            state,
        }
    }

    /// Override the reconnect backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.policy = reconnect_policy(initial, max);
        self.backoff = self.policy.build();
        self.max_backoff = max.max(initial);
        self
    }

    /// Observe state transitions.
    pub fn states(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Run the watcher on its own task.
    ///
    /// Returns the receiving end of the output channel and the task handle.
    pub fn spawn(
        self,
        shutdown: ShutdownSignal,
        capacity: usize,
    ) -> (mpsc::Receiver<WatchOutput>, JoinHandle<SyncResult<()>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(self.run(tx, shutdown));
        (rx, handle)
    }

    /// Run until shutdown or a fatal error.
    ///
    /// [`WatchOutput::EndOfStream`] is sent on every exit path. A fatal error
    /// (the cluster uses EndpointSlices) is returned after it.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<WatchOutput>,
        mut shutdown: ShutdownSignal,
    ) -> SyncResult<()> {
        let result = loop {
            self.transition(WatcherState::Connecting);

            let opened = tokio::select! {
                biased;
                _ = shutdown.recv() => break Ok(()),
                opened = self.connect() => opened,
            };

            let stream = match opened {
                Ok(stream) => stream,
                Err(e @ SyncError::UnsupportedRepresentation(_)) => {
                    tracing::error!(error = %e, "Stopping watcher");
                    break Err(e);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to open endpoints watch");
                    if self.pause(&mut shutdown).await {
                        break Ok(());
                    }
                    continue;
                }
            };

            self.transition(WatcherState::Watching);
            match self.consume(stream, &tx, &mut shutdown).await {
                WatchEnd::Closed => {
                    tracing::debug!("Endpoints watch closed by server, reconnecting");
                }
                WatchEnd::Failed => {
                    if self.pause(&mut shutdown).await {
                        break Ok(());
                    }
                }
                WatchEnd::Shutdown => break Ok(()),
                WatchEnd::ReceiverGone => {
                    tracing::debug!("Pair receiver dropped, stopping watcher");
                    self.transition(WatcherState::Stopped);
                    return Ok(());
                }
            }
        };

        self.transition(WatcherState::Stopping);
        tracing::debug!("Stopped watching endpoints");
        let _ = tx.send(WatchOutput::EndOfStream).await;
        self.transition(WatcherState::Stopped);

        result
    }

    fn transition(&self, next: WatcherState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Watcher state change");
        }
    }

    /// Refuse EndpointSlice clusters, then open the watch.
    async fn connect(&self) -> SyncResult<EndpointsWatch> {
        tracing::debug!("Creating endpoints watcher");

        match self.cluster.uses_endpoint_slices().await {
            Ok(true) => {
                return Err(SyncError::UnsupportedRepresentation(
                    "EndpointSlices detected in the source cluster; only core/v1 Endpoints can be replicated"
                        .into(),
                ));
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Could not check for EndpointSlices, continuing");
            }
        }

        self.cluster.watch_endpoints().await
    }

    /// Sleep for the next backoff delay. Returns `true` if shutdown arrived first.
    async fn pause(&mut self, shutdown: &mut ShutdownSignal) -> bool {
        let delay = self.backoff.next().unwrap_or(self.max_backoff);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        tokio::select! {
            biased;
            _ = shutdown.recv() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// Consume one watch stream until it ends. Dropping the stream closes the watch.
    async fn consume(
        &mut self,
        mut stream: EndpointsWatch,
        tx: &mpsc::Sender<WatchOutput>,
        shutdown: &mut ShutdownSignal,
    ) -> WatchEnd {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::debug!("Received stop signal, closing endpoints watch");
                    return WatchEnd::Shutdown;
                }
                event = stream.next() => event,
            };

            match event {
                None => return WatchEnd::Closed,
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Endpoints watch failed");
                    return WatchEnd::Failed;
                }
                Some(Ok(WatchEvent::Error(e))) => {
                    tracing::warn!(
                        code = e.code,
                        reason = %e.reason,
                        message = %e.message,
                        "Endpoints watch returned an error event"
                    );
                    return WatchEnd::Failed;
                }
                Some(Ok(WatchEvent::Added(endpoints) | WatchEvent::Modified(endpoints))) => {
                    self.backoff = self.policy.build();
                    if let Some(pair) = self.resolve(endpoints).await
                        && tx.send(WatchOutput::Pair(pair)).await.is_err()
                    {
                        return WatchEnd::ReceiverGone;
                    }
                }
                Some(Ok(WatchEvent::Deleted(endpoints))) => {
                    tracing::debug!(
                        namespace = %endpoints.namespace().unwrap_or_default(),
                        name = %endpoints.name_any(),
                        "Ignoring endpoints deletion"
                    );
                }
                Some(Ok(WatchEvent::Bookmark(_))) => {}
            }
        }
    }

    /// Fetch the sibling Service and apply the filter policy.
    async fn resolve(&self, endpoints: Endpoints) -> Option<ResourcePair> {
        let config = self.config.snapshot();
        let policy = FilterPolicy::new(&config);
        policy.precheck(&endpoints).ok()?;

        let namespace = endpoints.namespace().unwrap_or_default();
        let name = endpoints.name_any();

        let service = match self.cluster.get_service(&namespace, &name).await {
            Ok(Some(service)) => service,
            Ok(None) => {
                tracing::warn!(namespace = %namespace, name = %name, "No service found for endpoints");
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    namespace = %namespace,
                    name = %name,
                    error = %e,
                    "Failed to get service"
                );
                return None;
            }
        };

        policy.evaluate(&service, &endpoints).ok()?;

        let pair = ResourcePair::new(service, endpoints);
        tracing::debug!(pair = ?pair, "Emitting pair for replication");
        Some(pair)
    }
}
