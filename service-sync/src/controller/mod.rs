//! Controller role: watch the source cluster and push pairs to peers.
//!
//! - [`SourceWatcher`]: turns Endpoints events into qualifying pairs
//! - [`Dispatcher`]: posts each pair to every peer
//!
//! [`Controller::run`] wires the two together and returns once the watcher
//! has emitted [`WatchOutput::EndOfStream`].

mod dispatcher;
mod watcher;

pub use dispatcher::{DispatchReport, Dispatcher, PeerOutcome, SERVICES_PATH, services_url};
pub use watcher::{
    INITIAL_BACKOFF, MAX_BACKOFF, SourceWatcher, WatchOutput, WatcherState,
};

use crate::cluster::ClusterApi;
use crate::config::ConfigHandle;
use crate::error::{SyncError, SyncResult};
use crate::shutdown::ShutdownSignal;
use std::sync::Arc;

/// Pairs buffered between the watcher and the dispatcher.
const PAIR_BUFFER: usize = 1;

/// Shared context for the controller role.
#[derive(Clone)]
pub struct ControllerContext {
    /// Source cluster.
    pub cluster: Arc<dyn ClusterApi>,
    /// Live configuration.
    pub config: ConfigHandle,
}

impl ControllerContext {
    /// Create a new controller context.
    pub fn new(cluster: Arc<dyn ClusterApi>, config: ConfigHandle) -> Self {
        Self { cluster, config }
    }
}

/// Runs the controller pipeline.
pub struct Controller {
    ctx: ControllerContext,
    watcher: SourceWatcher,
    dispatcher: Dispatcher,
}

impl Controller {
    /// Create a controller with the default reconnect backoff.
    pub fn new(ctx: ControllerContext) -> SyncResult<Self> {
        let watcher = SourceWatcher::new(Arc::clone(&ctx.cluster), ctx.config.clone());
        Ok(Self {
            ctx,
            watcher,
            dispatcher: Dispatcher::new()?,
        })
    }

    /// Replace the watcher, e.g. to tune its backoff.
    #[must_use]
    pub fn with_watcher(mut self, watcher: SourceWatcher) -> Self {
        self.watcher = watcher;
        self
    }

    /// Dispatch pairs until the watcher finishes.
    ///
    /// Peers and the request timeout are read from the configuration for
    /// every pair, so reloads apply to the next pair.
    ///
    /// # Errors
    ///
    /// Returns the watcher's fatal error, if any.
    pub async fn run(self, shutdown: ShutdownSignal) -> SyncResult<()> {
        tracing::info!("Starting controller");

        let (mut pairs, watcher) = self.watcher.spawn(shutdown, PAIR_BUFFER);

        while let Some(output) = pairs.recv().await {
            let pair = match output {
                WatchOutput::Pair(pair) => pair,
                WatchOutput::EndOfStream => break,
            };

            let config = self.ctx.config.snapshot();
            if config.peers.is_empty() {
                tracing::debug!(pair = %pair.identity(), "No peers configured, dropping pair");
                continue;
            }

            if let Err(e) = self
                .dispatcher
                .dispatch(&pair, &config.peers, config.peer_timeout)
                .await
            {
                tracing::error!(pair = %pair.identity(), error = %e, "Failed to dispatch pair");
            }
        }

        let result = watcher
            .await
            .map_err(|e| SyncError::Watch(format!("watcher task failed: {}", e)))?;
        tracing::info!("Controller stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::config::parse_config;
    use crate::resources::ResourcePair;
    use crate::resources::fixtures::{live_endpoints, live_service};
    use crate::shutdown::Shutdown;
    use kube::api::WatchEvent;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn wait_for_requests(server: &MockServer, count: usize) {
        for _ in 0..100 {
            if server.received_requests().await.unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("peer did not receive {} requests", count);
    }

    #[tokio::test]
    async fn pushes_watched_pairs_to_every_peer() {
        let first = MockServer::start().await;
        let second = MockServer::start().await;
        for server in [&first, &second] {
            Mock::given(method("POST"))
                .and(path("/services"))
                .respond_with(ResponseTemplate::new(200))
                .mount(server)
                .await;
        }

        let cluster = InMemoryCluster::new();
        cluster.seed_namespace("shop");
        cluster.seed_service(live_service("shop", "cart"));
        cluster.push_watch(vec![
            Ok(WatchEvent::Added(live_endpoints("shop", "cart"))),
            Ok(WatchEvent::Added(live_endpoints("billing", "cart"))),
        ]);

        let yaml = format!(
            "runMode: controller\nsyncNamespaces: [shop]\npeers:\n  - {}\n  - {}/\n",
            first.uri(),
            second.uri()
        );
        let config = ConfigHandle::new(parse_config(&yaml).unwrap());
        let ctx = ControllerContext::new(Arc::new(cluster), config);

        let shutdown = Shutdown::new();
        let controller = Controller::new(ctx).unwrap();
        let running = tokio::spawn(controller.run(shutdown.subscribe()));

        wait_for_requests(&first, 1).await;
        wait_for_requests(&second, 1).await;

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let requests = first.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let sent: ResourcePair = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(sent.identity().to_string(), "shop/cart");
    }

    #[tokio::test]
    async fn fatal_watch_error_ends_run() {
        let cluster = InMemoryCluster::new().with_endpoint_slices();
        let config = ConfigHandle::new(parse_config("runMode: controller\n").unwrap());
        let ctx = ControllerContext::new(Arc::new(cluster), config);

        let shutdown = Shutdown::new();
        let err = Controller::new(ctx)
            .unwrap()
            .run(shutdown.subscribe())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedRepresentation(_)));
    }
}
