//! HTTP listener for the target role.

use super::receiver::SyncReceiver;
use crate::controller::SERVICES_PATH;
use crate::error::{SyncError, SyncResult};
use crate::shutdown::ShutdownSignal;
use bytes::Bytes;
use http::header::{ALLOW, CONTENT_TYPE, HeaderValue};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;

/// Pause after a failed `accept()`, e.g. while out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Target HTTP server: `/services`, `/healthz` and `/readyz`.
pub struct TargetServer {
    listener: TcpListener,
    receiver: SyncReceiver,
}

impl TargetServer {
    /// Bind to `addr`. Port `0` picks a free port.
    pub async fn bind(addr: SocketAddr, receiver: SyncReceiver) -> SyncResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::Io(format!("failed to bind {}: {}", addr, e)))?;
        Ok(Self { listener, receiver })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until shutdown, then let open connections finish their current request.
    pub async fn serve(self, mut shutdown: ShutdownSignal) -> SyncResult<()> {
        let addr = self.local_addr()?;
        tracing::info!(addr = %addr, "Target server listening");

        let mut connections = JoinSet::new();

        loop {
            let (stream, remote_addr) = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                accepted = self.listener.accept() => match accepted_or_pause(accepted).await {
                    Some(accepted) => accepted,
                    None => continue,
                },
            };

            let receiver = self.receiver.clone();
            let mut stop = shutdown.clone();

            connections.spawn(async move {
                let service = service_fn(move |req| {
                    let receiver = receiver.clone();
                    async move { route(req, receiver).await }
                });

                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                tokio::pin!(conn);

                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = stop.recv() => {
                        conn.as_mut().graceful_shutdown();
                        conn.as_mut().await
                    }
                };

                if let Err(e) = result
                    && !e.is_incomplete_message()
                {
                    tracing::warn!(remote = %remote_addr, error = %e, "HTTP connection error");
                }
            });

            while connections.try_join_next().is_some() {}
        }

        drop(self.listener);
        tracing::info!("Target server shutting down");
        while connections.join_next().await.is_some() {}
        tracing::info!("Target server stopped");
        Ok(())
    }
}

/// Unwrap an accepted connection, or log the error and pause before the next attempt.
async fn accepted_or_pause<T>(accepted: std::io::Result<T>) -> Option<T> {
    match accepted {
        Ok(accepted) => Some(accepted),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to accept connection");
            tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            None
        }
    }
}

async fn route(
    req: Request<Incoming>,
    receiver: SyncReceiver,
) -> Result<Response<Full<Bytes>>, Infallible> {
    tracing::debug!(method = %req.method(), path = %req.uri().path(), "Request");

    let response = match (req.method(), req.uri().path()) {
        (_, SERVICES_PATH) => services(req, receiver).await,
        (&Method::GET, "/healthz") => text(StatusCode::OK, "OK"),
        (&Method::GET, "/readyz") => text(StatusCode::OK, "Ready"),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

async fn services(req: Request<Incoming>, receiver: SyncReceiver) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    if method != Method::POST {
        let handled = receiver.handle(&method, &[]).await;
        let mut response = text(handled.status, handled.body);
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("POST"));
        return response;
    }

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<http_body_util::LengthLimitError>() => {
            tracing::warn!(limit = MAX_BODY_BYTES, "Request body too large");
            return text(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read request data");
            return text(
                StatusCode::BAD_REQUEST,
                format!("failed to read request data: {}", e),
            );
        }
    };

    let handled = receiver.handle(&method, &body).await;
    text(handled.status, handled.body)
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let body = body.into();
    let mut response = if status == StatusCode::NOT_MODIFIED || body.is_empty() {
        Response::new(Full::new(Bytes::new()))
    } else {
        let mut response = Response::new(Full::new(body));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    };
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use crate::resources::fixtures::live_pair;
    use crate::sanitize::sanitized;
    use crate::shutdown::Shutdown;
    use std::sync::Arc;

    async fn start() -> (Arc<InMemoryCluster>, String, Shutdown, tokio::task::JoinHandle<SyncResult<()>>) {
        let cluster = Arc::new(InMemoryCluster::new());
        let server = TargetServer::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            SyncReceiver::new(cluster.clone()),
        )
        .await
        .unwrap();
        let base = format!("http://{}", server.local_addr().unwrap());
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(server.serve(shutdown.subscribe()));
        (cluster, base, shutdown, handle)
    }

    #[tokio::test]
    async fn health_and_readiness() {
        let (_, base, shutdown, handle) = start().await;
        let http = reqwest::Client::new();

        let health = http.get(format!("{}/healthz", base)).send().await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);
        assert_eq!(health.text().await.unwrap(), "OK");

        let ready = http.get(format!("{}/readyz", base)).send().await.unwrap();
        assert_eq!(ready.text().await.unwrap(), "Ready");

        let missing = http.get(format!("{}/nope", base)).send().await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn services_rejects_other_methods() {
        let (cluster, base, shutdown, handle) = start().await;

        let response = reqwest::Client::new()
            .get(format!("{}/services", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get("allow").unwrap(), "POST");
        assert!(cluster.mutations().is_empty());

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn services_applies_posted_pair() {
        let (cluster, base, shutdown, handle) = start().await;
        let http = reqwest::Client::new();
        let body = serde_json::to_vec(&sanitized(&live_pair("shop", "cart"))).unwrap();

        let created = http
            .post(format!("{}/services", base))
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        assert!(cluster.service("shop", "cart").is_some());

        let malformed = http
            .post(format!("{}/services", base))
            .body("{")
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let (_, base, shutdown, handle) = start().await;

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let refused = reqwest::Client::new()
            .get(format!("{}/healthz", base))
            .timeout(Duration::from_secs(1))
            .send()
            .await;
        assert!(refused.is_err());
    }

    #[test]
    fn not_modified_has_no_body() {
        let response = text(StatusCode::NOT_MODIFIED, "ignored");
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(response.headers().get(CONTENT_TYPE).is_none());
    }

    #[tokio::test]
    async fn accept_error_pauses_before_retry() {
        let started = tokio::time::Instant::now();
        let accepted: Option<()> =
            accepted_or_pause(Err(std::io::Error::other("too many open files"))).await;
        assert!(accepted.is_none());
        assert!(started.elapsed() >= ACCEPT_RETRY_DELAY);

        assert_eq!(accepted_or_pause(Ok(7)).await, Some(7));
    }
}
