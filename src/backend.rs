//! Backend application server
//!
//! The server the pool provisions, either as the `spawnpool-backend` process
//! or as a task of the in-process launcher. Besides the control endpoints it
//! answers every request with its own address after a simulated processing
//! delay, echoing the correlation header it received.

use crate::control::{HEALTH_PATH, REQUEST_ID_HEADER, STOP_PATH};
use crate::server::{shutdown_requested, ConnectionGuard, ConnectionTracker};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Default simulated processing time
pub const DEFAULT_LATENCY_MS: u64 = 50;

/// Time allowed for open connections to finish once shutdown starts
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSettings {
    /// Serve one ordinary request, then shut down
    pub single_request: bool,
    /// Simulated processing time per request
    pub latency: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            single_request: false,
            latency: Duration::from_millis(DEFAULT_LATENCY_MS),
        }
    }
}

struct HandlerState {
    address: String,
    settings: BackendSettings,
    shutdown_tx: watch::Sender<bool>,
}

/// A backend server bound to one address
pub struct BackendServer {
    state: Arc<HandlerState>,
}

impl BackendServer {
    pub fn new(address: &str, settings: BackendSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(HandlerState {
                address: address.to_string(),
                settings,
                shutdown_tx,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.state.address
    }

    /// Bind the configured address and serve until stopped
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.state.address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.state.address, e))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until `/stop` or the single request
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let address = self.state.address.as_str();
        info!(
            address,
            single_request = self.state.settings.single_request,
            latency_ms = self.state.settings.latency.as_millis() as u64,
            "Origin server listening"
        );

        let mut shutdown_rx = self.state.shutdown_tx.subscribe();
        let tracker = ConnectionTracker::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(address, %peer, "Accepted connection");
                            let guard = tracker.track();
                            let state = Arc::clone(&self.state);
                            let shutdown_rx = self.state.shutdown_tx.subscribe();
                            tokio::spawn(serve_connection(stream, state, shutdown_rx, guard));
                        }
                        Err(e) => {
                            error!(address, error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_requested(&mut shutdown_rx) => {
                    break;
                }
            }
        }

        drop(listener);
        info!(address, "Stopped serving new connections");
        tracker.drain(SHUTDOWN_TIMEOUT).await;
        info!(address, "Origin server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<HandlerState>,
    mut shutdown_rx: watch::Receiver<bool>,
    _guard: ConnectionGuard,
) {
    let io = TokioIo::new(stream);
    let service_state = Arc::clone(&state);
    let service = service_fn(move |req| {
        let state = Arc::clone(&service_state);
        async move { handle_request(req, state).await }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!(address = %state.address, error = %e, "Connection error");
            }
        }
        _ = shutdown_requested(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!(address = %state.address, error = %e, "Connection error during shutdown");
            }
        }
    }
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("valid response with StatusCode enum")
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<HandlerState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        HEALTH_PATH => empty(StatusCode::OK),
        STOP_PATH => {
            info!(address = %state.address, "Stop requested");
            let _ = state.shutdown_tx.send(true);
            empty(StatusCode::OK)
        }
        path => {
            let request_id = req.headers().get(REQUEST_ID_HEADER).cloned();
            debug!(
                address = %state.address,
                method = %req.method(),
                path,
                request_id = ?request_id,
                "Origin server received request"
            );

            tokio::time::sleep(state.settings.latency).await;

            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "text/plain");
            if let Some(id) = request_id {
                builder = builder.header(REQUEST_ID_HEADER, id);
            }
            let body = format!("{} - origin server response", state.address);
            let response = builder
                .body(Full::new(Bytes::from(body)))
                .expect("valid response with static headers");

            if state.settings.single_request {
                info!(address = %state.address, "Single request served, shutting down");
                let _ = state.shutdown_tx.send(true);
            }
            response
        }
    };

    Ok(response)
}
