//! Shared HTTP client for backend traffic
//!
//! One client forwards proxied requests and a second one, with an empty body
//! type, carries the `/health` and `/stop` control calls. Both keep idle
//! connections per backend address.

use http_body_util::{combinators::BoxBody, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Body type of requests handed to backends
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Error type for control calls
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(#[from] hyper::http::Error),
    /// The call did not finish in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Statistics for backend calls
#[derive(Debug, Default)]
pub struct ClientStats {
    /// Total number of forwarded requests
    pub forwarded: AtomicU64,
    /// Total number of control requests (/health and /stop)
    pub control_calls: AtomicU64,
}

impl ClientStats {
    pub fn record_forward(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_control_call(&self) {
        self.control_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn get_control_calls(&self) -> u64 {
        self.control_calls.load(Ordering::Relaxed)
    }
}

/// HTTP client for backend servers; cheap to clone
#[derive(Clone)]
pub struct BackendClient {
    client: Client<HttpConnector, ProxyBody>,
    control_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<ClientStats>,
}

impl Default for BackendClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendClient {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new()).build(connector.clone());
        let control_client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            control_client,
            stats: Arc::new(ClientStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        Arc::clone(&self.stats)
    }

    /// Send an already rewritten request to its backend
    pub async fn forward(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        self.stats.record_forward();
        self.client.request(req).await
    }

    /// Issue a control GET and return the status code
    pub async fn get(
        &self,
        address: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<StatusCode, ClientError> {
        let req = Request::builder()
            .method("GET")
            .uri(format!("http://{}{}", address, path))
            .body(Empty::<Bytes>::new())?;

        self.stats.record_control_call();

        match tokio::time::timeout(timeout, self.control_client.request(req)).await {
            Ok(Ok(response)) => {
                debug!(address, path, status = %response.status(), "Control call answered");
                Ok(response.status())
            }
            Ok(Err(e)) => Err(ClientError::Client(e)),
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }
}
