//! Control protocol shared by the proxy and its backends
//!
//! Every server in the system answers `GET /health` with 200 when ready and
//! `GET /stop` with 200 before shutting down gracefully. Ordinary traffic
//! carries an `X-Request-ID` header that backends echo back unmodified.

use crate::client::BackendClient;
use hyper::StatusCode;
use std::time::Duration;
use tracing::debug;

/// Liveness endpoint
pub const HEALTH_PATH: &str = "/health";
/// Graceful shutdown endpoint
pub const STOP_PATH: &str = "/stop";
/// Correlation header stamped by the pool and echoed by backends
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Bounded retry settings for `/health` polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Timeout for each individual call
    pub timeout: Duration,
    /// Pause after a failed attempt
    pub retry_interval: Duration,
    /// Maximum number of attempts
    pub max_retries: u32,
}

impl ProbeConfig {
    /// Settings used when waiting for a freshly started backend
    pub fn backend() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            retry_interval: Duration::from_secs(1),
            max_retries: 10,
        }
    }

    /// Settings used by the load generator when waiting for the proxy
    pub fn proxy() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            retry_interval: Duration::from_secs(1),
            max_retries: 3,
        }
    }

    /// Upper bound on the time a full probe can take
    pub fn window(&self) -> Duration {
        (self.timeout + self.retry_interval) * self.max_retries
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::backend()
    }
}

/// Poll `/health` until it answers 200 or the attempts run out
pub async fn probe_health(client: &BackendClient, address: &str, probe: &ProbeConfig) -> bool {
    for attempt in 1..=probe.max_retries {
        match client.get(address, HEALTH_PATH, probe.timeout).await {
            Ok(StatusCode::OK) => return true,
            Ok(status) => {
                debug!(address, attempt, %status, "Health check returned unhealthy");
            }
            Err(e) => {
                debug!(address, attempt, error = %e, "Waiting for backend");
            }
        }
        tokio::time::sleep(probe.retry_interval).await;
    }
    false
}

/// Ask a server to shut down; best-effort, true only on a 200 answer
pub async fn request_stop(client: &BackendClient, address: &str, timeout: Duration) -> bool {
    match client.get(address, STOP_PATH, timeout).await {
        Ok(status) => status == StatusCode::OK,
        Err(e) => {
            debug!(address, error = %e, "Stop request failed");
            false
        }
    }
}
