//! Load generation against a running proxy
//!
//! A fixed pool of worker tasks shares one request budget. Every worker keeps
//! taking requests from the budget until it is spent, so the number of
//! concurrent requests never exceeds the number of workers.

use crate::client::{BackendClient, ProxyBody};
use crate::control::STOP_PATH;
use crate::pool::UsageReport;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of one load run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub success: usize,
    pub errors: usize,
    pub elapsed: Duration,
}

impl LoadReport {
    pub fn total(&self) -> usize {
        self.success + self.errors
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Results:")?;
        writeln!(f, "Took {:?}", self.elapsed)?;
        write!(f, "Success: {}\tError: {}", self.success, self.errors)
    }
}

/// Settings for one load run
#[derive(Debug, Clone)]
pub struct LoadSettings {
    /// Proxy address (host:port)
    pub address: String,
    pub requests: usize,
    pub workers: usize,
    /// Per-request timeout
    pub timeout: Duration,
}

fn empty_request(address: &str, path: &str) -> Result<Request<ProxyBody>, hyper::http::Error> {
    Request::builder()
        .method("GET")
        .uri(format!("http://{}{}", address, path))
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
}

/// Send one GET and report whether it was answered with 200
async fn send_one(client: &BackendClient, address: &str, timeout: Duration) -> bool {
    let req = match empty_request(address, "/") {
        Ok(req) => req,
        Err(e) => {
            warn!(address, error = %e, "Invalid proxy address");
            return false;
        }
    };

    match tokio::time::timeout(timeout, client.forward(req)).await {
        Ok(Ok(response)) => {
            let status = response.status();
            // Read the body so the connection can be reused
            if let Err(e) = response.into_body().collect().await {
                debug!(error = %e, "Failed to read response body");
                return false;
            }
            status == StatusCode::OK
        }
        Ok(Err(e)) => {
            debug!(address, error = %e, "Error sending request");
            false
        }
        Err(_) => {
            debug!(address, timeout_ms = timeout.as_millis() as u64, "Request timed out");
            false
        }
    }
}

/// Fire `settings.requests` requests through `settings.workers` workers
pub async fn run_load(client: &BackendClient, settings: &LoadSettings) -> LoadReport {
    let started = Instant::now();
    let remaining = Arc::new(AtomicUsize::new(settings.requests));
    let success = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));

    let workers = (1..=settings.workers.max(1)).map(|id| {
        let client = client.clone();
        let address = settings.address.clone();
        let timeout = settings.timeout;
        let remaining = Arc::clone(&remaining);
        let success = Arc::clone(&success);
        let errors = Arc::clone(&errors);

        tokio::spawn(async move {
            while take_job(&remaining) {
                if send_one(&client, &address, timeout).await {
                    success.fetch_add(1, Ordering::Relaxed);
                } else {
                    errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            debug!(worker = id, "Worker finished");
        })
    });

    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            warn!(error = %e, "Load worker panicked");
        }
    }

    LoadReport {
        success: success.load(Ordering::Relaxed),
        errors: errors.load(Ordering::Relaxed),
        elapsed: started.elapsed(),
    }
}

fn take_job(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Ask the proxy to stop and return the usage report it answered with
pub async fn stop_proxy(
    client: &BackendClient,
    address: &str,
    timeout: Duration,
) -> anyhow::Result<UsageReport> {
    let req = empty_request(address, STOP_PATH)?;
    let response = tokio::time::timeout(timeout, client.forward(req))
        .await
        .map_err(|_| anyhow::anyhow!("Proxy did not answer /stop within {:?}", timeout))??;

    let status = response.status();
    if status != StatusCode::OK {
        anyhow::bail!("Proxy answered /stop with {}", status);
    }

    let body = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body)?)
}
