//! Integration tests for Spawnpool

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use spawnpool::client::{BackendClient, ProxyBody};
use spawnpool::control::{ProbeConfig, REQUEST_ID_HEADER};
use spawnpool::error::ForwardError;
use spawnpool::lifecycle::{BackendCommand, BackendLauncher, InProcessLauncher, ProcessLauncher};
use spawnpool::loadgen::{run_load, stop_proxy, LoadSettings};
use spawnpool::pool::{Pool, PoolSettings};
use spawnpool::proxy::ProxyServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn quick_probe() -> ProbeConfig {
    ProbeConfig {
        timeout: Duration::from_millis(500),
        retry_interval: Duration::from_millis(50),
        max_retries: 40,
    }
}

fn in_process_launcher(latency: Duration) -> Arc<InProcessLauncher> {
    Arc::new(InProcessLauncher::new(
        latency,
        BackendClient::new(),
        quick_probe(),
    ))
}

/// Start a front door on an ephemeral port
async fn start_proxy(
    settings: PoolSettings,
    launcher: Arc<dyn BackendLauncher>,
) -> (String, Arc<Pool>, JoinHandle<anyhow::Result<()>>) {
    let pool = Pool::new(settings, launcher, BackendClient::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (shutdown_tx, _) = watch::channel(false);
    let server = ProxyServer::new(address.clone(), Arc::clone(&pool), Arc::new(shutdown_tx))
        .with_shutdown_timeout(Duration::from_secs(2));
    (address, pool, tokio::spawn(server.serve(listener)))
}

/// Send a simple HTTP request and get response
async fn http_get(address: &str, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(address).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, address
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn body_of(response: &str) -> &str {
    response.split("\r\n\r\n").nth(1).unwrap_or("")
}

fn request(path: &str) -> Request<ProxyBody> {
    Request::builder()
        .uri(path)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .unwrap()
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Per-backend bookkeeping of the recording test backend
#[derive(Default)]
struct Recorder {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    served: AtomicUsize,
}

/// Launcher running a minimal backend that records concurrency
///
/// With `wrong_id` set the backend answers with a correlation ID that never
/// matches the request.
struct RecordingLauncher {
    latency: Duration,
    wrong_id: bool,
    recorders: DashMap<String, Arc<Recorder>>,
    tasks: DashMap<String, JoinHandle<()>>,
}

impl RecordingLauncher {
    fn new(latency: Duration, wrong_id: bool) -> Self {
        Self {
            latency,
            wrong_id,
            recorders: DashMap::new(),
            tasks: DashMap::new(),
        }
    }

    fn max_in_flight(&self) -> usize {
        self.recorders
            .iter()
            .map(|r| r.max_in_flight.load(Ordering::SeqCst))
            .max()
            .unwrap_or(0)
    }

    fn served(&self) -> usize {
        self.recorders
            .iter()
            .map(|r| r.served.load(Ordering::SeqCst))
            .sum()
    }
}

async fn recording_handler(
    req: Request<Incoming>,
    recorder: Arc<Recorder>,
    latency: Duration,
    wrong_id: bool,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() == "/health" {
        return Ok(Response::new(Full::new(Bytes::new())));
    }

    let current = recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    recorder.max_in_flight.fetch_max(current, Ordering::SeqCst);
    tokio::time::sleep(latency).await;
    recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
    recorder.served.fetch_add(1, Ordering::SeqCst);

    let id = if wrong_id {
        "not-the-id".to_string()
    } else {
        req.headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    Ok(Response::builder()
        .header(REQUEST_ID_HEADER, id)
        .body(Full::new(Bytes::from("recorded")))
        .unwrap())
}

#[async_trait]
impl BackendLauncher for RecordingLauncher {
    async fn start(&self, address: &str, _single_request: bool) -> anyhow::Result<()> {
        let listener = TcpListener::bind(address).await?;
        let recorder = Arc::new(Recorder::default());
        self.recorders
            .insert(address.to_string(), Arc::clone(&recorder));

        let latency = self.latency;
        let wrong_id = self.wrong_id;
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let recorder = Arc::clone(&recorder);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        recording_handler(req, Arc::clone(&recorder), latency, wrong_id)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        self.tasks.insert(address.to_string(), task);
        Ok(())
    }

    async fn check_health(&self, address: &str) -> bool {
        self.tasks.contains_key(address)
    }

    async fn stop(&self, address: &str) -> bool {
        match self.tasks.remove(address) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

/// Launcher whose backends never pass a health check
#[derive(Default)]
struct NeverHealthyLauncher {
    probes: AtomicUsize,
}

#[async_trait]
impl BackendLauncher for NeverHealthyLauncher {
    async fn start(&self, _address: &str, _single_request: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn check_health(&self, _address: &str) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        false
    }

    async fn stop(&self, _address: &str) -> bool {
        false
    }
}

// ============================================================================
// Pool behavior through the front door
// ============================================================================

#[tokio::test]
async fn test_cap_one_sequential_requests() {
    let settings = PoolSettings {
        backend_cap: 1,
        ..Default::default()
    };
    let (address, pool, handle) = start_proxy(settings, in_process_launcher(Duration::from_millis(1))).await;

    let mut origins = HashSet::new();
    for _ in 0..5 {
        let response = http_get(&address, "/").await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
        origins.insert(body_of(&response).to_string());
    }
    assert_eq!(origins.len(), 1, "all requests served by one backend");

    let response = http_get(&address, "/stop").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let report: serde_json::Value = serde_json::from_str(body_of(&response)).unwrap();
    assert_eq!(report["total_requests"], 5);
    assert_eq!(report["mismatches"], 0);
    assert_eq!(report["backends"].as_object().unwrap().len(), 1);

    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("proxy exits after /stop")
        .unwrap()
        .unwrap();
    assert!(pool.is_stopped());
}

#[tokio::test]
async fn test_single_request_mode_tears_down_each_backend() {
    let settings = PoolSettings {
        single_request: true,
        backend_cap: 0,
        ..Default::default()
    };
    let (address, pool, _handle) = start_proxy(settings, in_process_launcher(Duration::from_millis(1))).await;

    let mut origins = HashSet::new();
    for _ in 0..3 {
        let response = http_get(&address, "/").await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
        origins.insert(body_of(&response).to_string());
    }
    assert_eq!(origins.len(), 3, "each request gets a fresh backend");

    let report = pool.usage_report();
    assert_eq!(report.backends.len(), 3);
    assert!(report.backends.values().all(|count| *count == 1));

    assert!(
        wait_until(Duration::from_secs(5), || pool.live_backends().is_empty()).await,
        "single-request backends are deregistered"
    );

    // The backends themselves are gone too
    for origin in &origins {
        let backend = origin.split(' ').next().unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            while TcpStream::connect(backend).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(closed.is_ok(), "backend {} still accepting", backend);
    }

    pool.stop().await;
}

#[tokio::test]
async fn test_cap_is_never_exceeded() {
    let launcher = Arc::new(RecordingLauncher::new(Duration::from_millis(20), false));
    let settings = PoolSettings {
        backend_cap: 3,
        ..Default::default()
    };
    let (address, pool, _handle) = start_proxy(settings, launcher.clone()).await;

    let mut handles = Vec::new();
    for _ in 0..30 {
        let address = address.clone();
        handles.push(tokio::spawn(async move { http_get(&address, "/").await.unwrap() }));
    }
    for handle in handles {
        let response = handle.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
    }

    assert!(pool.live_backends().len() <= 3);
    assert!(pool.usage_report().backends.len() <= 3);
    assert_eq!(launcher.served(), 30);

    // One request in flight per backend at any time
    assert_eq!(launcher.max_in_flight(), 1);
    assert_eq!(pool.mismatches(), 0);

    pool.stop().await;
}

#[tokio::test]
async fn test_mismatched_correlation_is_counted_not_fatal() {
    let launcher = Arc::new(RecordingLauncher::new(Duration::from_millis(1), true));
    let settings = PoolSettings {
        backend_cap: 1,
        ..Default::default()
    };
    let (address, pool, _handle) = start_proxy(settings, launcher).await;

    for _ in 0..3 {
        let response = http_get(&address, "/").await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(body_of(&response), "recorded");
    }
    assert_eq!(pool.mismatches(), 3);

    let report = pool.stop().await;
    assert_eq!(report.mismatches, 3);
}

#[tokio::test]
async fn test_never_healthy_backend_returns_500() {
    let launcher = Arc::new(NeverHealthyLauncher::default());
    let settings = PoolSettings {
        backend_cap: 1,
        ..Default::default()
    };
    let (address, pool, _handle) = start_proxy(settings, launcher.clone()).await;

    let started = Instant::now();
    let response = http_get(&address, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 500"), "got: {}", response);
    assert!(response.contains("BACKEND_UNHEALTHY"));
    assert!(!response.contains("127.0.0.1:"), "error body must not leak addresses");
    assert!(started.elapsed() < Duration::from_secs(5));

    // Backend stays registered and is probed again next time
    assert_eq!(pool.live_backends().len(), 1);
    http_get(&address, "/").await.unwrap();
    assert_eq!(launcher.probes.load(Ordering::SeqCst), 2);

    pool.stop().await;
}

#[tokio::test]
async fn test_slow_backend_returns_504() {
    let settings = PoolSettings {
        backend_cap: 1,
        forward_timeout: Duration::from_millis(500),
        ..Default::default()
    };
    let (address, pool, _handle) = start_proxy(settings, in_process_launcher(Duration::from_millis(1500))).await;

    let response = http_get(&address, "/").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 504"), "got: {}", response);
    assert!(response.contains("REQUEST_TIMEOUT"));

    // Let the late reply arrive; the proxy keeps serving
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let health = http_get(&address, "/health").await.unwrap();
    assert!(health.starts_with("HTTP/1.1 200 OK"));
    assert_eq!(pool.live_backends().len(), 1);
    assert_eq!(pool.mismatches(), 0);

    pool.stop().await;
}

#[tokio::test]
async fn test_stop_twice_reports_consistently() {
    let settings = PoolSettings {
        backend_cap: 2,
        ..Default::default()
    };
    let (address, pool, handle) = start_proxy(settings, in_process_launcher(Duration::from_millis(1))).await;
    http_get(&address, "/").await.unwrap();
    http_get(&address, "/").await.unwrap();

    let response = http_get(&address, "/stop").await.unwrap();
    let first: spawnpool::pool::UsageReport = serde_json::from_str(body_of(&response)).unwrap();
    let second = pool.stop().await;
    assert_eq!(first, second);
    assert_eq!(second.total_requests, 2);

    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("proxy exits after /stop")
        .unwrap()
        .unwrap();

    let err = pool.forward(request("/")).await.unwrap_err();
    assert!(matches!(err, ForwardError::NoBackend(_)));
}

#[tokio::test]
async fn test_proxy_health_and_unknown_paths() {
    let (address, pool, _handle) = start_proxy(
        PoolSettings::default(),
        in_process_launcher(Duration::from_millis(1)),
    )
    .await;

    let health = http_get(&address, "/health").await.unwrap();
    assert!(health.starts_with("HTTP/1.1 200 OK"));
    assert!(pool.live_backends().is_empty());

    // Path and query are passed through to the backend
    let response = http_get(&address, "/some/path?x=1").await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(body_of(&response).ends_with("origin server response"));

    pool.stop().await;
}

// ============================================================================
// Real binaries
// ============================================================================

#[tokio::test]
async fn test_process_launcher_runs_backend_binary() {
    let client = BackendClient::new();
    let mut command = BackendCommand::new(env!("CARGO_BIN_EXE_spawnpool-backend"));
    command.latency_ms = Some(1);
    let launcher = Arc::new(ProcessLauncher::new(command, client.clone(), quick_probe()));

    let settings = PoolSettings {
        backend_cap: 1,
        ..Default::default()
    };
    let pool = Pool::new(settings, launcher.clone(), client);

    for _ in 0..3 {
        let response = pool.forward(request("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).ends_with("origin server response"));
    }
    assert_eq!(launcher.running(), 1);

    let report = pool.stop().await;
    assert_eq!(report.total_requests, 3);
    assert_eq!(report.mismatches, 0);

    assert!(
        wait_until(Duration::from_secs(10), || launcher.running() == 0).await,
        "backend process exits after /stop"
    );
}

#[tokio::test]
async fn test_proxy_binary_end_to_end() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let address = format!("127.0.0.1:{}", port);

    let mut proxy = tokio::process::Command::new(env!("CARGO_BIN_EXE_spawnpool"))
        .args(["-a", "127.0.0.1", "-p", &port.to_string(), "-b", "2"])
        .args(["--backend-bin", env!("CARGO_BIN_EXE_spawnpool-backend")])
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let client = BackendClient::new();
    assert!(
        spawnpool::control::probe_health(&client, &address, &ProbeConfig::proxy()).await,
        "proxy binary becomes healthy"
    );

    let settings = LoadSettings {
        address: address.clone(),
        requests: 10,
        workers: 2,
        timeout: Duration::from_secs(30),
    };
    let report = run_load(&client, &settings).await;
    assert_eq!(report.success, 10);
    assert_eq!(report.errors, 0);

    let usage = stop_proxy(&client, &address, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(usage.total_requests, 10);
    assert_eq!(usage.mismatches, 0);
    assert!(usage.backends.len() <= 2);

    let status = tokio::time::timeout(Duration::from_secs(15), proxy.wait())
        .await
        .expect("proxy binary exits after /stop")
        .unwrap();
    assert!(status.success());
}
