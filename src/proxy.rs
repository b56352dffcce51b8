//! Front door of the proxy
//!
//! Accepts client connections, answers the control endpoints itself and
//! hands every other request to the [`Pool`].

use crate::client::ProxyBody;
use crate::control::{HEALTH_PATH, STOP_PATH};
use crate::error::{forward_error_response, json_error_response, ProxyErrorCode};
use crate::pool::Pool;
use crate::server::{shutdown_requested, ConnectionGuard, ConnectionTracker};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Default time in-flight connections get to finish after shutdown
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The proxy's HTTP server
pub struct ProxyServer {
    bind_addr: String,
    pool: Arc<Pool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_timeout: Duration,
}

impl ProxyServer {
    pub fn new(
        bind_addr: impl Into<String>,
        pool: Arc<Pool>,
        shutdown_tx: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            pool,
            shutdown_tx,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", self.bind_addr, e))?;
        self.serve(listener).await
    }

    /// Serve until the shutdown flag is raised, then stop the pool and drain
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let settings = self.pool.settings();
        info!(
            addr = %local_addr,
            single_request = settings.single_request,
            backend_cap = settings.backend_cap,
            "Proxy server listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let tracker = ConnectionTracker::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let guard = tracker.track();
                            let pool = Arc::clone(&self.pool);
                            let shutdown_tx = Arc::clone(&self.shutdown_tx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, pool, shutdown_tx, guard).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("Proxy server shutting down");
                    break;
                }
            }
        }

        drop(listener);
        // No-op when /stop already stopped it
        self.pool.stop().await;
        tracker.drain(self.shutdown_timeout).await;
        info!("Proxy server stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    pool: Arc<Pool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    _guard: ConnectionGuard,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let mut shutdown_rx = shutdown_tx.subscribe();

    let service = service_fn(move |req: Request<Incoming>| {
        let pool = Arc::clone(&pool);
        let shutdown_tx = Arc::clone(&shutdown_tx);
        async move { handle_request(req, pool, shutdown_tx, addr).await }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_requested(&mut shutdown_rx) => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))
}

fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

async fn handle_request(
    req: Request<Incoming>,
    pool: Arc<Pool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    match req.uri().path() {
        HEALTH_PATH => Ok(empty_response(StatusCode::OK)),
        STOP_PATH => {
            info!(client = %client_addr, "Stop requested");
            let report = pool.stop().await;
            let response = match serde_json::to_string(&report) {
                Ok(body) => Response::builder()
                    .status(StatusCode::OK)
                    .header(hyper::header::CONTENT_TYPE, "application/json")
                    .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
                    .expect("valid response with static headers"),
                Err(e) => {
                    error!(error = %e, "Failed to serialize usage report");
                    json_error_response(ProxyErrorCode::InternalError, "Failed to build report")
                }
            };
            let _ = shutdown_tx.send(true);
            Ok(response)
        }
        _ => {
            debug!(
                client = %client_addr,
                method = %req.method(),
                uri = %req.uri(),
                "Incoming request"
            );

            let req = req.map(|body| body.boxed());
            match pool.forward(req).await {
                Ok(response) => Ok(response.map(|body| body.boxed())),
                Err(e) => {
                    debug!(
                        client = %client_addr,
                        code = e.code().as_header_value(),
                        "Answering with synthetic error"
                    );
                    Ok(forward_error_response(&e))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::BackendClient;
    use crate::control::ProbeConfig;
    use crate::lifecycle::InProcessLauncher;
    use crate::pool::PoolSettings;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_proxy(
        settings: PoolSettings,
    ) -> (String, Arc<Pool>, tokio::task::JoinHandle<anyhow::Result<()>>) {
        let client = BackendClient::new();
        let probe = ProbeConfig {
            timeout: Duration::from_millis(500),
            retry_interval: Duration::from_millis(20),
            max_retries: 50,
        };
        let launcher = Arc::new(InProcessLauncher::new(
            Duration::from_millis(1),
            client.clone(),
            probe,
        ));
        let pool = Pool::new(settings, launcher, client);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (shutdown_tx, _) = watch::channel(false);
        let server = ProxyServer::new(address.clone(), Arc::clone(&pool), Arc::new(shutdown_tx))
            .with_shutdown_timeout(Duration::from_secs(2));
        (address, pool, tokio::spawn(server.serve(listener)))
    }

    async fn raw_get(address: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(address).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, address
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_does_not_touch_pool() {
        let (address, pool, _handle) = start_proxy(PoolSettings::default()).await;

        let response = raw_get(&address, "/health").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(pool.live_backends().is_empty());
        assert_eq!(pool.usage_report().total_requests, 0);
    }

    #[tokio::test]
    async fn test_forward_through_front_door() {
        let settings = PoolSettings {
            backend_cap: 1,
            ..Default::default()
        };
        let (address, pool, _handle) = start_proxy(settings).await;

        let response = raw_get(&address, "/hello").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("origin server response"));
        assert!(response.to_lowercase().contains("x-request-id: 1"));
        assert_eq!(pool.live_backends().len(), 1);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_reports_and_shuts_down() {
        let settings = PoolSettings {
            backend_cap: 1,
            ..Default::default()
        };
        let (address, pool, handle) = start_proxy(settings).await;
        raw_get(&address, "/").await;

        let response = raw_get(&address, "/stop").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"total_requests\":1"));
        assert!(pool.is_stopped());

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("proxy exits after /stop")
            .unwrap()
            .unwrap();
    }
}
