//! Backend pool manager
//!
//! The pool owns the map of live backends, decides whether a request gets a
//! freshly provisioned backend or an existing one, stamps every forwarded
//! request with a correlation ID and checks that the backend echoed it back.
//!
//! Each backend is driven by one worker task. The pool talks to a worker over
//! a pair of capacity-1 channels (requests in, replies out). The pool side of
//! the pair lives in a [`BackendChannel`] behind an async mutex that is held
//! for a whole exchange, so at most one request is in flight per backend and
//! a reply always reaches the caller that sent the matching request.

use crate::client::{BackendClient, ProxyBody};
use crate::control::REQUEST_ID_HEADER;
use crate::error::{ForwardError, PoolError};
use crate::lifecycle::BackendLauncher;
use crate::selection::{SelectionPolicy, UniformRandom};
use crate::server::shutdown_requested;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, Uri, Version};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Reply posted by a worker for one request
type Reply = Result<Response<Incoming>, ForwardError>;

/// Pool admission and forwarding settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Each backend serves exactly one request, then drains and exits
    pub single_request: bool,
    /// Maximum number of live backends (0 = unbounded)
    pub backend_cap: usize,
    /// How long a caller waits for its backend response
    pub forward_timeout: Duration,
    /// Host part of provisioned backend addresses
    pub backend_host: String,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            single_request: false,
            backend_cap: 0,
            forward_timeout: Duration::from_secs(10),
            backend_host: "127.0.0.1".to_string(),
        }
    }
}

/// Pool side of a backend's channel pair
struct ChannelPair {
    requests: mpsc::Sender<Request<ProxyBody>>,
    replies: mpsc::Receiver<Reply>,
    /// Replies still owed to callers that gave up waiting
    abandoned: usize,
}

/// One backend's in-flight slot
pub struct BackendChannel {
    address: String,
    /// Both sides are dropped together, so they are always open or closed as one
    pair: tokio::sync::Mutex<Option<ChannelPair>>,
    closed: AtomicBool,
}

impl fmt::Debug for BackendChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendChannel")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BackendChannel {
    fn new(
        address: String,
        requests: mpsc::Sender<Request<ProxyBody>>,
        replies: mpsc::Receiver<Reply>,
    ) -> Self {
        Self {
            address,
            pair: tokio::sync::Mutex::new(Some(ChannelPair {
                requests,
                replies,
                abandoned: 0,
            })),
            closed: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the channel has been closed; readable without awaiting
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close both sides, waiting for an exchange in progress to finish first
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pair.lock().await.take();
    }

    /// Replies owed to callers that timed out
    pub async fn abandoned(&self) -> usize {
        self.pair
            .lock()
            .await
            .as_ref()
            .map(|pair| pair.abandoned)
            .unwrap_or(0)
    }

    fn closed_error(&self) -> ForwardError {
        ForwardError::BackendClosed {
            address: self.address.clone(),
        }
    }

    /// Send one request and wait for its reply
    ///
    /// The deadline starts once this caller holds the channel. With
    /// `close_after` the channel is closed when the exchange ends, whatever
    /// its outcome.
    pub async fn exchange(
        &self,
        req: Request<ProxyBody>,
        timeout: Duration,
        close_after: bool,
    ) -> Result<Response<Incoming>, ForwardError> {
        let mut slot = self.pair.lock().await;
        let result = match slot.as_mut() {
            Some(pair) => self.exchange_on(pair, req, timeout).await,
            None => Err(self.closed_error()),
        };

        if close_after {
            self.closed.store(true, Ordering::SeqCst);
            slot.take();
        }
        result
    }

    async fn exchange_on(
        &self,
        pair: &mut ChannelPair,
        req: Request<ProxyBody>,
        timeout: Duration,
    ) -> Result<Response<Incoming>, ForwardError> {
        let deadline = Instant::now() + timeout;

        // Late replies from timed-out exchanges come first; never hand them on
        while pair.abandoned > 0 {
            match timeout_at(deadline, pair.replies.recv()).await {
                Ok(Some(stale)) => {
                    pair.abandoned -= 1;
                    debug!(
                        address = %self.address,
                        ok = stale.is_ok(),
                        "Discarded late backend reply"
                    );
                }
                Ok(None) => return Err(self.closed_error()),
                Err(_) => return Err(ForwardError::Timeout(timeout)),
            }
        }

        match timeout_at(deadline, pair.requests.send(req)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(self.closed_error()),
            Err(_) => return Err(ForwardError::Timeout(timeout)),
        }

        match timeout_at(deadline, pair.replies.recv()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => Err(self.closed_error()),
            Err(_) => {
                pair.abandoned += 1;
                Err(ForwardError::Timeout(timeout))
            }
        }
    }
}

/// Snapshot of per-backend usage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    /// Requests routed to each backend address, including removed backends
    pub backends: BTreeMap<String, u64>,
    pub total_requests: u64,
    pub mismatches: u64,
}

impl fmt::Display for UsageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<24}{:>8}", "Server", "Count")?;
        for (address, count) in &self.backends {
            writeln!(f, "{:<24}{:>8}", address, count)?;
        }
        writeln!(f, "{:<24}{:>8}", "Total", self.total_requests)?;
        write!(f, "Mismatch - {}", self.mismatches)
    }
}

#[derive(Debug)]
struct PoolState {
    backends: HashMap<String, Arc<BackendChannel>>,
    usage: HashMap<String, u64>,
    next_request_id: u64,
    mismatches: u64,
    stopped: bool,
}

/// The backend pool
pub struct Pool {
    settings: PoolSettings,
    launcher: Arc<dyn BackendLauncher>,
    client: BackendClient,
    policy: Box<dyn SelectionPolicy>,
    state: Mutex<PoolState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Pool {
    pub fn new(
        settings: PoolSettings,
        launcher: Arc<dyn BackendLauncher>,
        client: BackendClient,
    ) -> Arc<Self> {
        Self::with_policy(settings, launcher, client, Box::new(UniformRandom))
    }

    pub fn with_policy(
        settings: PoolSettings,
        launcher: Arc<dyn BackendLauncher>,
        client: BackendClient,
        policy: Box<dyn SelectionPolicy>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            launcher,
            client,
            policy,
            state: Mutex::new(PoolState {
                backends: HashMap::new(),
                usage: HashMap::new(),
                next_request_id: 1,
                mismatches: 0,
                stopped: false,
            }),
            shutdown_tx,
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Addresses of the currently registered backends
    pub fn live_backends(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut addresses: Vec<String> = state.backends.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn mismatches(&self) -> u64 {
        self.state.lock().mismatches
    }

    pub fn usage_report(&self) -> UsageReport {
        let state = self.state.lock();
        let backends: BTreeMap<String, u64> = state
            .usage
            .iter()
            .map(|(address, count)| (address.clone(), *count))
            .collect();
        UsageReport {
            total_requests: backends.values().sum(),
            backends,
            mismatches: state.mismatches,
        }
    }

    /// Pick the backend for the next request, provisioning one while below the cap
    pub fn select_backend(self: &Arc<Self>) -> Result<Arc<BackendChannel>, PoolError> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(PoolError::Stopped);
        }

        // Closed channels are on their way out and do not count against the cap
        let cap = self.settings.backend_cap;
        let open = state
            .backends
            .values()
            .filter(|channel| !channel.is_closed())
            .count();
        let channel = if cap == 0 || open < cap {
            let address = self.allocate_address()?;
            self.provision_locked(&mut state, &address)
        } else {
            let candidates: Vec<&Arc<BackendChannel>> = state
                .backends
                .values()
                .filter(|channel| !channel.is_closed())
                .collect();
            let addresses: Vec<&str> = candidates.iter().map(|c| c.address()).collect();
            let idx = self
                .policy
                .choose(&addresses)
                .ok_or(PoolError::NoBackendAvailable)?;
            let channel = Arc::clone(candidates[idx]);
            debug!(
                address = channel.address(),
                policy = self.policy.name(),
                "Selected existing backend"
            );
            channel
        };

        *state.usage.entry(channel.address().to_string()).or_insert(0) += 1;
        Ok(channel)
    }

    /// Register a backend at `address` and start its worker
    ///
    /// Returns the existing channel when the address is already registered.
    pub fn provision(self: &Arc<Self>, address: &str) -> Result<Arc<BackendChannel>, PoolError> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(PoolError::Stopped);
        }
        Ok(self.provision_locked(&mut state, address))
    }

    fn provision_locked(self: &Arc<Self>, state: &mut PoolState, address: &str) -> Arc<BackendChannel> {
        if let Some(existing) = state.backends.get(address) {
            debug!(address, "Backend already registered");
            return Arc::clone(existing);
        }

        let (request_tx, request_rx) = mpsc::channel(1);
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let channel = Arc::new(BackendChannel::new(address.to_string(), request_tx, reply_rx));
        state
            .backends
            .insert(address.to_string(), Arc::clone(&channel));

        info!(address, live_backends = state.backends.len(), "Provisioned backend");

        let worker = Worker {
            pool: Arc::clone(self),
            channel: Arc::clone(&channel),
            requests: request_rx,
            replies: reply_tx,
        };
        tokio::spawn(worker.run());

        channel
    }

    /// Obtain a free local port by binding port 0 and releasing it
    fn allocate_address(&self) -> Result<String, PoolError> {
        let host = self.settings.backend_host.as_str();
        // Runs under the pool lock so that concurrent callers cannot both
        // see room under the cap; the bind is local and never blocks
        let listener =
            std::net::TcpListener::bind((host, 0)).map_err(PoolError::AddressAllocation)?;
        let port = listener
            .local_addr()
            .map_err(PoolError::AddressAllocation)?
            .port();
        Ok(format!("{}:{}", host, port))
    }

    fn next_request_id(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_request_id;
        state.next_request_id += 1;
        id
    }

    fn deregister(&self, channel: &Arc<BackendChannel>) {
        let mut state = self.state.lock();
        let owned = state
            .backends
            .get(channel.address())
            .is_some_and(|current| Arc::ptr_eq(current, channel));
        if owned {
            state.backends.remove(channel.address());
            info!(
                address = channel.address(),
                live_backends = state.backends.len(),
                "Backend removed from pool"
            );
        }
    }

    /// Route one request to a backend and return its response
    pub async fn forward(
        self: &Arc<Self>,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, ForwardError> {
        let channel = self.select_backend()?;
        let request_id = self.next_request_id();
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, HeaderValue::from(request_id));

        debug!(address = channel.address(), request_id, "Forwarding request");

        let result = channel
            .exchange(
                req,
                self.settings.forward_timeout,
                self.settings.single_request,
            )
            .await;

        // The channel is closed now; free its slot before the worker notices
        if self.settings.single_request {
            self.deregister(&channel);
        }

        match result {
            Ok(response) => {
                if response.status().is_success() {
                    self.verify_correlation(channel.address(), request_id, &response);
                }
                Ok(response)
            }
            Err(ForwardError::BackendClosed { .. }) if self.is_stopped() => {
                Err(ForwardError::ShuttingDown)
            }
            Err(e) => {
                warn!(address = channel.address(), request_id, error = %e, "Forward failed");
                Err(e)
            }
        }
    }

    fn verify_correlation(&self, address: &str, request_id: u64, response: &Response<Incoming>) {
        let expected = request_id.to_string();
        let echoed = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if echoed != expected {
            let mismatches = {
                let mut state = self.state.lock();
                state.mismatches += 1;
                state.mismatches
            };
            warn!(
                address,
                expected = %expected,
                got = %echoed,
                mismatches,
                "Request ID mismatch"
            );
        }
    }

    /// Stop every backend and return the final usage report
    ///
    /// The pool refuses work afterwards. Calling it again only reports.
    pub async fn stop(&self) -> UsageReport {
        let channels: Vec<Arc<BackendChannel>> = {
            let mut state = self.state.lock();
            if state.stopped {
                drop(state);
                debug!("Pool already stopped");
                return self.usage_report();
            }
            state.stopped = true;
            state.backends.values().cloned().collect()
        };

        info!(backends = channels.len(), "Shutting down backend pool");
        // Stored even when no worker has subscribed yet
        self.shutdown_tx.send_replace(true);

        let stops = channels.iter().map(|channel| async move {
            if !self.launcher.stop(channel.address()).await {
                debug!(address = channel.address(), "Backend did not acknowledge /stop");
            }
            channel.close().await;
        });
        futures::future::join_all(stops).await;

        let report = self.usage_report();
        info!("Backend usage\n{}", report);
        report
    }
}

/// Drives one backend: start it, then serve requests until the channel closes
struct Worker {
    pool: Arc<Pool>,
    channel: Arc<BackendChannel>,
    requests: mpsc::Receiver<Request<ProxyBody>>,
    replies: mpsc::Sender<Reply>,
}

impl Worker {
    async fn run(mut self) {
        let address = self.channel.address().to_string();
        let mut shutdown_rx = self.pool.shutdown_tx.subscribe();

        match self
            .pool
            .launcher
            .start(&address, self.pool.settings.single_request)
            .await
        {
            Ok(()) => {
                if *shutdown_rx.borrow() {
                    // Stopped while starting; stop() may have missed this backend
                    self.pool.launcher.stop(&address).await;
                } else {
                    self.serve(&address, &mut shutdown_rx).await;
                }
            }
            Err(e) => {
                error!(address = %address, error = %e, "Failed to start backend");
            }
        }

        self.channel.closed.store(true, Ordering::SeqCst);
        self.pool.deregister(&self.channel);
        debug!(address = %address, "Backend worker exited");
    }

    async fn serve(&mut self, address: &str, shutdown_rx: &mut watch::Receiver<bool>) {
        loop {
            let req = tokio::select! {
                req = self.requests.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
                _ = shutdown_requested(shutdown_rx) => break,
            };

            let reply = self.handle(address, req, shutdown_rx).await;
            if self.replies.send(reply).await.is_err() {
                debug!(address, "Reply dropped, channel closed");
            }
        }
    }

    async fn handle(
        &self,
        address: &str,
        mut req: Request<ProxyBody>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Reply {
        let healthy = tokio::select! {
            healthy = self.pool.launcher.check_health(address) => healthy,
            _ = shutdown_requested(shutdown_rx) => return Err(ForwardError::ShuttingDown),
        };
        if !healthy {
            warn!(address, "Backend failed health check");
            return Err(ForwardError::Unhealthy {
                address: address.to_string(),
            });
        }

        rewrite_for_backend(&mut req, address).map_err(|source| ForwardError::InvalidRequest {
            address: address.to_string(),
            source,
        })?;

        debug!(address, uri = %req.uri(), "Sending request to backend");
        tokio::select! {
            result = self.pool.client.forward(req) => {
                result.map_err(|source| ForwardError::Transport {
                    address: address.to_string(),
                    source,
                })
            }
            _ = shutdown_requested(shutdown_rx) => Err(ForwardError::ShuttingDown),
        }
    }
}

/// Point a request at `address`, keeping its path and query
fn rewrite_for_backend(req: &mut Request<ProxyBody>, address: &str) -> Result<(), hyper::http::Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = Uri::builder()
        .scheme("http")
        .authority(address)
        .path_and_query(path_and_query)
        .build()?;

    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;
    req.headers_mut().insert(HOST, HeaderValue::from_str(address)?);
    req.headers_mut().remove(CONNECTION);
    Ok(())
}
