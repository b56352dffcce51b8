//! Backend lifecycle: starting, probing and stopping backends
//!
//! The pool only talks to backends through [`BackendLauncher`]. Two launchers
//! ship with the crate:
//!
//! - [`ProcessLauncher`] spawns an external backend command per address
//! - [`InProcessLauncher`] runs the bundled backend server as a tokio task

use crate::backend::{BackendServer, BackendSettings};
use crate::client::BackendClient;
use crate::control::{probe_health, request_stop, ProbeConfig};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time a backend process gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Starts, probes and stops the backend living at an address
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    /// Launch a backend listening on `address`
    ///
    /// Returns once the backend has been launched, not once it is healthy.
    async fn start(&self, address: &str, single_request: bool) -> anyhow::Result<()>;

    /// Probe `/health` with bounded retries
    async fn check_health(&self, address: &str) -> bool;

    /// Ask the backend to shut down; true if it acknowledged `/stop`
    async fn stop(&self, address: &str) -> bool;
}

/// Command line used to run one backend process
#[derive(Debug, Clone)]
pub struct BackendCommand {
    pub program: PathBuf,
    /// Arguments placed before the address flags
    pub args: Vec<String>,
    /// Forwarded as `--latency-ms` when set
    pub latency_ms: Option<u64>,
}

impl BackendCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            latency_ms: None,
        }
    }

    /// Full argument list for a backend at `address`
    pub fn args_for(&self, address: &str, single_request: bool) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("-a".to_string());
        args.push(address.to_string());
        if single_request {
            args.push("-s".to_string());
        }
        if let Some(latency) = self.latency_ms {
            args.push("--latency-ms".to_string());
            args.push(latency.to_string());
        }
        args
    }
}

struct ChildEntry {
    generation: u64,
    pid: Option<u32>,
    terminate: oneshot::Sender<()>,
}

/// Runs each backend as a child process
pub struct ProcessLauncher {
    command: BackendCommand,
    client: BackendClient,
    probe: ProbeConfig,
    children: Arc<DashMap<String, ChildEntry>>,
    generation: AtomicU64,
}

impl ProcessLauncher {
    pub fn new(command: BackendCommand, client: BackendClient, probe: ProbeConfig) -> Self {
        Self {
            command,
            client,
            probe,
            children: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of child processes not yet reaped
    pub fn running(&self) -> usize {
        self.children.len()
    }

    /// Pid of the child serving `address`, if it is still running
    pub fn pid(&self, address: &str) -> Option<u32> {
        self.children.get(address).and_then(|entry| entry.pid)
    }
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn start(&self, address: &str, single_request: bool) -> anyhow::Result<()> {
        let args = self.command.args_for(address, single_request);
        info!(
            address,
            command = %self.command.program.display(),
            single_request,
            "Starting backend process"
        );

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!(
                "Failed to spawn backend {} for {}: {}",
                self.command.program.display(),
                address,
                e
            )
        })?;
        let pid = child.id();
        info!(address, pid, "Backend process spawned");

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (terminate_tx, terminate_rx) = oneshot::channel();
        self.children.insert(
            address.to_string(),
            ChildEntry {
                generation,
                pid,
                terminate: terminate_tx,
            },
        );

        let children = Arc::clone(&self.children);
        let address = address.to_string();
        tokio::spawn(async move {
            reap(&address, child, terminate_rx).await;
            children.remove_if(&address, |_, entry| entry.generation == generation);
        });

        Ok(())
    }

    async fn check_health(&self, address: &str) -> bool {
        probe_health(&self.client, address, &self.probe).await
    }

    async fn stop(&self, address: &str) -> bool {
        if request_stop(&self.client, address, self.probe.timeout).await {
            return true;
        }

        // No answer to /stop: terminate the child if it is still around
        if let Some((_, entry)) = self.children.remove(address) {
            warn!(address, pid = entry.pid, "Backend ignored /stop, terminating");
            let _ = entry.terminate.send(());
        }
        false
    }
}

/// Wait for a child to exit, terminating it on request
async fn reap(address: &str, mut child: Child, terminate: oneshot::Receiver<()>) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => info!(address, ?status, "Backend process exited"),
                Err(e) => warn!(address, error = %e, "Error waiting for backend process"),
            }
        }
        Ok(()) = terminate => {
            terminate_child(address, &mut child).await;
        }
    }
}

async fn terminate_child(address: &str, child: &mut Child) {
    if let Some(pid) = child.id() {
        info!(address, pid, "Sending SIGTERM to backend");

        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE_PERIOD, child.wait()).await {
        Ok(Ok(status)) => {
            info!(address, ?status, "Backend process exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(address, error = %e, "Error waiting for backend to exit");
        }
        Err(_) => {
            warn!(
                address,
                grace_period_secs = TERMINATE_GRACE_PERIOD.as_secs(),
                "Grace period exceeded, killing backend"
            );
            let _ = child.kill().await;
        }
    }
}

/// Runs each backend as a task inside the current runtime
pub struct InProcessLauncher {
    settings: BackendSettings,
    client: BackendClient,
    probe: ProbeConfig,
    tasks: DashMap<String, JoinHandle<()>>,
}

impl InProcessLauncher {
    pub fn new(latency: Duration, client: BackendClient, probe: ProbeConfig) -> Self {
        Self {
            settings: BackendSettings {
                single_request: false,
                latency,
            },
            client,
            probe,
            tasks: DashMap::new(),
        }
    }

    /// Number of backend tasks still serving
    pub fn running(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count()
    }
}

#[async_trait]
impl BackendLauncher for InProcessLauncher {
    async fn start(&self, address: &str, single_request: bool) -> anyhow::Result<()> {
        self.tasks.retain(|_, handle| !handle.is_finished());

        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind backend {}: {}", address, e))?;

        let settings = BackendSettings {
            single_request,
            ..self.settings
        };
        let server = BackendServer::new(address, settings);
        let owned = address.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                error!(address = %owned, error = %e, "In-process backend failed");
            }
        });

        debug!(address, single_request, "In-process backend started");
        if let Some(previous) = self.tasks.insert(address.to_string(), handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn check_health(&self, address: &str) -> bool {
        probe_health(&self.client, address, &self.probe).await
    }

    async fn stop(&self, address: &str) -> bool {
        let acknowledged = request_stop(&self.client, address, self.probe.timeout).await;
        if let Some((_, handle)) = self.tasks.remove(address) {
            if !acknowledged && !handle.is_finished() {
                warn!(address, "Backend ignored /stop, aborting task");
                handle.abort();
            }
        }
        acknowledged
    }
}
