//! Load generator: launches a proxy, sends it traffic and tallies the results

use clap::Parser;
use spawnpool::client::BackendClient;
use spawnpool::config::sibling_binary;
use spawnpool::control::{probe_health, ProbeConfig};
use spawnpool::loadgen::{run_load, stop_proxy, LoadSettings};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

/// Name of the proxy binary shipped with this package
const PROXY_BIN_NAME: &str = "spawnpool";

/// Per-request timeout; longer than the proxy's forward timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Time the proxy gets to exit after answering /stop
const PROXY_EXIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "spawnpool-loadgen")]
#[command(version, about = "Send load through a spawnpool proxy", long_about = None)]
struct Cli {
    /// The number of requests to send
    #[arg(short, long, default_value_t = 100)]
    requests: usize,

    /// Address of the reverse proxy
    #[arg(short = 'a', long, default_value = "127.0.0.1")]
    address: String,

    /// Port of the reverse proxy
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Single request instances of backend
    #[arg(short, long)]
    single_request: bool,

    /// Number of backend instances allowed at once; 0 is no limit
    #[arg(short = 'b', long, default_value_t = 0)]
    backend_cap: usize,

    /// Number of concurrent workers
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// Proxy executable (defaults to the bundled spawnpool)
    #[arg(long)]
    proxy_bin: Option<PathBuf>,

    /// Use an already running proxy instead of launching one
    #[arg(long)]
    no_spawn: bool,
}

impl Cli {
    fn proxy_args(&self) -> Vec<String> {
        let mut args = vec![
            "-a".to_string(),
            self.address.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "-b".to_string(),
            self.backend_cap.to_string(),
        ];
        if self.single_request {
            args.push("-s".to_string());
        }
        args
    }
}

fn spawn_proxy(cli: &Cli) -> anyhow::Result<Child> {
    let program = cli
        .proxy_bin
        .clone()
        .unwrap_or_else(|| sibling_binary(PROXY_BIN_NAME));
    let args = cli.proxy_args();
    info!(command = %program.display(), ?args, "Starting proxy");

    let mut cmd = Command::new(&program);
    cmd.args(&args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());
    cmd.kill_on_drop(true);

    cmd.spawn()
        .map_err(|e| anyhow::anyhow!("Failed to start proxy {}: {}", program.display(), e))
}

async fn wait_for_exit(child: &mut Child) {
    match tokio::time::timeout(PROXY_EXIT_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => info!(?status, "Proxy exited"),
        Ok(Err(e)) => warn!(error = %e, "Error waiting for proxy to exit"),
        Err(_) => {
            warn!("Proxy did not exit in time, killing it");
            let _ = child.kill().await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("spawnpool=info".parse().expect("valid log directive")),
        )
        .init();

    let cli = Cli::parse();
    let address = format!("{}:{}", cli.address, cli.port);
    let client = BackendClient::new();

    let mut proxy = if cli.no_spawn {
        None
    } else {
        Some(spawn_proxy(&cli)?)
    };

    if !probe_health(&client, &address, &ProbeConfig::proxy()).await {
        error!(address = %address, "Proxy server failed health check");
        if let Some(child) = proxy.as_mut() {
            let _ = child.kill().await;
        }
        anyhow::bail!("Proxy server at {} failed to become healthy", address);
    }

    let settings = LoadSettings {
        address: address.clone(),
        requests: cli.requests,
        workers: cli.workers,
        timeout: REQUEST_TIMEOUT,
    };
    info!(
        address = %address,
        requests = settings.requests,
        workers = settings.workers,
        "Sending load"
    );
    let report = run_load(&client, &settings).await;

    let usage = match stop_proxy(&client, &address, ProbeConfig::proxy().timeout).await {
        Ok(usage) => Some(usage),
        Err(e) => {
            warn!(address = %address, error = %e, "Failed to stop proxy");
            None
        }
    };
    if let Some(child) = proxy.as_mut() {
        wait_for_exit(child).await;
    }

    println!("{}", report);
    if let Some(usage) = usage {
        println!("{}", usage);
    }
    Ok(())
}
