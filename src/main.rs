use clap::Parser;
use spawnpool::backend::DEFAULT_LATENCY_MS;
use spawnpool::client::BackendClient;
use spawnpool::config::{Config, LaunchMode};
use spawnpool::lifecycle::{BackendCommand, BackendLauncher, InProcessLauncher, ProcessLauncher};
use spawnpool::pool::Pool;
use spawnpool::proxy::ProxyServer;
use spawnpool::{PKG_NAME, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "spawnpool")]
#[command(version, about = "Reverse proxy that provisions its own pool of backends", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to start the proxy server on
    #[arg(short = 'a', long)]
    address: Option<String>,

    /// Port to start the proxy server on
    #[arg(short, long)]
    port: Option<u16>,

    /// Retire every backend after a single request
    #[arg(short, long)]
    single_request: bool,

    /// Number of backends allowed at once; 0 is no limit
    #[arg(short = 'b', long)]
    backend_cap: Option<usize>,

    /// Backend executable (defaults to the bundled spawnpool-backend)
    #[arg(long)]
    backend_bin: Option<PathBuf>,

    /// Run backends as tasks inside the proxy instead of child processes
    #[arg(long)]
    in_process: bool,

    /// Seconds a request waits for its backend response
    #[arg(long)]
    forward_timeout_secs: Option<u64>,
}

impl Cli {
    /// Command-line flags win over the configuration file
    fn apply(&self, config: &mut Config) {
        if let Some(address) = &self.address {
            config.server.bind = address.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if self.single_request {
            config.pool.single_request = true;
        }
        if let Some(cap) = self.backend_cap {
            config.pool.backend_cap = cap;
        }
        if let Some(bin) = &self.backend_bin {
            config.backend.command = Some(bin.display().to_string());
        }
        if self.in_process {
            config.backend.mode = LaunchMode::InProcess;
        }
        if let Some(secs) = self.forward_timeout_secs {
            config.pool.forward_timeout_secs = secs;
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

    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::load(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => Config::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    print_startup_banner(&config);

    let client = BackendClient::new();
    let launcher = build_launcher(&config, client.clone());
    let pool = Pool::new(config.pool_settings(), launcher, client);

    let (shutdown_tx, _) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let server = ProxyServer::new(config.server.listen_addr(), pool, Arc::clone(&shutdown_tx))
        .with_shutdown_timeout(config.server.shutdown_timeout());
    let mut server_handle = tokio::spawn(server.run());

    let result = tokio::select! {
        result = &mut server_handle => result,
        signal = wait_for_signal() => {
            signal?;
            let _ = shutdown_tx.send(true);
            server_handle.await
        }
    };
    result??;

    info!("Server stopped");
    Ok(())
}

fn build_launcher(config: &Config, client: BackendClient) -> Arc<dyn BackendLauncher> {
    let probe = config.health.probe();
    match config.backend.mode {
        LaunchMode::Process => {
            let command = BackendCommand {
                program: config.backend.command_path(),
                args: config.backend.args.clone(),
                latency_ms: config.backend.latency_ms,
            };
            info!(command = %command.program.display(), "Backends run as child processes");
            Arc::new(ProcessLauncher::new(command, client, probe))
        }
        LaunchMode::InProcess => {
            let latency =
                Duration::from_millis(config.backend.latency_ms.unwrap_or(DEFAULT_LATENCY_MS));
            info!("Backends run inside the proxy process");
            Arc::new(InProcessLauncher::new(latency, client, probe))
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        listen = %config.server.listen_addr(),
        shutdown_timeout_secs = config.server.shutdown_timeout_secs,
        "Server configuration"
    );
    info!(
        single_request = config.pool.single_request,
        backend_cap = config.pool.backend_cap,
        forward_timeout_secs = config.pool.forward_timeout_secs,
        backend_host = %config.pool.backend_host,
        "Pool settings"
    );
    info!(
        timeout_ms = config.health.timeout_ms,
        retry_interval_ms = config.health.retry_interval_ms,
        max_retries = config.health.max_retries,
        "Health check settings"
    );
}
