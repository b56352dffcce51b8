//! Backend application started by the proxy for each pool member

use clap::Parser;
use spawnpool::backend::{BackendServer, BackendSettings, DEFAULT_LATENCY_MS};
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "spawnpool-backend")]
#[command(version, about = "Origin server managed by spawnpool", long_about = None)]
struct Cli {
    /// Address (host:port) to serve on
    #[arg(short = 'a', long, default_value = "127.0.0.1:8081")]
    address: String,

    /// Serve a single request, then shut down
    #[arg(short, long)]
    single_request: bool,

    /// Simulated processing time per request
    #[arg(long, default_value_t = DEFAULT_LATENCY_MS)]
    latency_ms: u64,
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
    let settings = BackendSettings {
        single_request: cli.single_request,
        latency: Duration::from_millis(cli.latency_ms),
    };

    info!(address = %cli.address, "Starting origin server");
    BackendServer::new(&cli.address, settings)
        .run()
        .await
        .map_err(|e| {
            error!(address = %cli.address, error = %e, "Origin server failed");
            e
        })
}
