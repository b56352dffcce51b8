use crate::control::ProbeConfig;
use crate::pool::PoolSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the backend binary shipped with this package
pub const BACKEND_BIN_NAME: &str = "spawnpool-backend";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front door listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Pool admission and forwarding settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Backend health and stop probe settings
    #[serde(default)]
    pub health: HealthConfig,

    /// How backends are launched
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Time allowed for in-flight connections to finish after shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Each backend serves exactly one request, then drains and exits
    #[serde(default)]
    pub single_request: bool,

    /// Maximum number of live backends (0 = unbounded)
    #[serde(default)]
    pub backend_cap: usize,

    /// How long a caller waits for a backend response
    #[serde(default = "default_forward_timeout")]
    pub forward_timeout_secs: u64,

    /// Host part of provisioned backend addresses
    #[serde(default = "default_backend_host")]
    pub backend_host: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            single_request: false,
            backend_cap: 0,
            forward_timeout_secs: default_forward_timeout(),
            backend_host: default_backend_host(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Per-call timeout for /health and /stop requests in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,

    /// Pause between failed /health attempts in milliseconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// Number of /health attempts before a backend is declared unhealthy
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl HealthConfig {
    pub fn probe(&self) -> ProbeConfig {
        ProbeConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            max_retries: self.max_retries,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout(),
            retry_interval_ms: default_retry_interval(),
            max_retries: default_max_retries(),
        }
    }
}

/// Where backends run
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMode {
    /// Spawn the backend command as a child process (default)
    #[default]
    #[serde(alias = "local")]
    Process,
    /// Run the bundled backend server as a task inside the proxy
    #[serde(alias = "inprocess")]
    InProcess,
}

/// Backend launch configuration
///
/// # Security Warning
///
/// `command` and `args` are executed directly. Configuration files must be
/// protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BackendConfig {
    /// Launch mode: "process" (default) or "in-process"
    #[serde(default)]
    pub mode: LaunchMode,

    /// Backend executable; defaults to the bundled backend next to the proxy
    pub command: Option<String>,

    /// Extra arguments placed before the address flags
    #[serde(default)]
    pub args: Vec<String>,

    /// Simulated processing time for the bundled backend in milliseconds
    pub latency_ms: Option<u64>,
}

impl BackendConfig {
    /// Resolve the backend command, falling back to the bundled binary
    pub fn command_path(&self) -> PathBuf {
        self.command
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| sibling_binary(BACKEND_BIN_NAME))
    }
}

/// Path of another binary from this package, installed next to the running one
pub fn sibling_binary(name: &str) -> PathBuf {
    let file_name = format!("{}{}", name, std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
        .unwrap_or_else(|| PathBuf::from(file_name))
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> u64 {
    5
}

fn default_forward_timeout() -> u64 {
    10
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_probe_timeout() -> u64 {
    3000
}

fn default_retry_interval() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.pool.forward_timeout_secs == 0 {
            errors.push("pool.forward_timeout_secs must be greater than 0".to_string());
        }
        if self.pool.backend_host.trim().is_empty() {
            errors.push("pool.backend_host must not be empty".to_string());
        }
        if self.health.max_retries == 0 {
            errors.push("health.max_retries must be greater than 0".to_string());
        }
        if self.health.timeout_ms == 0 {
            errors.push("health.timeout_ms must be greater than 0".to_string());
        }
        if let Some(command) = &self.backend.command {
            if command.trim().is_empty() {
                errors.push("backend.command must not be empty".to_string());
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Settings handed to the pool manager
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            single_request: self.pool.single_request,
            backend_cap: self.pool.backend_cap,
            forward_timeout: Duration::from_secs(self.pool.forward_timeout_secs),
            backend_host: self.pool.backend_host.clone(),
        }
    }
}
