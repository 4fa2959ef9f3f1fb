use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the pool master.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Pool sizing and recycling
    #[serde(default)]
    pub pool: PoolOptions,

    /// How worker processes are launched
    pub worker: WorkerConfig,

    /// File watching (effective only in debug mode)
    #[serde(default)]
    pub watch: WatchConfig,

    /// Debug mode: enables the file watcher and emergency-mode handling of
    /// bootstrap failures
    #[serde(default)]
    pub debug: bool,

    /// Forward worker output (stdout/stderr and `log` messages) to the
    /// operator log
    #[serde(default = "default_logging")]
    pub logging: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public bind address (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,

    /// Public port (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolOptions {
    /// Number of worker slots (default: 8)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Recycle a worker after this many served requests; 0 disables
    /// recycling (default: 0)
    #[serde(default)]
    pub max_requests: u64,

    /// Allow a worker to carry more than one proxied connection at a time
    /// (default: false, exclusive mode)
    #[serde(default)]
    pub concurrent_requests: bool,

    /// Grace period in seconds between SIGTERM and SIGKILL at shutdown
    /// (default: 5)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Command used to launch each worker process
    pub command: String,

    /// Arguments passed before the launch-file path
    #[serde(default)]
    pub args: Vec<String>,

    /// Application-bootstrap identifier handed to the worker
    #[serde(default)]
    pub bootstrap: String,

    /// Bridge identifier handed to the worker
    #[serde(default)]
    pub bridge: String,

    /// Environment tag handed to the worker (default: "dev")
    #[serde(default = "default_app_env")]
    pub app_env: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WatchConfig {
    /// Absolute paths watched from boot; workers contribute more via the
    /// control plane
    #[serde(default)]
    pub files: Vec<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    8
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_app_env() -> String {
    "dev".to_string()
}

fn default_logging() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            pid_file: None,
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_requests: 0,
            concurrent_requests: false,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("failed to read config file {}: {}", path.display(), e)
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            anyhow::anyhow!("failed to parse config file {}: {}", path.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.pool.workers == 0 {
            anyhow::bail!("pool.workers must be at least 1");
        }
        if self.worker.command.is_empty() {
            anyhow::bail!("worker.command must not be empty");
        }
        Ok(())
    }

    /// A minimal configuration for the given worker command, used by tests
    /// and embedders.
    pub fn for_worker_command(command: impl Into<String>) -> Self {
        Self {
            server: ServerConfig::default(),
            pool: PoolOptions::default(),
            worker: WorkerConfig {
                command: command.into(),
                args: Vec::new(),
                bootstrap: String::new(),
                bridge: String::new(),
                app_env: default_app_env(),
            },
            watch: WatchConfig::default(),
            debug: false,
            logging: default_logging(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.pool.shutdown_grace_secs)
    }
}
