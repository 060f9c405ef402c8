//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The configuration file path defaults to `config.yaml` but can
//! be specified via `-f` flag or `NIMCTL_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources
//! override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `NIMCTL_` override
//!    YAML values; double underscores address nested fields, e.g.
//!    `NIMCTL_QUEUE__REDIS_URL=redis://localhost:46581` sets
//!    `queue.redis_url`.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use nimctl::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//! println!("Server will bind to {}", config.bind_address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use stratus::PlannerConfig;

use crate::errors::Error;

/// CLI args: config file selection plus the internal child-mode subcommand.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "NIMCTL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute one request in an isolated child process (internal; spawned
    /// by the server's workers).
    RunRequest {
        /// The request to execute.
        #[arg(long)]
        request_id: String,

        /// Drop the entrypoint's return value instead of persisting it.
        #[arg(long)]
        ignore_return_value: bool,
    },
}

/// Queue backend settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Key-value server hosting the lanes. When unset or unreachable, the
    /// server falls back to in-process queues.
    pub redis_url: Option<String>,
    /// How long the startup ping may take before falling back (ms).
    pub ping_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            redis_url: None,
            ping_timeout_ms: 100,
        }
    }
}

/// Reaper settings: reconciliation of RUNNING records whose child died.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperConfig {
    pub enabled: bool,
    /// Probe interval (ms).
    pub interval_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig {
            enabled: true,
            interval_ms: 10_000,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Directory holding the request store, per-request logs, and uploads
    pub state_dir: PathBuf,
    /// Deployment mode: lifts the local cap on blocking workers
    pub deploy: bool,
    /// Queue backend configuration
    pub queue: QueueConfig,
    /// Worker-plan tunables
    pub planner: PlannerConfig,
    /// Reaper configuration
    pub reaper: ReaperConfig,
    /// Dot-separated workload-config paths clients may not override
    pub config_deny_keys: Vec<String>,
    /// Server-side workload configuration; request overrides merge over it
    pub workload_config: serde_json::Value,
    /// Worker queue poll interval (ms)
    pub poll_interval_ms: u64,
    /// Poll interval for the long-poll and log-streaming endpoints (ms)
    pub stream_poll_interval_ms: u64,

    /// Path this config was loaded from; forwarded to child processes.
    #[serde(skip)]
    pub config_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "0.0.0.0".to_string(),
            port: 46580,
            state_dir: PathBuf::from("state"),
            deploy: false,
            queue: QueueConfig::default(),
            planner: PlannerConfig::default(),
            reaper: ReaperConfig::default(),
            config_deny_keys: vec!["api_server".to_string()],
            workload_config: serde_json::Value::Object(serde_json::Map::new()),
            poll_interval_ms: 100,
            stream_poll_interval_ms: 100,
            config_path: "config.yaml".to_string(),
        }
    }
}

impl Config {
    fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("NIMCTL_").split("__"))
    }

    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;
        config.config_path = args.config.clone();
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The embedded relational store file.
    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("requests.db")
    }

    /// Per-request log files: `<log_dir>/<request_id>.log`.
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Per-user uploaded file-mount trees.
    pub fn uploads_dir(&self) -> PathBuf {
        self.state_dir.join("uploads")
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        if self.planner.per_blocking_gb <= 0.0 || self.planner.per_nonblocking_gb <= 0.0 {
            return Err(Error::BadRequest {
                message: "Config validation: per-slot memory budgets must be positive".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.planner.blocking_mem_pct) {
            return Err(Error::BadRequest {
                message: "Config validation: blocking_mem_pct must be within (0, 1]".to_string(),
            });
        }
        if self.planner.cpu_mult <= 0.0 {
            return Err(Error::BadRequest {
                message: "Config validation: cpu_mult must be positive".to_string(),
            });
        }
        if self.poll_interval_ms == 0 || self.stream_poll_interval_ms == 0 {
            return Err(Error::BadRequest {
                message: "Config validation: poll intervals must be positive".to_string(),
            });
        }
        Ok(())
    }
}
