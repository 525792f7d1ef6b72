//! Configuration management for Blockswap
//!
//! Handles CLI argument parsing, the optional TOML exchange config, and
//! defaults.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::advertiser::{DEFAULT_PROVIDE_CONCURRENCY, DEFAULT_REPROVIDE_INTERVAL};
use crate::decision::{EngineConfig, DEFAULT_RECIPROCITY_GRACE_BYTES, DEFAULT_TARGET_ENVELOPE_BYTES};
use crate::provide_queue::{FullQueuePolicy, DEFAULT_PROVIDE_QUEUE_CAPACITY};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "blockswap")]
#[command(about = "Content-addressed block exchange node", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the exchange node
    Start(StartCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct StartCommand {
    /// Data directory for the block database
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// HTTP port for REST API
    #[arg(long, default_value_t = 8080)]
    pub api_port: u16,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// TOML file with `[exchange]` settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Serve blocks by reference from files under this directory
    #[arg(long)]
    pub filestore_root: Option<PathBuf>,

    /// Number of task workers sending blocks to peers
    #[arg(long)]
    pub task_workers: Option<usize>,
}

/// Exchange engine tuning, loadable from the `[exchange]` table of a TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub task_workers: usize,
    pub target_envelope_bytes: u64,
    pub reciprocity_grace_bytes: u64,
    /// Ask peers to answer DONT_HAVE for blocks they lack
    pub send_dont_have: bool,
    pub provide_queue_capacity: usize,
    pub provide_full_policy: FullQueuePolicy,
    pub provide_concurrency: usize,
    /// 0 disables the reprovide sweep
    pub reprovide_interval_secs: u64,
    pub rebroadcast_interval_secs: u64,
    pub default_priority: i32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            task_workers: 8,
            target_envelope_bytes: DEFAULT_TARGET_ENVELOPE_BYTES,
            reciprocity_grace_bytes: DEFAULT_RECIPROCITY_GRACE_BYTES,
            send_dont_have: false,
            provide_queue_capacity: DEFAULT_PROVIDE_QUEUE_CAPACITY,
            provide_full_policy: FullQueuePolicy::DropNewest,
            provide_concurrency: DEFAULT_PROVIDE_CONCURRENCY,
            reprovide_interval_secs: DEFAULT_REPROVIDE_INTERVAL.as_secs(),
            rebroadcast_interval_secs: 10,
            default_priority: 1,
        }
    }
}

impl ExchangeConfig {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            target_envelope_bytes: self.target_envelope_bytes,
            reciprocity_grace_bytes: self.reciprocity_grace_bytes,
        }
    }

    pub fn reprovide_interval(&self) -> Option<Duration> {
        (self.reprovide_interval_secs > 0).then(|| Duration::from_secs(self.reprovide_interval_secs))
    }

    pub fn rebroadcast_interval(&self) -> Duration {
        Duration::from_secs(self.rebroadcast_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_workers == 0 {
            return Err(ConfigError::Invalid("task_workers must be at least 1".into()));
        }
        if self.target_envelope_bytes == 0 {
            return Err(ConfigError::Invalid("target_envelope_bytes must be positive".into()));
        }
        if self.provide_queue_capacity == 0 {
            return Err(ConfigError::Invalid("provide_queue_capacity must be positive".into()));
        }
        if self.provide_concurrency == 0 {
            return Err(ConfigError::Invalid("provide_concurrency must be at least 1".into()));
        }
        if self.rebroadcast_interval_secs == 0 {
            return Err(ConfigError::Invalid("rebroadcast_interval_secs must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    exchange: ExchangeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub api_port: u16,
    pub log_level: String,
    pub filestore_root: Option<PathBuf>,
    pub exchange: ExchangeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            api_port: 8080,
            log_level: "info".to_string(),
            filestore_root: None,
            exchange: ExchangeConfig::default(),
        }
    }
}

impl Config {
    /// Create config from CLI arguments, reading `--config` if given
    pub fn from_cli() -> Result<Self, ConfigError> {
        let cli = Cli::parse();

        match cli.command {
            Commands::Start(cmd) => Self::from_start_command(cmd),
        }
    }

    pub fn from_start_command(cmd: StartCommand) -> Result<Self, ConfigError> {
        let mut exchange = match &cmd.config {
            Some(path) => Self::load_exchange_config(path)?,
            None => ExchangeConfig::default(),
        };
        if let Some(workers) = cmd.task_workers {
            exchange.task_workers = workers;
        }
        exchange.validate()?;

        Ok(Config {
            data_dir: cmd.data_dir,
            api_port: cmd.api_port,
            log_level: cmd.log_level,
            filestore_root: cmd.filestore_root,
            exchange,
        })
    }

    /// Load the `[exchange]` table from a TOML file; missing keys take defaults
    pub fn load_exchange_config(path: &Path) -> Result<ExchangeConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content)?;
        Ok(file.exchange)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn filestore_index_path(&self) -> PathBuf {
        self.data_dir.join("filestore")
    }
}
