//! Server configuration: an optional TOML file with command line and
//! environment overrides on top.

use std::path::{Path, PathBuf};

use clap::Parser;
use pathpad_collab::server::ServerConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Command line arguments.
#[derive(Parser, Debug, Default)]
#[command(name = "pathpad-server")]
#[command(about = "Path-addressed collaborative notepad server")]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "PATHPAD_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long, env = "PATHPAD_BIND", value_name = "ADDR")]
    pub bind: Option<String>,

    /// RocksDB directory; documents are kept in memory when unset
    #[arg(short, long, env = "PATHPAD_DATA_DIR", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Password for the admin endpoints; administration is off when unset
    #[arg(long, env = "PATHPAD_ADMIN_PASSWORD", hide_env_values = true)]
    pub admin_password: Option<String>,
}

/// On-disk configuration. Every field is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub bind: String,
    pub data_dir: Option<PathBuf>,
    pub admin_password: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub maintenance_interval_secs: u64,
    pub session_ttl_secs: u64,
    pub presence_ttl_secs: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            bind: defaults.bind_addr,
            data_dir: defaults.storage_path,
            admin_password: defaults.admin_password,
            heartbeat_interval_secs: defaults.heartbeat_interval_secs,
            maintenance_interval_secs: defaults.maintenance_interval_secs,
            session_ttl_secs: defaults.session_ttl_secs,
            presence_ttl_secs: defaults.presence_ttl_secs,
        }
    }
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Resolve the effective server configuration. Command line and
/// environment values win over the file.
pub fn resolve(cli: Cli) -> Result<ServerConfig, ConfigError> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let config = ServerConfig {
        bind_addr: cli.bind.unwrap_or(file.bind),
        heartbeat_interval_secs: file.heartbeat_interval_secs,
        maintenance_interval_secs: file.maintenance_interval_secs,
        session_ttl_secs: file.session_ttl_secs,
        presence_ttl_secs: file.presence_ttl_secs,
        storage_path: cli.data_dir.or(file.data_dir),
        admin_password: cli
            .admin_password
            .or(file.admin_password)
            .filter(|p| !p.trim().is_empty()),
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    let intervals = [
        ("heartbeat_interval_secs", config.heartbeat_interval_secs),
        ("maintenance_interval_secs", config.maintenance_interval_secs),
        ("session_ttl_secs", config.session_ttl_secs),
        ("presence_ttl_secs", config.presence_ttl_secs),
    ];
    match intervals.iter().find(|(_, secs)| *secs == 0) {
        Some((name, _)) => Err(ConfigError::ZeroInterval(name)),
        None => Ok(()),
    }
}
