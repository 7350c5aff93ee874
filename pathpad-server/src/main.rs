//! pathpad server binary.
//!
//! ```text
//! pathpad-server --bind 0.0.0.0:9090 --data-dir /var/lib/pathpad
//! RUST_LOG=debug pathpad-server --config pathpad.toml
//! ```

mod config;

use clap::Parser;
use log::{error, info, warn};
use pathpad_collab::server::SyncServer;

use crate::config::Cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = config::resolve(Cli::parse())?;

    match &config.storage_path {
        Some(path) => info!("Using RocksDB storage at {}", path.display()),
        None => warn!("No data directory configured; documents are kept in memory"),
    }
    if config.admin_password.is_none() {
        info!("Admin password not set; administration disabled");
    }

    let server = SyncServer::new(config)?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Server stopped: {e}");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
