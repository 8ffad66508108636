//! Standalone MTP relay.
//!
//! Usage: `mtp-relay [config.json]`. The config file holds a
//! [`ServerConfig`] in JSON; omitted fields keep their defaults. `MTP_BIND`
//! overrides the bind address. Log verbosity follows `RUST_LOG`.

use std::path::Path;

use log::info;
use mtp_collab::{RelayServer, ServerConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const BIND_ENV: &str = "MTP_BIND";

fn load_config(path: Option<&Path>) -> Result<ServerConfig, BoxError> {
    let mut config: ServerConfig = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            serde_json::from_str(&raw).map_err(|e| format!("invalid config {}: {e}", path.display()))?
        }
        None => ServerConfig::default(),
    };
    if let Ok(bind) = std::env::var(BIND_ENV) {
        if !bind.trim().is_empty() {
            config.bind_addr = bind.trim().to_string();
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args().nth(1);
    let config = load_config(path.as_deref().map(Path::new))?;
    info!("Starting MTP relay on {}", config.bind_addr);

    RelayServer::new(config).run().await
}
