//! Cowork session server.
//!
//! Configuration comes from `COWORK_*` environment variables (see
//! [`ServerConfig::from_env`]); log verbosity from `RUST_LOG`, default `info`.

use cowork_session::server::{ServerConfig, ServerError, SessionServer};
use log::info;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    match &config.storage_path {
        Some(path) => info!("Durable history at {}", path.display()),
        None => info!("No storage path set; history is kept in memory"),
    }

    let server = SessionServer::new(config)?;
    let stats = server.stats_handle();

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let s = stats.snapshot();
            info!(
                "Shutting down: {} connections served, {} events handled, {} rejected",
                s.total_connections, s.events_handled, s.events_rejected
            );
            Ok(())
        }
    }
}
