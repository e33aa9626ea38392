use std::sync::Arc;

use calsync_stream::server::{ServerConfig, ServerError, SyncService};
use log::info;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!(
        "Starting calsync-server on {} (storage: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "in-memory".to_string(), |p| p.display().to_string())
    );

    let service = Arc::new(SyncService::new(config)?);
    let stopper = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.shutdown();
        }
    });

    service.run().await
}
