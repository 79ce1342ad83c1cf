//! Standalone sync server.
//!
//! Configured through `ATRIUM_*` environment variables; see
//! [`ServerConfig::from_env`]. Logging follows `RUST_LOG`.

use std::sync::Arc;

use atrium_sync::{MemoryStore, OpStore, ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env()?;
    log::info!("Starting atrium-server on {}...", config.bind_addr);

    let store = open_store(&config)?;
    let server = SyncServer::with_store(config, store);
    server.run().await
}

#[cfg(feature = "rocksdb")]
fn open_store(config: &ServerConfig) -> Result<Arc<dyn OpStore>, Box<dyn std::error::Error + Send + Sync>> {
    match &config.storage_path {
        Some(path) => {
            let store = atrium_sync::RocksStore::open(atrium_sync::StoreConfig::new(path.clone()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(not(feature = "rocksdb"))]
fn open_store(config: &ServerConfig) -> Result<Arc<dyn OpStore>, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(path) = &config.storage_path {
        log::warn!(
            "ATRIUM_STORAGE_PATH={} ignored: built without the `rocksdb` feature",
            path.display()
        );
    }
    Ok(Arc::new(MemoryStore::new()))
}
