use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use rentio::logger;
use rentio::modules::ingest::{pipeline::Pipeline, start_ingestion};
use rentio::shared::config::{Configs, StoreBackend};
use rentio::shared::db::{ensure_indexes, get_db, memory::MemoryStore, mongo::MongoStore};
use rentio::shared::errors::StoreError;
use rentio::shared::signals::wait_for_shutdown_signal;

#[tokio::main]
async fn main() {
    let configs = match Configs::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configurations: {}", e);
            std::process::exit(1);
        }
    };
    logger::start_log(&configs.log_level);
    log::info!("Configurations loaded");

    let pipeline = match build_pipeline(&configs).await {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            log::error!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let ingestion = match start_ingestion(&configs, pipeline, shutdown.clone()).await {
        Ok(task) => task,
        Err(e) => {
            log::error!("Failed to start mqtt ingestion: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Mqtt started...");

    if let Err(e) = wait_for_shutdown_signal().await {
        log::error!("Signal handler failed: {}", e);
    }
    log::info!("Shutting down");
    shutdown.cancel();

    if let Err(e) = ingestion.await {
        log::error!("Ingestion task failed: {}", e);
    }
}

async fn build_pipeline(configs: &Configs) -> Result<Pipeline, StoreError> {
    let policy = configs.ingest.registration.clone();

    match configs.database.backend {
        StoreBackend::Mongo => {
            let db = get_db(&configs.database).await?;
            ensure_indexes(&db).await?;
            log::info!("Connected to database '{}'", configs.database.database);
            Ok(Pipeline::new(Arc::new(MongoStore::new(db)), policy))
        }
        StoreBackend::Memory => {
            log::warn!("Using the in-memory store, nothing is kept across restarts");
            Ok(Pipeline::new(Arc::new(MemoryStore::new()), policy))
        }
    }
}
