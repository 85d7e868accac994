use anyhow::Result;
use para_collaborators::{
    build_oracle, ContentStore, DirectoryContentStore, InMemoryVectorIndex, MemoryContentStore,
    OracleConfig,
};
use para_engine::{http, ClassificationEngine, Collaborators, EngineConfig, SnapshotWorker};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG wins; default to info for this service, warn for the rest
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,para_engine=info,para_collaborators=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    info!("PARA Classification Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::from_env();

    let store: Arc<dyn ContentStore> = match &config.notes_dir {
        Some(dir) => {
            info!("Reading notes from {}", dir.display());
            Arc::new(DirectoryContentStore::new(dir))
        }
        None => {
            warn!("PARA_NOTES_DIR not set; only text submitted over HTTP can be classified");
            Arc::new(MemoryContentStore::new())
        }
    };

    let mut collaborators =
        Collaborators::new(store).with_index(Arc::new(InMemoryVectorIndex::default()));
    if let Some(oracle_config) = OracleConfig::from_env_optional() {
        match build_oracle(&oracle_config) {
            Ok(oracle) => {
                info!("Oracle enabled: {} ({})", oracle.name(), oracle_config.model);
                collaborators = collaborators.with_oracle(oracle);
            }
            Err(e) => warn!("Oracle disabled: {}", e),
        }
    }

    let bind_addr = config.bind_addr;
    let snapshot_interval = config.snapshot_interval;
    let engine = Arc::new(ClassificationEngine::open(config, collaborators)?);
    if let Err(e) = engine.rebuild_index().await {
        warn!("Starting with an empty index: {}", e);
    }

    let worker = snapshot_interval.map(|interval| SnapshotWorker::spawn(engine.metrics(), interval));

    let app = http::router(engine.clone());
    info!("Starting HTTP server on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    if let Some(worker) = worker {
        worker.stop().await;
    }

    match Arc::try_unwrap(engine) {
        Ok(engine) => engine.close()?,
        Err(_) => warn!("Engine still referenced at shutdown; skipping WAL checkpoint"),
    }

    Ok(())
}
