use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use chat_relay::{
    config::Config,
    create_router,
    llm::create_adapter,
    storage::{FileHistoryStore, HistoryStore},
    utils::init_logger,
    AppState, JobService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config.server);
    info!("Job engine: {:?}", config.jobs);

    // Conversation history on disk
    let store = FileHistoryStore::new(&config.history.dir);
    store
        .ensure_dir()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create history directory: {}", e))?;
    info!("History directory: {}", store.dir().display());
    let history: Arc<dyn HistoryStore> = Arc::new(store);

    let provider = create_adapter(&config.llm);
    let jobs = Arc::new(JobService::new(
        &config.jobs,
        config.llm.default_model.clone(),
        provider,
        history.clone(),
    ));
    jobs.spawn_gc(config.jobs.gc_interval());

    let state = AppState {
        config: config.clone(),
        jobs,
        history,
    };
    let app = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
