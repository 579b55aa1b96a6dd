use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use rag_messenger_server::{
    build_router,
    config::Settings,
    database::{ConversationStore, DbPool, Repository},
    pipeline::{Pipeline, PipelineDeps},
    queue,
    services::{
        conversation::MemoryManager, Broadcaster, EmbeddingService, EventBus, GraphApiClient,
        LlmGateway, RagService, VectorRetrievalService,
    },
    state::AppState,
    utils::{logger::init_logger, Limiters},
    vault::CredentialVault,
    webhook::WebhookService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    let _log_guard = init_logger(&settings.logging)?;
    info!("Starting RAG messenger server...");

    let vault = CredentialVault::from_base64(&settings.security.vault_key)?;

    // Initialize database pool
    let db_pool = DbPool::new(&settings.database).await?;
    info!("Database connection established");

    let repository = Arc::new(Repository::new(db_pool.clone()));
    repository.ensure_schema().await?;

    let limiters = Arc::new(Limiters::new(&settings.limits));
    let events = Arc::new(EventBus::new(settings.broadcaster.channel_capacity));

    // Initialize services
    let embedding = Arc::new(EmbeddingService::new(&settings.embedding));
    let retrieval = Arc::new(VectorRetrievalService::new(
        embedding,
        repository.clone(),
        repository.clone(),
        limiters.clone(),
    ));
    let gateway = Arc::new(LlmGateway::new(settings.llm.clone(), limiters.clone())?);
    let memory = Arc::new(MemoryManager::new(
        repository.clone(),
        gateway.clone(),
        settings.memory.clone(),
    ));
    let rag = Arc::new(RagService::new(
        retrieval,
        gateway,
        memory,
        settings.retrieval.clone(),
    ));

    let job_queue = queue::connect(&settings.queue).await;
    let store: Arc<dyn ConversationStore> = repository.clone();
    let broadcaster: Arc<dyn Broadcaster> = events.clone();

    let pipeline = Pipeline::new(PipelineDeps {
        store: store.clone(),
        queue: job_queue,
        rag,
        platform: Arc::new(GraphApiClient::new(&settings.platform)?),
        broadcaster: broadcaster.clone(),
        vault: vault.clone(),
        config: settings.pipeline.clone(),
        dequeue_wait: Duration::from_millis(settings.queue.dequeue_wait_ms),
    });
    let workers = pipeline.start();

    let webhook = Arc::new(WebhookService::new(
        store,
        vault,
        pipeline.clone(),
        broadcaster,
        settings.security.app_secret.clone(),
        settings.security.platform_object.clone(),
        settings.security.fallback_verify_token.clone(),
    ));

    // Server address
    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));

    let app = build_router(AppState {
        settings: Arc::new(settings),
        webhook,
        pipeline,
        events,
    });

    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, draining workers");
    workers.shutdown().await;
    db_pool.close().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
