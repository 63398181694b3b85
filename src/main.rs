use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use docproc_agent::app_state::AppState;
use docproc_agent::config::AppConfig;
use docproc_agent::routes;
use docproc_agent::services::{
    cache::CacheStore,
    documents::{InMemoryDocumentStore, PlainTextExtractor},
    executor::DocumentJobExecutor,
    llm::ChatCompletionsClient,
    queue::{JobQueue, QueueSettings},
    webhooks::{WebhookService, WebhookSettings},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing document processing agent");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("jobs_enqueued_total", "Jobs accepted by the queue");
    metrics::describe_counter!("jobs_completed_total", "Jobs that finished successfully");
    metrics::describe_counter!("jobs_failed_total", "Jobs that finished with an error");
    metrics::describe_histogram!("job_processing_seconds", "Time spent executing a job");
    metrics::describe_gauge!("job_queue_depth", "Jobs waiting to be claimed");
    metrics::describe_counter!("cache_hits_total", "Cache lookups that found a live entry");
    metrics::describe_counter!("cache_misses_total", "Cache lookups that missed or failed");
    metrics::describe_counter!(
        "webhook_deliveries_total",
        "Webhook delivery attempts by event and outcome"
    );
    metrics::describe_histogram!(
        "webhook_delivery_seconds",
        "Duration of a single webhook delivery attempt"
    );

    let broker = config.broker();

    let webhooks = Arc::new(
        WebhookService::new(WebhookSettings {
            timeout: Duration::from_secs(config.webhook_timeout_secs),
            max_attempts: config.webhook_max_attempts,
            history_size: config.webhook_history_size,
            ..WebhookSettings::default()
        })
        .expect("Failed to initialize webhook HTTP client"),
    );

    let cache = Arc::new(
        CacheStore::connect(&broker, Duration::from_secs(config.cache_sweep_interval_secs)).await,
    );

    let llm = ChatCompletionsClient::new(
        &config.llm_base_url,
        config.llm_api_key.clone(),
        &config.llm_model,
        Duration::from_secs(config.llm_timeout_secs),
    )
    .expect("Failed to initialize LLM client");
    if config.llm_api_key.is_none() {
        tracing::warn!("LLM_API_KEY not set, generation jobs will fail at the provider");
    }

    let documents = Arc::new(InMemoryDocumentStore::new());
    let executor = Arc::new(DocumentJobExecutor::new(
        documents.clone(),
        Arc::new(PlainTextExtractor),
        Arc::new(llm),
        cache.clone(),
        webhooks.clone(),
        config.cache_ttl_secs,
    ));

    let queue = Arc::new(
        JobQueue::connect(
            &broker,
            QueueSettings {
                worker_concurrency: config.worker_concurrency,
                result_ttl: Duration::from_secs(config.job_result_ttl_secs),
            },
            executor,
            webhooks.clone(),
        )
        .await,
    );

    let state = AppState::new(
        queue.clone(),
        cache.clone(),
        webhooks,
        documents,
        &config.upload_dir,
    );

    let app = routes::router(state)
        .merge(
            Router::new()
                .route("/metrics", get(routes::metrics::prometheus_metrics))
                .with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!(
        bind_addr = %config.bind_addr,
        queue_backend = ?queue.backend_kind(),
        cache_backend = ?cache.backend_kind(),
        "Server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    tracing::info!("Shutting down");
    queue.close().await;
    cache.close().await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
