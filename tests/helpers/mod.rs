//! Shared setup for the integration tests: a fully in-process application
//! wired the same way `main` wires it, with a scripted LLM.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;
use tower::util::ServiceExt;

use docproc_agent::app_state::AppState;
use docproc_agent::models::document::{Document, DocumentStatus};
use docproc_agent::models::webhook::WebhookDelivery;
use docproc_agent::routes;
use docproc_agent::services::cache::CacheStore;
use docproc_agent::services::documents::{DocumentStore, InMemoryDocumentStore, PlainTextExtractor};
use docproc_agent::services::executor::DocumentJobExecutor;
use docproc_agent::services::llm::{GenerateOptions, LlmClient, LlmError, LlmResponse};
use docproc_agent::services::queue::JobQueue;
use docproc_agent::services::webhooks::{WebhookService, WebhookSettings};

/// LLM stand-in that always answers with the same content.
pub struct FixedLlm {
    pub content: String,
    pub calls: AtomicUsize,
}

impl FixedLlm {
    pub fn new(content: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            content: content.into(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LlmClient for FixedLlm {
    async fn generate_text(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _options: GenerateOptions,
    ) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(LlmResponse {
            content: self.content.clone(),
            usage: None,
        })
    }
}

pub struct TestApp {
    pub state: AppState,
    pub queue: Arc<JobQueue>,
    pub webhooks: Arc<WebhookService>,
    pub documents: Arc<InMemoryDocumentStore>,
    pub cache: Arc<CacheStore>,
    pub llm: Arc<FixedLlm>,
    pub upload_dir: TempDir,
}

impl TestApp {
    pub fn router(&self) -> Router {
        routes::router(self.state.clone())
    }

    /// Write `text` to disk and register it as an uploaded document.
    pub async fn add_text_document(&self, id: &str, text: &str) -> Document {
        let path = self.upload_dir.path().join(format!("{}.txt", id));
        tokio::fs::write(&path, text).await.unwrap();
        let document = Document::new(
            id,
            format!("{}.txt", id),
            path.to_string_lossy(),
            "text/plain",
            text.len() as u64,
        );
        self.documents.save(document.clone()).await;
        document
    }

    /// Register a document whose text has already been extracted.
    pub async fn add_processed_document(&self, id: &str, text: &str) {
        let mut document = Document::new(id, "notes.txt", "/dev/null", "text/plain", 0);
        document.status = DocumentStatus::Completed;
        document.extracted_text = Some(text.to_string());
        self.documents.save(document).await;
    }
}

/// Webhook settings with the production timings.
pub async fn spawn_app(llm_content: &str) -> TestApp {
    spawn_app_with(WebhookSettings::default(), llm_content).await
}

pub async fn spawn_app_with(webhook_settings: WebhookSettings, llm_content: &str) -> TestApp {
    let webhooks = Arc::new(WebhookService::new(webhook_settings).unwrap());
    let cache = Arc::new(CacheStore::in_memory(Duration::from_secs(300)));
    let documents = Arc::new(InMemoryDocumentStore::new());
    let llm = FixedLlm::new(llm_content);
    let executor = Arc::new(DocumentJobExecutor::new(
        documents.clone(),
        Arc::new(PlainTextExtractor),
        llm.clone(),
        cache.clone(),
        webhooks.clone(),
        3600,
    ));
    let queue = Arc::new(JobQueue::in_memory(executor, webhooks.clone()));
    let upload_dir = tempfile::tempdir().unwrap();

    let state = AppState::new(
        queue.clone(),
        cache.clone(),
        webhooks.clone(),
        documents.clone(),
        upload_dir.path(),
    );

    TestApp {
        state,
        queue,
        webhooks,
        documents,
        cache,
        llm,
        upload_dir,
    }
}

/// Poll the delivery history until `webhook_id` has at least `count`
/// recorded attempts, or panic after `timeout`.
pub async fn wait_for_deliveries(
    webhooks: &WebhookService,
    webhook_id: &str,
    count: usize,
    timeout: Duration,
) -> Vec<WebhookDelivery> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let deliveries = webhooks.deliveries(Some(webhook_id), usize::MAX).await;
        if deliveries.len() >= count {
            return deliveries;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "expected {} deliveries for {} within {:?}, saw {}",
                count,
                webhook_id,
                timeout,
                deliveries.len()
            );
        }
        sleep(Duration::from_millis(25)).await;
    }
}

/// Send one request through the router and decode the JSON body.
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
