use std::path::PathBuf;
use std::sync::Arc;

use crate::services::{
    cache::CacheStore, documents::DocumentStore, queue::JobQueue, webhooks::WebhookService,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
    pub cache: Arc<CacheStore>,
    pub webhooks: Arc<WebhookService>,
    pub documents: Arc<dyn DocumentStore>,
    /// Where uploaded files are written before extraction.
    pub upload_dir: PathBuf,
}

impl AppState {
    pub fn new(
        queue: Arc<JobQueue>,
        cache: Arc<CacheStore>,
        webhooks: Arc<WebhookService>,
        documents: Arc<dyn DocumentStore>,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue,
            cache,
            webhooks,
            documents,
            upload_dir: upload_dir.into(),
        }
    }
}
