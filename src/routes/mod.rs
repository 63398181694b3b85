use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::app_state::AppState;

pub mod cache;
pub mod documents;
pub mod error;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod webhooks;

/// Success envelope shared by every API response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

/// Health and `/api/v1` routes. `/metrics` and the tower layers are added by
/// the binary.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/documents", post(documents::upload_document))
        .route("/documents/{id}", get(documents::get_document))
        .route("/jobs", post(jobs::submit_job))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/status", get(jobs::get_job_status))
        .route("/jobs/{id}/result", get(jobs::get_job_result))
        .route(
            "/webhooks",
            post(webhooks::register_webhook).get(webhooks::list_webhooks),
        )
        .route("/webhooks/test", post(webhooks::test_webhook))
        .route(
            "/webhooks/{id}",
            get(webhooks::get_webhook)
                .patch(webhooks::update_webhook)
                .delete(webhooks::delete_webhook),
        )
        .route("/webhooks/{id}/deliveries", get(webhooks::list_deliveries))
        .route("/webhooks/{id}/stats", get(webhooks::delivery_stats))
        .route("/cache/stats", get(cache::cache_stats))
        .route("/cache", axum::routing::delete(cache::clear_cache));

    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/v1", api)
        .with_state(state)
}
