use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use strum::IntoEnumIterator;

use crate::app_state::AppState;
use crate::models::webhook::{
    CreatedWebhook, DeliveryStats, RegisterWebhookRequest, TestWebhookRequest,
    UpdateWebhookRequest, Webhook, WebhookDelivery, WebhookEvent, WebhookUpdate,
};
use crate::routes::error::ApiError;
use crate::routes::ApiResponse;

const DEFAULT_DELIVERY_LIMIT: usize = 50;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredWebhook {
    #[serde(flatten)]
    pub webhook: CreatedWebhook,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct WebhookList {
    pub webhooks: Vec<Webhook>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryList {
    pub webhook_id: String,
    pub deliveries: Vec<WebhookDelivery>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookStatsResponse {
    pub webhook_id: String,
    #[serde(flatten)]
    pub stats: DeliveryStats,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestTriggered {
    pub event: WebhookEvent,
    pub webhooks_triggered: usize,
    pub test_data: Value,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub id: String,
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeliveryQuery {
    pub limit: Option<usize>,
}

fn parse_event(name: &str) -> Result<WebhookEvent, ApiError> {
    WebhookEvent::from_str(name).map_err(|_| ApiError::InvalidEvent {
        event: name.to_string(),
        valid: WebhookEvent::iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Parse and de-duplicate subscribed event names.
fn parse_events(names: &[String]) -> Result<Vec<WebhookEvent>, ApiError> {
    let mut events = Vec::with_capacity(names.len());
    for name in names {
        let event = parse_event(name)?;
        if !events.contains(&event) {
            events.push(event);
        }
    }
    Ok(events)
}

/// Only plain HTTP(S) endpoints can receive deliveries.
fn check_scheme(url: &str) -> Result<(), ApiError> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        Err(ApiError::InvalidParameters(
            "Webhook URL must use http or https".to_string(),
        ))
    }
}

/// POST /api/v1/webhooks: 201 with the signing secret, shown only here.
pub async fn register_webhook(
    State(state): State<AppState>,
    request: Result<Json<RegisterWebhookRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<RegisteredWebhook>>), ApiError> {
    let Json(request) = request?;
    request
        .validate()
        .map_err(|e| ApiError::InvalidParameters(e.to_string()))?;
    check_scheme(&request.url)?;
    let events = parse_events(&request.events)?;

    let created = state
        .webhooks
        .register(request.url, events, request.metadata)
        .await;

    Ok((
        StatusCode::CREATED,
        ApiResponse::ok(RegisteredWebhook {
            webhook: created,
            message: "Webhook registered successfully. Save the secret for signature verification.",
        }),
    ))
}

/// GET /api/v1/webhooks
pub async fn list_webhooks(State(state): State<AppState>) -> Json<ApiResponse<WebhookList>> {
    let webhooks = state.webhooks.list().await;
    let count = webhooks.len();
    ApiResponse::ok(WebhookList { webhooks, count })
}

/// GET /api/v1/webhooks/{id}
pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Webhook>>, ApiError> {
    let webhook = state
        .webhooks
        .get(&id)
        .await
        .ok_or(ApiError::WebhookNotFound(id))?;
    Ok(ApiResponse::ok(webhook))
}

/// PATCH /api/v1/webhooks/{id}
pub async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Result<Json<UpdateWebhookRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<Webhook>>, ApiError> {
    let Json(request) = request?;
    request
        .validate()
        .map_err(|e| ApiError::InvalidParameters(e.to_string()))?;
    if let Some(url) = &request.url {
        check_scheme(url)?;
    }
    let events = request.events.as_deref().map(parse_events).transpose()?;

    let update = WebhookUpdate {
        url: request.url,
        events,
        active: request.active,
        metadata: request.metadata,
    };
    let webhook = state
        .webhooks
        .update(&id, update)
        .await
        .ok_or(ApiError::WebhookNotFound(id))?;
    Ok(ApiResponse::ok(webhook))
}

/// DELETE /api/v1/webhooks/{id}
pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Deleted>>, ApiError> {
    if !state.webhooks.delete(&id).await {
        return Err(ApiError::WebhookNotFound(id));
    }
    Ok(ApiResponse::ok(Deleted { id, deleted: true }))
}

/// GET /api/v1/webhooks/{id}/deliveries?limit=
pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<String>,
    query: Result<Query<DeliveryQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<DeliveryList>>, ApiError> {
    let Query(query) = query?;
    if state.webhooks.get(&id).await.is_none() {
        return Err(ApiError::WebhookNotFound(id));
    }
    let limit = query.limit.unwrap_or(DEFAULT_DELIVERY_LIMIT);
    let deliveries = state.webhooks.deliveries(Some(&id), limit).await;
    let count = deliveries.len();
    Ok(ApiResponse::ok(DeliveryList {
        webhook_id: id,
        deliveries,
        count,
    }))
}

/// GET /api/v1/webhooks/{id}/stats
pub async fn delivery_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WebhookStatsResponse>>, ApiError> {
    if state.webhooks.get(&id).await.is_none() {
        return Err(ApiError::WebhookNotFound(id));
    }
    let stats = state.webhooks.stats(Some(&id)).await;
    Ok(ApiResponse::ok(WebhookStatsResponse {
        webhook_id: id,
        stats,
    }))
}

/// POST /api/v1/webhooks/test: fire a canned payload at every subscriber
/// of `event` (default `job.completed`).
pub async fn test_webhook(
    State(state): State<AppState>,
    body: Result<Option<Json<TestWebhookRequest>>, JsonRejection>,
) -> Result<Json<ApiResponse<TestTriggered>>, ApiError> {
    let request = body?.map(|Json(request)| request).unwrap_or_default();
    let event = match request.event {
        Some(name) => parse_event(&name)?,
        None => WebhookEvent::JobCompleted,
    };

    let (webhooks_triggered, test_data) = state.webhooks.trigger_test(event).await;
    Ok(ApiResponse::ok(TestTriggered {
        event,
        webhooks_triggered,
        test_data,
    }))
}
