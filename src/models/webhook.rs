use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumIter, EnumString};

/// Domain events a webhook can subscribe to.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, EnumString, EnumIter, Display, PartialEq, Eq, Hash,
)]
pub enum WebhookEvent {
    #[serde(rename = "job.completed")]
    #[strum(serialize = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    #[strum(serialize = "job.failed")]
    JobFailed,
    #[serde(rename = "document.processed")]
    #[strum(serialize = "document.processed")]
    DocumentProcessed,
    #[serde(rename = "document.failed")]
    #[strum(serialize = "document.failed")]
    DocumentFailed,
    #[serde(rename = "summary.generated")]
    #[strum(serialize = "summary.generated")]
    SummaryGenerated,
    #[serde(rename = "quiz.generated")]
    #[strum(serialize = "quiz.generated")]
    QuizGenerated,
    #[serde(rename = "flashcards.generated")]
    #[strum(serialize = "flashcards.generated")]
    FlashcardsGenerated,
}

/// A registered subscription. The secret is never serialized; it is handed
/// out once through [`CreatedWebhook`] at registration time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: String,
    pub url: String,
    #[serde(skip)]
    pub(crate) secret: String,
    pub events: Vec<WebhookEvent>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_triggered: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Webhook {
    pub fn subscribes_to(&self, event: WebhookEvent) -> bool {
        self.active && self.events.contains(&event)
    }
}

/// Registration response: the only place the signing secret is exposed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedWebhook {
    #[serde(flatten)]
    pub webhook: Webhook,
    pub secret: String,
}

/// Partial update. The id and secret are immutable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookUpdate {
    pub url: Option<String>,
    pub events: Option<Vec<WebhookEvent>>,
    pub active: Option<bool>,
    pub metadata: Option<Value>,
}

/// Body POSTed to subscribers. Field order and names are part of the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: WebhookEvent,
    pub timestamp: String,
    pub data: Value,
    pub webhook_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

/// One HTTP attempt, recorded whatever its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub webhook_id: String,
    pub event: WebhookEvent,
    pub url: String,
    pub attempt: u32,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub pending: usize,
    /// Percentage, two decimals.
    pub success_rate: f64,
    pub avg_response_time_ms: u64,
}

/// POST /api/v1/webhooks body. Event names are checked against
/// [`WebhookEvent`] after shape validation.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWebhookRequest {
    #[garde(url, length(max = 2048))]
    pub url: String,
    #[garde(length(min = 1, max = 16))]
    pub events: Vec<String>,
    #[garde(skip)]
    pub metadata: Option<Value>,
}

/// PATCH /api/v1/webhooks/{id} body.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWebhookRequest {
    #[garde(url, length(max = 2048))]
    pub url: Option<String>,
    #[garde(length(min = 1, max = 16))]
    pub events: Option<Vec<String>>,
    #[garde(skip)]
    pub active: Option<bool>,
    #[garde(skip)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TestWebhookRequest {
    pub event: Option<String>,
}
