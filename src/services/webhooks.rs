use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use serde_json::Value;
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::webhook::{
    CreatedWebhook, DeliveryStats, DeliveryStatus, Webhook, WebhookDelivery, WebhookEvent,
    WebhookPayload, WebhookUpdate,
};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-ID";
pub const USER_AGENT_VALUE: &str = "DocumentProcessingAgent-Webhook/1.0";

/// Random bytes behind each webhook secret (hex-encoded to 64 chars).
const SECRET_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    /// Hard timeout per HTTP attempt.
    pub timeout: Duration,
    /// Total attempts per subscriber per trigger, first one included.
    pub max_attempts: u32,
    /// Deliveries kept in the system-wide history.
    pub history_size: usize,
    /// Delay before the first retry; doubled for each one after.
    pub base_retry_delay: Duration,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            history_size: 100,
            base_retry_delay: Duration::from_secs(1),
        }
    }
}

impl WebhookSettings {
    /// Wait after a failed `attempt` (1-based): 1s, 2s, 4s, ... No jitter.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_retry_delay.saturating_mul(1u32 << exponent)
    }
}

/// Webhook registry plus at-least-once, HMAC-signed delivery.
pub struct WebhookService {
    webhooks: RwLock<HashMap<String, Webhook>>,
    deliveries: Mutex<VecDeque<WebhookDelivery>>,
    http: Client,
    settings: WebhookSettings,
}

impl WebhookService {
    pub fn new(settings: WebhookSettings) -> Result<Self, WebhookError> {
        let http = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self {
            webhooks: RwLock::new(HashMap::new()),
            deliveries: Mutex::new(VecDeque::with_capacity(settings.history_size)),
            http,
            settings,
        })
    }

    pub fn settings(&self) -> &WebhookSettings {
        &self.settings
    }

    /// Register a subscription. `url` and `events` are expected to be validated
    /// by the caller. The returned secret is never exposed again.
    pub async fn register(
        &self,
        url: impl Into<String>,
        events: Vec<WebhookEvent>,
        metadata: Option<Value>,
    ) -> CreatedWebhook {
        let secret = generate_secret();
        let webhook = Webhook {
            id: format!("wh_{}", Uuid::new_v4().simple()),
            url: url.into(),
            secret: secret.clone(),
            events,
            active: true,
            created_at: Utc::now(),
            last_triggered: None,
            metadata,
        };

        self.webhooks
            .write()
            .await
            .insert(webhook.id.clone(), webhook.clone());

        tracing::info!(
            webhook_id = %webhook.id,
            url = %webhook.url,
            events = ?webhook.events,
            "Webhook registered"
        );

        CreatedWebhook { webhook, secret }
    }

    pub async fn get(&self, id: &str) -> Option<Webhook> {
        self.webhooks.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Webhook> {
        let mut webhooks: Vec<Webhook> = self.webhooks.read().await.values().cloned().collect();
        webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        webhooks
    }

    pub async fn update(&self, id: &str, update: WebhookUpdate) -> Option<Webhook> {
        let mut webhooks = self.webhooks.write().await;
        let webhook = webhooks.get_mut(id)?;
        if let Some(url) = update.url {
            webhook.url = url;
        }
        if let Some(events) = update.events {
            webhook.events = events;
        }
        if let Some(active) = update.active {
            webhook.active = active;
        }
        if let Some(metadata) = update.metadata {
            webhook.metadata = Some(metadata);
        }
        tracing::info!(webhook_id = %id, active = webhook.active, "Webhook updated");
        Some(webhook.clone())
    }

    pub async fn delete(&self, id: &str) -> bool {
        let deleted = self.webhooks.write().await.remove(id).is_some();
        if deleted {
            tracing::info!(webhook_id = %id, "Webhook deleted");
        }
        deleted
    }

    /// Fan an event out to every active subscriber. Each delivery runs on its
    /// own task, so this returns as soon as they are spawned and never fails.
    /// Returns how many subscribers matched.
    pub async fn trigger(self: &Arc<Self>, event: WebhookEvent, data: Value) -> usize {
        let matching: Vec<Webhook> = self
            .webhooks
            .read()
            .await
            .values()
            .filter(|webhook| webhook.subscribes_to(event))
            .cloned()
            .collect();

        tracing::info!(%event, matching_webhooks = matching.len(), "Triggering webhook event");

        let count = matching.len();
        for webhook in matching {
            let service = Arc::clone(self);
            let data = data.clone();
            tokio::spawn(async move {
                service.deliver_with_retries(webhook, event, data).await;
            });
        }
        count
    }

    /// Fire `event` with a canned payload so integrators can check their endpoint.
    pub async fn trigger_test(self: &Arc<Self>, event: WebhookEvent) -> (usize, Value) {
        let data = serde_json::json!({
            "test": true,
            "message": "This is a test webhook payload",
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        let count = self.trigger(event, data.clone()).await;
        (count, data)
    }

    /// Attempts run strictly in order for one subscriber; the webhook is
    /// re-read before every retry so deletion or deactivation stops them.
    async fn deliver_with_retries(&self, mut webhook: Webhook, event: WebhookEvent, data: Value) {
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let delivery = self.attempt_delivery(&webhook, event, &data, attempt).await;
            let delivered = delivery.status == DeliveryStatus::Success;
            self.record_delivery(delivery).await;

            if delivered {
                if let Some(current) = self.webhooks.write().await.get_mut(&webhook.id) {
                    current.last_triggered = Some(Utc::now());
                }
                return;
            }

            if attempt == max_attempts {
                break;
            }

            let delay = self.settings.retry_delay(attempt);
            tracing::info!(
                webhook_id = %webhook.id,
                %event,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Scheduling webhook retry"
            );
            tokio::time::sleep(delay).await;

            match self.get(&webhook.id).await {
                Some(current) if current.active => webhook = current,
                _ => {
                    tracing::info!(webhook_id = %webhook.id, %event, "Webhook removed or disabled, dropping retries");
                    return;
                }
            }
        }

        tracing::error!(
            webhook_id = %webhook.id,
            %event,
            attempts = max_attempts,
            "Webhook delivery abandoned after max attempts"
        );
    }

    async fn attempt_delivery(
        &self,
        webhook: &Webhook,
        event: WebhookEvent,
        data: &Value,
        attempt: u32,
    ) -> WebhookDelivery {
        let mut delivery = WebhookDelivery {
            webhook_id: webhook.id.clone(),
            event,
            url: webhook.url.clone(),
            attempt,
            status: DeliveryStatus::Pending,
            status_code: None,
            error: None,
            timestamp: Utc::now(),
            response_time_ms: None,
        };

        let payload = WebhookPayload {
            event,
            timestamp: delivery.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            data: data.clone(),
            webhook_id: webhook.id.clone(),
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                delivery.status = DeliveryStatus::Failed;
                delivery.error = Some(format!("Payload serialization failed: {}", e));
                return delivery;
            }
        };
        let signature = sign_payload(&webhook.secret, &body);

        let started = Instant::now();
        let result = self
            .http
            .post(&webhook.url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, event.to_string())
            .header(WEBHOOK_ID_HEADER, &webhook.id)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .body(body)
            .send()
            .await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) => {
                let status = response.status();
                delivery.response_time_ms = Some(elapsed.as_millis() as u64);
                delivery.status_code = Some(status.as_u16());
                if status.is_success() {
                    delivery.status = DeliveryStatus::Success;
                    tracing::info!(
                        webhook_id = %webhook.id,
                        %event,
                        status_code = status.as_u16(),
                        response_time_ms = elapsed.as_millis() as u64,
                        "Webhook delivered successfully"
                    );
                } else {
                    delivery.status = DeliveryStatus::Failed;
                    delivery.error = Some(format!(
                        "HTTP {}: {}",
                        status.as_u16(),
                        status.canonical_reason().unwrap_or("Unknown")
                    ));
                    tracing::warn!(
                        webhook_id = %webhook.id,
                        %event,
                        status_code = status.as_u16(),
                        attempt,
                        "Webhook delivery failed"
                    );
                }
            }
            Err(e) => {
                delivery.status = DeliveryStatus::Failed;
                delivery.error = Some(if e.is_timeout() {
                    format!("Timed out after {:?}", self.settings.timeout)
                } else {
                    e.to_string()
                });
                tracing::warn!(
                    webhook_id = %webhook.id,
                    %event,
                    error = %e,
                    attempt,
                    "Webhook delivery error"
                );
            }
        }

        metrics::counter!(
            "webhook_deliveries_total",
            "event" => event.to_string(),
            "status" => delivery.status.to_string()
        )
        .increment(1);
        metrics::histogram!("webhook_delivery_seconds").record(elapsed.as_secs_f64());

        delivery
    }

    async fn record_delivery(&self, delivery: WebhookDelivery) {
        let mut deliveries = self.deliveries.lock().await;
        deliveries.push_front(delivery);
        deliveries.truncate(self.settings.history_size);
    }

    /// Most recent first, optionally filtered to one webhook.
    pub async fn deliveries(&self, webhook_id: Option<&str>, limit: usize) -> Vec<WebhookDelivery> {
        self.deliveries
            .lock()
            .await
            .iter()
            .filter(|d| webhook_id.map_or(true, |id| d.webhook_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn stats(&self, webhook_id: Option<&str>) -> DeliveryStats {
        let deliveries = self.deliveries(webhook_id, usize::MAX).await;
        summarize(&deliveries)
    }
}

fn summarize(deliveries: &[WebhookDelivery]) -> DeliveryStats {
    let total = deliveries.len();
    let count = |status: DeliveryStatus| deliveries.iter().filter(|d| d.status == status).count();
    let successful = count(DeliveryStatus::Success);
    let failed = count(DeliveryStatus::Failed);
    let pending = count(DeliveryStatus::Pending);

    let timed: Vec<u64> = deliveries.iter().filter_map(|d| d.response_time_ms).collect();
    let avg_response_time_ms = if timed.is_empty() {
        0
    } else {
        (timed.iter().sum::<u64>() as f64 / timed.len() as f64).round() as u64
    };

    let success_rate = if total > 0 {
        (successful as f64 / total as f64 * 10_000.0).round() / 100.0
    } else {
        0.0
    };

    DeliveryStats {
        total,
        successful,
        failed,
        pending,
        success_rate,
        avg_response_time_ms,
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Lowercase hex HMAC-SHA256 of `body` keyed by `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Consumer-side check of a received signature header against the raw body.
/// Comparison is constant-time.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(received) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&received).is_ok()
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}
