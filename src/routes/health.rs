use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::cache::CacheBackendKind;
use crate::services::queue::QueueBackendKind;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub queue: QueueHealth,
    pub cache: CacheHealth,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub status: String,
    pub backend: QueueBackendKind,
    pub queue_depth: Option<u64>,
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct CacheHealth {
    pub status: String,
    pub backend: CacheBackendKind,
}

/// GET /health: backend selection and queue reachability.
///
/// Running on the in-process fallbacks is `degraded` but still 200; only a
/// queue that cannot be read turns the check into a 503.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let queue_backend = state.queue.backend_kind();
    let queue = match state.queue.queue_depth().await {
        Ok(depth) => QueueHealth {
            status: "ok".to_string(),
            backend: queue_backend,
            queue_depth: Some(depth),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(e) => {
            tracing::warn!(error = %e, "Queue health check failed");
            QueueHealth {
                status: "error".to_string(),
                backend: queue_backend,
                queue_depth: None,
                latency_ms: None,
            }
        }
    };
    if let Some(depth) = queue.queue_depth {
        metrics::gauge!("job_queue_depth").set(depth as f64);
    }

    let cache = CacheHealth {
        status: "ok".to_string(),
        backend: state.cache.backend_kind(),
    };

    let durable =
        queue_backend == QueueBackendKind::Redis && cache.backend == CacheBackendKind::Redis;
    let (status_code, status) = if queue.status != "ok" {
        (StatusCode::SERVICE_UNAVAILABLE, "error")
    } else if durable {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::OK, "degraded")
    };

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks { queue, cache },
    };

    (status_code, Json(response))
}
