use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::routes::error::ApiError;
use crate::routes::ApiResponse;
use crate::services::cache::CacheStats;

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    /// Glob such as `llm:*`. Without it the whole cache is cleared.
    pub pattern: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Cleared {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<usize>,
}

/// GET /api/v1/cache/stats
pub async fn cache_stats(State(state): State<AppState>) -> Json<ApiResponse<CacheStats>> {
    ApiResponse::ok(state.cache.stats().await)
}

/// DELETE /api/v1/cache?pattern=
pub async fn clear_cache(
    State(state): State<AppState>,
    query: Result<Query<ClearQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<Cleared>>, ApiError> {
    let Query(query) = query?;
    let cleared = match query.pattern.filter(|p| !p.trim().is_empty()) {
        Some(pattern) => {
            let deleted = state.cache.delete_pattern(&pattern).await;
            ApiResponse::ok(Cleared {
                pattern: Some(pattern),
                deleted: Some(deleted),
            })
        }
        None => {
            state.cache.clear().await;
            ApiResponse::ok(Cleared {
                pattern: None,
                deleted: None,
            })
        }
    };
    Ok(cleared)
}
