use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::document::Document;
use crate::routes::error::ApiError;
use crate::routes::ApiResponse;

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub filename: String,
}

/// POST /api/v1/documents?filename= with the raw file as the body.
/// Stores the file and its metadata; text extraction runs as a job.
pub async fn upload_document(
    State(state): State<AppState>,
    query: Result<Query<UploadQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ApiResponse<Document>>), ApiError> {
    let Query(query) = query?;
    let filename = query.filename.trim();
    if filename.is_empty() || filename.contains(['/', '\\']) || filename.starts_with('.') {
        return Err(ApiError::InvalidParameters(
            "filename must be a plain file name".to_string(),
        ));
    }
    if body.is_empty() {
        return Err(ApiError::InvalidParameters("Document body is empty".to_string()));
    }

    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream");

    let id = format!("doc_{}", Uuid::new_v4().simple());
    tokio::fs::create_dir_all(&state.upload_dir).await?;
    let path = state.upload_dir.join(format!("{}_{}", id, filename));
    tokio::fs::write(&path, &body).await?;

    let document = Document::new(
        id,
        filename,
        path.to_string_lossy(),
        mime_type,
        body.len() as u64,
    );
    state.documents.save(document.clone()).await;

    tracing::info!(
        document_id = %document.id,
        filename = %document.filename,
        file_size = document.file_size,
        "Document uploaded"
    );

    Ok((StatusCode::CREATED, ApiResponse::ok(document)))
}

/// GET /api/v1/documents/{id}
pub async fn get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Document>>, ApiError> {
    let document = state
        .documents
        .get(&id)
        .await
        .ok_or(ApiError::DocumentNotFound(id))?;
    Ok(ApiResponse::ok(document))
}
