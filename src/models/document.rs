use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

/// Metadata for an uploaded document plus its extraction results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub filename: String,
    pub file_path: String,
    pub mime_type: String,
    /// Lowercase, without the leading dot
    pub extension: String,
    pub file_size: u64,
    pub status: DocumentStatus,
    pub uploaded_at: DateTime<Utc>,
    pub extracted_text: Option<String>,
    pub word_count: Option<usize>,
    pub page_count: Option<u32>,
    pub extracted_at: Option<DateTime<Utc>>,
    pub extraction_error: Option<String>,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        filename: impl Into<String>,
        file_path: impl Into<String>,
        mime_type: impl Into<String>,
        file_size: u64,
    ) -> Self {
        let filename = filename.into();
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        Self {
            id: id.into(),
            filename,
            file_path: file_path.into(),
            mime_type: mime_type.into(),
            extension,
            file_size,
            status: DocumentStatus::Uploaded,
            uploaded_at: Utc::now(),
            extracted_text: None,
            word_count: None,
            page_count: None,
            extracted_at: None,
            extraction_error: None,
        }
    }

    /// Text usable by generation jobs, if extraction has completed.
    pub fn usable_text(&self) -> Option<&str> {
        self.extracted_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
    }
}
