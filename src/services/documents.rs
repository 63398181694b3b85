use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

use crate::models::document::Document;

/// Document metadata store consulted by the executor to resolve job inputs.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn save(&self, document: Document);

    async fn get(&self, id: &str) -> Option<Document>;

    /// Apply `change` to the stored document. Returns the updated copy, or
    /// `None` if no document has that id.
    async fn update(
        &self,
        id: &str,
        change: Box<dyn for<'d> FnOnce(&'d mut Document) + Send + 'static>,
    ) -> Option<Document>;

    async fn delete(&self, id: &str) -> bool;

    async fn list(&self) -> Vec<Document>;
}

/// Volatile document store; contents are lost on restart.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<String, Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn save(&self, document: Document) {
        self.documents
            .write()
            .await
            .insert(document.id.clone(), document);
    }

    async fn get(&self, id: &str) -> Option<Document> {
        self.documents.read().await.get(id).cloned()
    }

    async fn update(
        &self,
        id: &str,
        change: Box<dyn for<'d> FnOnce(&'d mut Document) + Send + 'static>,
    ) -> Option<Document> {
        let mut documents = self.documents.write().await;
        let document = documents.get_mut(id)?;
        change(document);
        Some(document.clone())
    }

    async fn delete(&self, id: &str) -> bool {
        self.documents.write().await.remove(id).is_some()
    }

    async fn list(&self) -> Vec<Document> {
        let mut documents: Vec<Document> =
            self.documents.read().await.values().cloned().collect();
        documents.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        documents
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    pub word_count: usize,
    pub page_count: Option<u32>,
}

impl ExtractedText {
    pub fn from_text(text: String) -> Self {
        let word_count = text.split_whitespace().count();
        Self {
            text,
            word_count,
            page_count: None,
        }
    }
}

/// Pulls plain text out of an uploaded file, dispatched on its extension.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &Path, extension: &str) -> Result<ExtractedText, DocumentError>;
}

/// Handles plain text, Markdown and CSV uploads.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, path: &Path, extension: &str) -> Result<ExtractedText, DocumentError> {
        match extension {
            "txt" | "md" => {
                let text = tokio::fs::read_to_string(path).await?;
                Ok(ExtractedText::from_text(text))
            }
            "csv" => {
                let raw = tokio::fs::read_to_string(path).await?;
                Ok(ExtractedText::from_text(flatten_csv(&raw)))
            }
            other => Err(DocumentError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// One line per row, cells joined by " | ". Quoted cells may contain commas,
/// line breaks and doubled quotes.
fn flatten_csv(raw: &str) -> String {
    let mut rows: Vec<String> = Vec::new();
    let mut cells: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut chars = raw.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                chars.next();
                cell.push('"');
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => cells.push(std::mem::take(&mut cell).trim().to_string()),
            '\r' if !in_quotes => {}
            '\n' if !in_quotes => {
                cells.push(std::mem::take(&mut cell).trim().to_string());
                push_row(&mut rows, std::mem::take(&mut cells));
            }
            other => cell.push(other),
        }
    }
    cells.push(cell.trim().to_string());
    push_row(&mut rows, cells);
    rows.join("\n")
}

fn push_row(rows: &mut Vec<String>, cells: Vec<String>) {
    if cells.iter().any(|cell| !cell.is_empty()) {
        rows.push(cells.join(" | "));
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Unsupported document format: .{0}")]
    UnsupportedFormat(String),

    #[error("Failed to read document: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::document::DocumentStatus;

    #[tokio::test]
    async fn update_applies_change() {
        let store = InMemoryDocumentStore::new();
        store
            .save(Document::new("doc_1", "a.txt", "/tmp/a.txt", "text/plain", 3))
            .await;

        let updated = store
            .update(
                "doc_1",
                Box::new(|doc: &mut Document| doc.status = DocumentStatus::Processing),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, DocumentStatus::Processing);
        assert_eq!(
            store.get("doc_1").await.unwrap().status,
            DocumentStatus::Processing
        );
        assert!(store.update("missing", Box::new(|_: &mut Document| {})).await.is_none());
    }

    #[tokio::test]
    async fn delete_removes() {
        let store = InMemoryDocumentStore::new();
        store
            .save(Document::new("doc_1", "a.txt", "/tmp/a.txt", "text/plain", 3))
            .await;
        assert!(store.delete("doc_1").await);
        assert!(!store.delete("doc_1").await);
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn extracts_plain_text_with_word_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        tokio::fs::write(&path, "the quick  brown\nfox").await.unwrap();

        let extracted = PlainTextExtractor.extract(&path, "txt").await.unwrap();
        assert_eq!(extracted.word_count, 4);
        assert_eq!(extracted.text, "the quick  brown\nfox");
    }

    #[tokio::test]
    async fn flattens_csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.csv");
        tokio::fs::write(&path, "name,age\n\"Ada\",36\n\n").await.unwrap();

        let extracted = PlainTextExtractor.extract(&path, "csv").await.unwrap();
        assert_eq!(extracted.text, "name | age\nAda | 36");
    }

    #[test]
    fn quoted_cells_keep_commas_and_quotes() {
        let raw = "term,definition\r\n\"ATP\",\"energy, in \"\"currency\"\" form\"\n\"multi\nline\",x\n";
        assert_eq!(
            flatten_csv(raw),
            "term | definition\nATP | energy, in \"currency\" form\nmulti\nline | x"
        );
    }

    #[tokio::test]
    async fn rejects_unknown_extension() {
        let err = PlainTextExtractor
            .extract(Path::new("/tmp/x.pdf"), "pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, DocumentError::UnsupportedFormat(ext) if ext == "pdf"));
    }
}
