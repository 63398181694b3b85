use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

use crate::models::document::{Document, DocumentStatus};
use crate::models::job::{
    FlashcardOptions, JobId, JobPayload, JobResult, QuizOptions, SummaryOptions,
};
use crate::models::webhook::WebhookEvent;
use crate::services::cache::CacheStore;
use crate::services::documents::{DocumentError, DocumentStore, ExtractedText, TextExtractor};
use crate::services::llm::{GenerateOptions, LlmClient, LlmError, LlmResponse};
use crate::services::webhooks::WebhookService;

/// Runs one job and reports its outcome as a [`JobResult`]. Implementations
/// turn every failure into a failed result rather than an `Err`.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job_id: JobId, payload: &JobPayload) -> JobResult;
}

/// Executes document extraction and the three LLM generation jobs.
pub struct DocumentJobExecutor {
    documents: Arc<dyn DocumentStore>,
    extractor: Arc<dyn TextExtractor>,
    llm: Arc<dyn LlmClient>,
    cache: Arc<CacheStore>,
    webhooks: Arc<WebhookService>,
    cache_ttl_secs: u64,
}

impl DocumentJobExecutor {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        extractor: Arc<dyn TextExtractor>,
        llm: Arc<dyn LlmClient>,
        cache: Arc<CacheStore>,
        webhooks: Arc<WebhookService>,
        cache_ttl_secs: u64,
    ) -> Self {
        Self {
            documents,
            extractor,
            llm,
            cache,
            webhooks,
            cache_ttl_secs,
        }
    }

    async fn extract_document(&self, document_id: &str) -> Result<Value, JobError> {
        match self.extract_document_inner(document_id).await {
            Ok(extracted) => {
                tracing::info!(
                    document_id,
                    word_count = extracted.word_count,
                    page_count = ?extracted.page_count,
                    "Document processed successfully"
                );
                self.webhooks
                    .trigger(
                        WebhookEvent::DocumentProcessed,
                        json!({
                            "documentId": document_id,
                            "wordCount": extracted.word_count,
                            "pageCount": extracted.page_count,
                            "status": "completed",
                        }),
                    )
                    .await;
                Ok(json!({
                    "documentId": document_id,
                    "text": extracted.text,
                    "wordCount": extracted.word_count,
                    "pageCount": extracted.page_count,
                }))
            }
            Err(e) => {
                tracing::error!(document_id, error = %e, "Document processing failed");
                let message = e.to_string();
                let recorded = message.clone();
                self.documents
                    .update(
                        document_id,
                        Box::new(move |doc: &mut Document| {
                            doc.status = DocumentStatus::Failed;
                            doc.extraction_error = Some(recorded);
                        }),
                    )
                    .await;
                self.webhooks
                    .trigger(
                        WebhookEvent::DocumentFailed,
                        json!({
                            "documentId": document_id,
                            "error": message,
                            "status": "failed",
                        }),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn extract_document_inner(&self, document_id: &str) -> Result<ExtractedText, JobError> {
        let document = self
            .documents
            .get(document_id)
            .await
            .ok_or_else(|| JobError::DocumentNotFound(document_id.to_string()))?;

        tracing::info!(document_id, file_path = %document.file_path, "Processing document");
        self.documents
            .update(
                document_id,
                Box::new(|doc: &mut Document| doc.status = DocumentStatus::Processing),
            )
            .await;

        let extracted = self
            .extractor
            .extract(Path::new(&document.file_path), &document.extension)
            .await?;

        let stored = extracted.clone();
        self.documents
            .update(
                document_id,
                Box::new(move |doc: &mut Document| {
                    doc.status = DocumentStatus::Completed;
                    doc.page_count = stored.page_count.or(doc.page_count);
                    doc.word_count = Some(stored.word_count);
                    doc.extracted_text = Some(stored.text);
                    doc.extracted_at = Some(Utc::now());
                    doc.extraction_error = None;
                }),
            )
            .await;

        Ok(extracted)
    }

    async fn generate_summary(
        &self,
        document_id: &str,
        options: &SummaryOptions,
    ) -> Result<Value, JobError> {
        let text = self.processed_text(document_id).await?;
        tracing::info!(
            document_id,
            detail_level = %options.detail_level,
            max_tokens = options.max_tokens,
            "Generating summary"
        );

        let system_prompt = format!(
            "You are an expert summarizer. Create a {} summary of the provided document. \
             Respond with JSON of the form {{\"summary\": string, \"keyPoints\": string[]}}.",
            options.detail_level
        );
        let user_prompt = format!(
            "Please provide a {} summary of the following document:\n\n{}",
            options.detail_level, text
        );
        let (response, cached) = self
            .complete(
                &system_prompt,
                &user_prompt,
                GenerateOptions {
                    max_tokens: options.max_tokens,
                    temperature: 0.3,
                },
            )
            .await?;
        if !cached {
            self.remember(&system_prompt, &user_prompt, &response).await;
        }

        // Free text is still a useful summary, so a parse failure degrades
        // to the raw content instead of failing the job.
        let (summary, key_points, structured) = match parse_summary(&response.content) {
            Some((summary, key_points)) => (summary, key_points, true),
            None => {
                tracing::warn!(document_id, "Summary was not structured, returning raw text");
                (response.content.trim().to_string(), Vec::new(), false)
            }
        };

        self.webhooks
            .trigger(
                WebhookEvent::SummaryGenerated,
                json!({ "documentId": document_id, "detailLevel": options.detail_level }),
            )
            .await;

        Ok(json!({
            "documentId": document_id,
            "summary": summary,
            "keyPoints": key_points,
            "detailLevel": options.detail_level,
            "structured": structured,
            "usage": response.usage,
        }))
    }

    async fn generate_quiz(&self, document_id: &str, options: &QuizOptions) -> Result<Value, JobError> {
        let text = self.processed_text(document_id).await?;
        tracing::info!(
            document_id,
            question_count = options.question_count,
            difficulty = %options.difficulty,
            "Generating quiz"
        );

        let system_prompt = "You are an expert educational content creator. Generate a quiz based on \
             the provided document. Respond with a JSON array only, where each element has \
             \"question\", \"type\", \"options\", \"answer\" and \"explanation\".";
        let user_prompt = format!(
            "Generate a quiz with {} questions of {} difficulty.\nQuestion types: {}\n\nDocument content:\n{}",
            options.question_count,
            options.difficulty,
            options.question_types.join(", "),
            text
        );
        let (response, cached) = self
            .complete(
                system_prompt,
                &user_prompt,
                GenerateOptions {
                    max_tokens: 2000,
                    temperature: 0.5,
                },
            )
            .await?;

        let questions = parse_items(&response.content, &["questions", "quiz"]).ok_or(
            JobError::UnparseableOutput {
                kind: "quiz",
                reason: "expected a JSON array of questions".to_string(),
            },
        )?;
        if !cached {
            self.remember(system_prompt, &user_prompt, &response).await;
        }

        self.webhooks
            .trigger(
                WebhookEvent::QuizGenerated,
                json!({ "documentId": document_id, "questionCount": questions.len() }),
            )
            .await;

        Ok(json!({
            "documentId": document_id,
            "quiz": questions,
            "questionCount": options.question_count,
            "difficulty": options.difficulty,
            "questionTypes": options.question_types,
            "usage": response.usage,
        }))
    }

    async fn generate_flashcards(
        &self,
        document_id: &str,
        options: &FlashcardOptions,
    ) -> Result<Value, JobError> {
        let text = self.processed_text(document_id).await?;
        tracing::info!(
            document_id,
            card_count = options.card_count,
            focus_areas = ?options.focus_areas,
            "Generating flashcards"
        );

        let system_prompt = "You are an expert educational content creator. Generate flashcards \
             based on the provided document. Respond with a JSON array only, where each element \
             has \"front\" and \"back\".";
        let user_prompt = format!(
            "Generate {} flashcards focusing on: {}\n\nDocument content:\n{}",
            options.card_count,
            options.focus_areas.join(", "),
            text
        );
        let (response, cached) = self
            .complete(
                system_prompt,
                &user_prompt,
                GenerateOptions {
                    max_tokens: 2000,
                    temperature: 0.5,
                },
            )
            .await?;

        let cards = parse_items(&response.content, &["flashcards", "cards"]).ok_or(
            JobError::UnparseableOutput {
                kind: "flashcards",
                reason: "expected a JSON array of cards".to_string(),
            },
        )?;
        if !cached {
            self.remember(system_prompt, &user_prompt, &response).await;
        }

        self.webhooks
            .trigger(
                WebhookEvent::FlashcardsGenerated,
                json!({ "documentId": document_id, "cardCount": cards.len() }),
            )
            .await;

        Ok(json!({
            "documentId": document_id,
            "flashcards": cards,
            "cardCount": options.card_count,
            "focusAreas": options.focus_areas,
            "usage": response.usage,
        }))
    }

    async fn processed_text(&self, document_id: &str) -> Result<String, JobError> {
        self.documents
            .get(document_id)
            .await
            .and_then(|doc| doc.usable_text().map(str::to_string))
            .ok_or_else(|| JobError::DocumentNotProcessed(document_id.to_string()))
    }

    /// Returns the response and whether it came from the cache.
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: GenerateOptions,
    ) -> Result<(LlmResponse, bool), JobError> {
        if let Some(cached) = self.cache.cached_llm_response(system_prompt, user_prompt).await {
            tracing::debug!("Using cached LLM response");
            return Ok((cached, true));
        }
        let response = self.llm.generate_text(system_prompt, user_prompt, options).await?;
        Ok((response, false))
    }

    async fn remember(&self, system_prompt: &str, user_prompt: &str, response: &LlmResponse) {
        self.cache
            .store_llm_response(system_prompt, user_prompt, response, self.cache_ttl_secs)
            .await;
    }
}

#[async_trait]
impl JobExecutor for DocumentJobExecutor {
    async fn execute(&self, job_id: JobId, payload: &JobPayload) -> JobResult {
        let document_id = payload.document_id();
        tracing::info!(%job_id, job_type = %payload.job_type(), document_id, "Executing job");

        let outcome = match payload {
            JobPayload::ExtractDocument { document_id } => self.extract_document(document_id).await,
            JobPayload::GenerateSummary {
                document_id,
                options,
            } => self.generate_summary(document_id, options).await,
            JobPayload::GenerateQuiz {
                document_id,
                options,
            } => self.generate_quiz(document_id, options).await,
            JobPayload::GenerateFlashcards {
                document_id,
                options,
            } => self.generate_flashcards(document_id, options).await,
        };

        match outcome {
            Ok(data) => JobResult::success(data),
            Err(e) => {
                tracing::error!(%job_id, document_id, error = %e, "Job processing failed");
                JobResult::failure(e.to_string())
            }
        }
    }
}

/// Drop a surrounding Markdown code fence (```json ... ```), if any.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn parse_summary(content: &str) -> Option<(String, Vec<String>)> {
    let value: Value = serde_json::from_str(strip_code_fence(content)).ok()?;
    let summary = value.get("summary")?.as_str()?.trim().to_string();
    if summary.is_empty() {
        return None;
    }
    let key_points = value
        .get("keyPoints")
        .and_then(Value::as_array)
        .map(|points| {
            points
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some((summary, key_points))
}

/// Accepts a bare non-empty array, or an object wrapping one under any of `keys`.
fn parse_items(content: &str, keys: &[&str]) -> Option<Vec<Value>> {
    let value: Value = serde_json::from_str(strip_code_fence(content)).ok()?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => keys
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })?,
        _ => return None,
    };
    (!items.is_empty()).then_some(items)
}

/// Why a job failed. Rendered into `JobResult::error`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Document not found or not processed: {0}")]
    DocumentNotProcessed(String),

    #[error("Text extraction failed: {0}")]
    Extraction(#[from] DocumentError),

    #[error("LLM request failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Could not parse generated {kind}: {reason}")]
    UnparseableOutput { kind: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::document::Document;
    use crate::services::documents::{InMemoryDocumentStore, PlainTextExtractor};
    use crate::services::webhooks::WebhookSettings;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    /// Replays canned responses in order and counts calls.
    struct ScriptedLlm {
        responses: Mutex<VecDeque<Result<String, LlmError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn generate_text(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _options: GenerateOptions,
        ) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(LlmError::EmptyResponse));
            next.map(|content| LlmResponse {
                content,
                usage: None,
            })
        }
    }

    struct Fixture {
        executor: DocumentJobExecutor,
        documents: Arc<InMemoryDocumentStore>,
        llm: Arc<ScriptedLlm>,
    }

    async fn fixture(responses: Vec<Result<String, LlmError>>) -> Fixture {
        let documents = Arc::new(InMemoryDocumentStore::new());
        let mut processed = Document::new("doc_ready", "notes.txt", "/tmp/notes.txt", "text/plain", 40);
        processed.status = DocumentStatus::Completed;
        processed.extracted_text = Some("Photosynthesis converts light into chemical energy.".to_string());
        documents.save(processed).await;
        documents
            .save(Document::new("doc_raw", "raw.txt", "/tmp/raw.txt", "text/plain", 10))
            .await;

        let llm = ScriptedLlm::new(responses);
        let executor = DocumentJobExecutor::new(
            documents.clone(),
            Arc::new(PlainTextExtractor),
            llm.clone(),
            Arc::new(CacheStore::in_memory(Duration::from_secs(300))),
            Arc::new(WebhookService::new(WebhookSettings::default()).unwrap()),
            3600,
        );
        Fixture {
            executor,
            documents,
            llm,
        }
    }

    fn summary(document_id: &str) -> JobPayload {
        JobPayload::GenerateSummary {
            document_id: document_id.to_string(),
            options: SummaryOptions::default(),
        }
    }

    fn quiz() -> JobPayload {
        JobPayload::GenerateQuiz {
            document_id: "doc_ready".to_string(),
            options: QuizOptions::default(),
        }
    }

    #[test]
    fn strips_code_fences() {
        assert_eq!(strip_code_fence("```json\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_code_fence("```\n{}\n```  "), "{}");
        assert_eq!(strip_code_fence("  [1]  "), "[1]");
    }

    #[test]
    fn parse_items_accepts_wrapped_arrays() {
        let wrapped = r#"{"questions": [{"question": "Q1"}]}"#;
        assert_eq!(parse_items(wrapped, &["questions"]).unwrap().len(), 1);
        assert!(parse_items(r#"{"other": [1]}"#, &["questions"]).is_none());
        assert!(parse_items("[]", &["questions"]).is_none());
        assert!(parse_items("Here are your questions!", &["questions"]).is_none());
    }

    #[tokio::test]
    async fn extraction_of_missing_document_fails() {
        let fx = fixture(vec![]).await;
        let result = fx
            .executor
            .execute(
                Uuid::new_v4(),
                &JobPayload::ExtractDocument {
                    document_id: "doc_missing".to_string(),
                },
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Document not found: doc_missing"));
    }

    #[tokio::test]
    async fn extraction_updates_document() {
        let fx = fixture(vec![]).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lecture.txt");
        tokio::fs::write(&path, "cells divide by mitosis").await.unwrap();
        fx.documents
            .save(Document::new(
                "doc_file",
                "lecture.txt",
                path.to_string_lossy(),
                "text/plain",
                23,
            ))
            .await;

        let result = fx
            .executor
            .execute(
                Uuid::new_v4(),
                &JobPayload::ExtractDocument {
                    document_id: "doc_file".to_string(),
                },
            )
            .await;

        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.data.unwrap()["wordCount"], 4);
        let stored = fx.documents.get("doc_file").await.unwrap();
        assert_eq!(stored.status, DocumentStatus::Completed);
        assert_eq!(stored.extracted_text.as_deref(), Some("cells divide by mitosis"));
        assert!(stored.extracted_at.is_some());
    }

    #[tokio::test]
    async fn failed_extraction_marks_document_failed() {
        let fx = fixture(vec![]).await;
        fx.documents
            .save(Document::new("doc_pdf", "scan.pdf", "/tmp/scan.pdf", "application/pdf", 5))
            .await;

        let result = fx
            .executor
            .execute(
                Uuid::new_v4(),
                &JobPayload::ExtractDocument {
                    document_id: "doc_pdf".to_string(),
                },
            )
            .await;

        assert!(!result.success);
        let stored = fx.documents.get("doc_pdf").await.unwrap();
        assert_eq!(stored.status, DocumentStatus::Failed);
        assert!(stored.extraction_error.unwrap().contains("Unsupported"));
    }

    #[tokio::test]
    async fn generation_requires_extracted_text() {
        let fx = fixture(vec![]).await;
        let result = fx.executor.execute(Uuid::new_v4(), &summary("doc_raw")).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not processed"));
        assert_eq!(fx.llm.calls(), 0);
    }

    #[tokio::test]
    async fn plain_text_summary_degrades_gracefully() {
        let fx = fixture(vec![Ok("Plants turn light into sugar.".to_string())]).await;
        let result = fx.executor.execute(Uuid::new_v4(), &summary("doc_ready")).await;

        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["summary"], "Plants turn light into sugar.");
        assert_eq!(data["structured"], false);
        assert_eq!(data["detailLevel"], "brief");
    }

    #[tokio::test]
    async fn structured_summary_is_parsed() {
        let fx = fixture(vec![Ok(
            "```json\n{\"summary\": \"Light to energy.\", \"keyPoints\": [\"chlorophyll\"]}\n```"
                .to_string(),
        )])
        .await;
        let result = fx.executor.execute(Uuid::new_v4(), &summary("doc_ready")).await;

        let data = result.data.unwrap();
        assert_eq!(data["summary"], "Light to energy.");
        assert_eq!(data["keyPoints"], json!(["chlorophyll"]));
        assert_eq!(data["structured"], true);
    }

    #[tokio::test]
    async fn repeated_prompt_is_served_from_cache() {
        let fx = fixture(vec![Ok("First answer.".to_string())]).await;
        let first = fx.executor.execute(Uuid::new_v4(), &summary("doc_ready")).await;
        let second = fx.executor.execute(Uuid::new_v4(), &summary("doc_ready")).await;

        assert!(first.success && second.success);
        assert_eq!(second.data.unwrap()["summary"], "First answer.");
        assert_eq!(fx.llm.calls(), 1);
    }

    #[tokio::test]
    async fn unparseable_quiz_fails_and_is_not_cached() {
        let fx = fixture(vec![
            Ok("Sure! Question 1: what is light?".to_string()),
            Ok(r#"[{"question": "What does photosynthesis produce?", "answer": "glucose"}]"#.to_string()),
        ])
        .await;

        let first = fx.executor.execute(Uuid::new_v4(), &quiz()).await;
        assert!(!first.success);
        assert!(first.error.unwrap().contains("Could not parse generated quiz"));

        let second = fx.executor.execute(Uuid::new_v4(), &quiz()).await;
        assert!(second.success);
        assert_eq!(second.data.unwrap()["quiz"].as_array().unwrap().len(), 1);
        assert_eq!(fx.llm.calls(), 2);
    }

    #[tokio::test]
    async fn flashcards_accept_wrapped_object() {
        let fx = fixture(vec![Ok(
            r#"{"cards": [{"front": "ATP", "back": "energy currency"}, {"front": "NADPH", "back": "reducer"}]}"#
                .to_string(),
        )])
        .await;
        let result = fx
            .executor
            .execute(
                Uuid::new_v4(),
                &JobPayload::GenerateFlashcards {
                    document_id: "doc_ready".to_string(),
                    options: FlashcardOptions::default(),
                },
            )
            .await;

        let data = result.data.unwrap();
        assert_eq!(data["flashcards"].as_array().unwrap().len(), 2);
        assert_eq!(data["cardCount"], 15);
    }

    #[tokio::test]
    async fn llm_errors_become_failed_results() {
        let fx = fixture(vec![Err(LlmError::Provider {
            status: 503,
            detail: "overloaded".to_string(),
        })])
        .await;
        let result = fx.executor.execute(Uuid::new_v4(), &summary("doc_ready")).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("503"));
    }
}
