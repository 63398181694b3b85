use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use uuid::Uuid;

pub type JobId = Uuid;

/// The closed set of job kinds the executor knows how to run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
    ExtractDocument,
    GenerateSummary,
    GenerateQuiz,
    GenerateFlashcards,
}

/// Lifecycle of a job. Transitions only move forward:
/// waiting -> active -> completed | failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    /// Returned for ids this backend never issued. Never stored on a job.
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Waiting, JobStatus::Active)
                | (JobStatus::Active, JobStatus::Completed)
                | (JobStatus::Active, JobStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DetailLevel {
    #[default]
    Brief,
    Standard,
    Detailed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SummaryOptions {
    pub detail_level: DetailLevel,
    pub max_tokens: u32,
}

impl Default for SummaryOptions {
    fn default() -> Self {
        Self {
            detail_level: DetailLevel::Brief,
            max_tokens: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct QuizOptions {
    pub question_count: u32,
    pub difficulty: Difficulty,
    pub question_types: Vec<String>,
}

impl Default for QuizOptions {
    fn default() -> Self {
        Self {
            question_count: 10,
            difficulty: Difficulty::Medium,
            question_types: vec!["multiple-choice".to_string(), "true-false".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FlashcardOptions {
    pub card_count: u32,
    pub focus_areas: Vec<String>,
}

impl Default for FlashcardOptions {
    fn default() -> Self {
        Self {
            card_count: 15,
            focus_areas: vec![
                "key-terms".to_string(),
                "concepts".to_string(),
                "facts".to_string(),
            ],
        }
    }
}

/// Typed input for each job kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    #[serde(rename_all = "camelCase")]
    ExtractDocument { document_id: String },
    #[serde(rename_all = "camelCase")]
    GenerateSummary {
        document_id: String,
        #[serde(default)]
        options: SummaryOptions,
    },
    #[serde(rename_all = "camelCase")]
    GenerateQuiz {
        document_id: String,
        #[serde(default)]
        options: QuizOptions,
    },
    #[serde(rename_all = "camelCase")]
    GenerateFlashcards {
        document_id: String,
        #[serde(default)]
        options: FlashcardOptions,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::ExtractDocument { .. } => JobType::ExtractDocument,
            JobPayload::GenerateSummary { .. } => JobType::GenerateSummary,
            JobPayload::GenerateQuiz { .. } => JobType::GenerateQuiz,
            JobPayload::GenerateFlashcards { .. } => JobType::GenerateFlashcards,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            JobPayload::ExtractDocument { document_id }
            | JobPayload::GenerateSummary { document_id, .. }
            | JobPayload::GenerateQuiz { document_id, .. }
            | JobPayload::GenerateFlashcards { document_id, .. } => document_id,
        }
    }
}

/// Uniform outcome envelope produced by the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    pub fn success(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// A queued unit of work, owned by the job queue for its whole lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: payload.job_type(),
            payload,
            status: JobStatus::Waiting,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `active`. Returns false if the job already left `waiting`.
    pub fn start(&mut self) -> bool {
        if !self.status.can_transition_to(JobStatus::Active) {
            return false;
        }
        self.status = JobStatus::Active;
        self.started_at = Some(Utc::now());
        true
    }

    /// Record the executor outcome and move to `completed` or `failed`.
    pub fn finish(&mut self, result: JobResult) -> bool {
        let next = if result.success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        true
    }
}
