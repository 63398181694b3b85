//! Document Processing Agent
//!
//! Asynchronous job execution and event delivery for a document-processing
//! backend: a job queue that runs over Redis or an in-process fallback, an
//! executor for text extraction and LLM generation jobs, a TTL cache for LLM
//! responses, and a signed webhook dispatcher with bounded retries.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
