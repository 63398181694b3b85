pub mod broker;
pub mod cache;
pub mod documents;
pub mod executor;
pub mod llm;
pub mod queue;
pub mod webhooks;
