use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis host backing the durable job queue and the shared cache
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    pub redis_password: Option<String>,

    /// Bound on the startup connection check; an unreachable broker falls back to in-process backends
    #[serde(default = "default_redis_connect_timeout_ms")]
    pub redis_connect_timeout_ms: u64,

    /// Worker tasks pulling from the durable queue. The fallback queue always runs one.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// How long finished job records are kept in Redis
    #[serde(default = "default_job_result_ttl_secs")]
    pub job_result_ttl_secs: u64,

    /// TTL applied to cached LLM responses
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,

    /// Hard per-attempt timeout on webhook HTTP calls
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    #[serde(default = "default_webhook_max_attempts")]
    pub webhook_max_attempts: u32,

    /// Size of the system-wide delivery history ring buffer
    #[serde(default = "default_webhook_history_size")]
    pub webhook_history_size: usize,

    /// OpenAI-compatible chat completions root (Groq by default)
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,

    pub llm_api_key: Option<String>,

    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    /// Directory uploaded documents are read from
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Request body limit for the HTTP layer
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_connect_timeout_ms() -> u64 {
    2000
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_job_result_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_sweep_interval_secs() -> u64 {
    5 * 60
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

fn default_webhook_max_attempts() -> u32 {
    3
}

fn default_webhook_history_size() -> usize {
    100
}

fn default_llm_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_llm_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_upload_dir() -> String {
    "./uploads".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        envy::from_env().map_err(ConfigError::Env)
    }

    /// Connection settings shared by the queue and cache startup connection checks.
    pub fn broker(&self) -> BrokerSettings {
        BrokerSettings {
            host: self.redis_host.clone(),
            port: self.redis_port,
            password: self.redis_password.clone(),
            connect_timeout: Duration::from_millis(self.redis_connect_timeout_ms),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_password: None,
            redis_connect_timeout_ms: default_redis_connect_timeout_ms(),
            worker_concurrency: default_worker_concurrency(),
            job_result_ttl_secs: default_job_result_ttl_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_sweep_interval_secs: default_cache_sweep_interval_secs(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
            webhook_max_attempts: default_webhook_max_attempts(),
            webhook_history_size: default_webhook_history_size(),
            llm_base_url: default_llm_base_url(),
            llm_api_key: None,
            llm_model: default_llm_model(),
            llm_timeout_secs: default_llm_timeout_secs(),
            upload_dir: default_upload_dir(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Where to find the durable broker and how long to wait for it at startup.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub connect_timeout: Duration,
}

impl BrokerSettings {
    /// Built field by field so passwords containing URL delimiters survive.
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                password: self.password.clone(),
                ..RedisConnectionInfo::default()
            },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment configuration: {0}")]
    Env(#[from] envy::Error),
}
