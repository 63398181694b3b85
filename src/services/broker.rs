use redis::aio::ConnectionManager;
use std::time::Duration;

use crate::config::BrokerSettings;

/// Open a managed Redis connection and confirm it answers PING, all within
/// the configured connect timeout.
///
/// Called once per service at startup. Any error here means the caller runs
/// on its in-process backend for the rest of the process lifetime.
pub async fn connect(settings: &BrokerSettings) -> Result<ConnectionManager, BrokerError> {
    let attempt = async {
        let client = redis::Client::open(settings.connection_info())?;
        let mut conn = ConnectionManager::new(client).await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok::<_, BrokerError>(conn)
    };

    match tokio::time::timeout(settings.connect_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout(settings.connect_timeout)),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Timed out after {0:?} connecting to Redis")]
    Timeout(Duration),
}
