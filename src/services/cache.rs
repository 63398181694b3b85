use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::BrokerSettings;
use crate::services::broker;
use crate::services::llm::LlmResponse;

/// Every Redis key written by the cache lives under this namespace, so
/// `clear` never touches the job queue's keys.
const REDIS_NAMESPACE: &str = "docproc:cache:";

/// Hex characters of the SHA-256 digest kept in a generated key.
const KEY_HASH_LEN: usize = 16;

/// Floor for the sweep period; a zero period would stop the sweeper.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Expiry used when `now + ttl` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Key/value cache with per-entry expiry.
///
/// Backed by Redis when it answers at startup, otherwise by an in-process map.
/// The cache is an optimization only: `get` and `set` never fail, they log
/// and degrade to a miss.
pub struct CacheStore {
    backend: CacheBackend,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

enum CacheBackend {
    Redis(ConnectionManager),
    Memory(Arc<MemoryCache>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    Redis,
    InMemory,
}

impl Serialize for CacheBackendKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(match self {
            CacheBackendKind::Redis => "redis",
            CacheBackendKind::InMemory => "in_memory",
        })
    }
}

/// Point-in-time counters. Reset only by [`CacheStore::clear`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub backend: CacheBackendKind,
    pub hits: u64,
    pub misses: u64,
    /// Percentage, two decimals.
    pub hit_rate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<usize>,
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryCache {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if Instant::now() < entry.expires_at => {
                    return Some(entry.value.clone())
                }
                Some(_) => {}
            }
        }

        // Expired: evict lazily, re-checking in case a writer refreshed it meanwhile.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if Instant::now() < entry.expires_at {
                return Some(entry.value.clone());
            }
            entries.remove(key);
        }
        None
    }

    async fn set(&self, key: String, value: String, ttl: Duration) {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl).unwrap_or(now + FAR_FUTURE);
        self.entries
            .write()
            .await
            .insert(key, MemoryEntry { value, expires_at });
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now < entry.expires_at);
        before - entries.len()
    }
}

impl CacheStore {
    /// Try Redis once; fall back to the in-process map on any failure.
    pub async fn connect(settings: &BrokerSettings, sweep_interval: Duration) -> Self {
        match broker::connect(settings).await {
            Ok(conn) => {
                tracing::info!(host = %settings.host, port = settings.port, "Cache initialized with Redis");
                Self::with_backend(CacheBackend::Redis(conn))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis not available, using in-memory cache");
                Self::in_memory(sweep_interval)
            }
        }
    }

    /// In-process cache with a background sweep of expired entries.
    pub fn in_memory(sweep_interval: Duration) -> Self {
        if sweep_interval < MIN_SWEEP_INTERVAL {
            tracing::warn!(
                requested_ms = sweep_interval.as_millis() as u64,
                "Cache sweep interval too small, using 1s"
            );
        }
        let sweep_interval = sweep_interval.max(MIN_SWEEP_INTERVAL);
        let memory = Arc::new(MemoryCache::default());
        let sweeper = spawn_sweeper(Arc::downgrade(&memory), sweep_interval);
        Self {
            backend: CacheBackend::Memory(memory),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    fn with_backend(backend: CacheBackend) -> Self {
        Self {
            backend,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    pub fn backend_kind(&self) -> CacheBackendKind {
        match self.backend {
            CacheBackend::Redis(_) => CacheBackendKind::Redis,
            CacheBackend::Memory(_) => CacheBackendKind::InMemory,
        }
    }

    /// `prefix:` followed by the first 16 hex chars of SHA-256(content).
    pub fn generate_key(prefix: &str, content: &str) -> String {
        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        format!("{}:{}", prefix, &digest[..KEY_HASH_LEN])
    }

    /// Look up a value. Absent, expired, unreadable and backend errors are all misses.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match &self.backend {
            CacheBackend::Memory(memory) => memory.get(key).await,
            CacheBackend::Redis(conn) => {
                let mut conn = conn.clone();
                match conn.get::<_, Option<String>>(redis_key(key)).await {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::error!(key, error = %e, "Cache get error");
                        None
                    }
                }
            }
        };

        let value = raw.and_then(|raw| match serde_json::from_str::<T>(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding unreadable cache entry");
                None
            }
        });

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("cache_hits_total").increment(1);
            tracing::debug!(key, "Cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("cache_misses_total").increment(1);
            tracing::debug!(key, "Cache miss");
        }
        value
    }

    /// Store a value, overwriting any previous one. Errors are logged and swallowed.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(key, error = %e, "Cache value not serializable");
                return;
            }
        };

        match &self.backend {
            CacheBackend::Memory(memory) => {
                memory
                    .set(key.to_string(), raw, Duration::from_secs(ttl_secs))
                    .await;
            }
            CacheBackend::Redis(conn) => {
                let mut conn = conn.clone();
                // SETEX rejects 0; an already-expired entry is simply absent.
                let result = if ttl_secs == 0 {
                    conn.del::<_, ()>(redis_key(key)).await
                } else {
                    conn.set_ex::<_, _, ()>(redis_key(key), raw, ttl_secs).await
                };
                if let Err(e) = result {
                    tracing::error!(key, error = %e, "Cache set error");
                    return;
                }
            }
        }
        tracing::debug!(key, ttl_secs, "Cache set");
    }

    pub async fn delete(&self, key: &str) {
        match &self.backend {
            CacheBackend::Memory(memory) => {
                memory.entries.write().await.remove(key);
            }
            CacheBackend::Redis(conn) => {
                let mut conn = conn.clone();
                if let Err(e) = conn.del::<_, ()>(redis_key(key)).await {
                    tracing::error!(key, error = %e, "Cache delete error");
                }
            }
        }
    }

    /// Delete every key matching a glob (`*` and `?` wildcards). Returns how many were removed.
    pub async fn delete_pattern(&self, pattern: &str) -> usize {
        let removed = match &self.backend {
            CacheBackend::Memory(memory) => {
                let matcher = match glob_to_regex(pattern) {
                    Ok(matcher) => matcher,
                    Err(e) => {
                        tracing::error!(pattern, error = %e, "Invalid cache pattern");
                        return 0;
                    }
                };
                let mut entries = memory.entries.write().await;
                let before = entries.len();
                entries.retain(|key, _| !matcher.is_match(key));
                before - entries.len()
            }
            CacheBackend::Redis(conn) => match redis_delete_matching(conn, pattern).await {
                Ok(removed) => removed,
                Err(e) => {
                    tracing::error!(pattern, error = %e, "Cache pattern delete error");
                    0
                }
            },
        };
        tracing::debug!(pattern, count = removed, "Cache pattern deleted");
        removed
    }

    /// Drop every entry and reset the hit/miss counters.
    pub async fn clear(&self) {
        match &self.backend {
            CacheBackend::Memory(memory) => memory.entries.write().await.clear(),
            CacheBackend::Redis(conn) => {
                if let Err(e) = redis_delete_matching(conn, "*").await {
                    tracing::error!(error = %e, "Cache clear error");
                }
            }
        }
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        tracing::info!("Cache cleared");
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        let entries = match &self.backend {
            CacheBackend::Memory(memory) => Some(memory.entries.read().await.len()),
            CacheBackend::Redis(_) => None,
        };
        CacheStats {
            backend: self.backend_kind(),
            hits,
            misses,
            hit_rate,
            entries,
        }
    }

    pub async fn cached_llm_response(&self, system_prompt: &str, user_prompt: &str) -> Option<LlmResponse> {
        self.get(&llm_key(system_prompt, user_prompt)).await
    }

    pub async fn store_llm_response(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        response: &LlmResponse,
        ttl_secs: u64,
    ) {
        self.set(&llm_key(system_prompt, user_prompt), response, ttl_secs)
            .await;
    }

    /// Stop the sweeper. In-memory entries are dropped with the store.
    pub async fn close(&self) {
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
        tracing::info!("Cache closed");
    }
}

fn llm_key(system_prompt: &str, user_prompt: &str) -> String {
    CacheStore::generate_key("llm", &format!("{}|{}", system_prompt, user_prompt))
}

fn redis_key(key: &str) -> String {
    format!("{}{}", REDIS_NAMESPACE, key)
}

fn glob_to_regex(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 2);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    regex::Regex::new(&expr)
}

async fn redis_delete_matching(
    conn: &ConnectionManager,
    pattern: &str,
) -> Result<usize, redis::RedisError> {
    let mut conn = conn.clone();
    let mut keys: Vec<String> = Vec::new();
    {
        let mut iter = conn
            .scan_match::<_, String>(redis_key(pattern))
            .await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
    }
    if keys.is_empty() {
        return Ok(0);
    }
    conn.del::<_, ()>(&keys).await?;
    Ok(keys.len())
}

fn spawn_sweeper(memory: Weak<MemoryCache>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(memory) = memory.upgrade() else {
                break;
            };
            let removed = memory.purge_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "Cleaned up expired cache entries");
            }
        }
    })
}
