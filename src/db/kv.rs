use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::ApiError;

/// Abstraction over a key-value store used for tokens and auth codes.
///
/// Backed by Redis in production and an in-memory map in tests. A `ttl` of
/// `None` means the entry never expires on its own.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<(), ApiError>;
    async fn get(&self, key: &str) -> Result<Option<String>, ApiError>;
    /// Atomically fetch and delete, for single-use records.
    async fn get_del(&self, key: &str) -> Result<Option<String>, ApiError>;
    async fn del(&self, key: &str) -> Result<(), ApiError>;
    /// Delete every key with the given prefix, returning how many were
    /// removed.
    async fn del_prefix(&self, prefix: &str) -> Result<u64, ApiError>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        tracing::info!("redis connection manager created");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(secs) => conn.set_ex::<_, _, ()>(key, value, secs).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, ApiError> {
        let mut conn = self.conn.clone();
        Ok(conn.get_del::<_, Option<String>>(key).await?)
    }

    async fn del(&self, key: &str) -> Result<(), ApiError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> Result<u64, ApiError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                deleted += keys.len() as u64;
                conn.del::<_, ()>(keys).await?;
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (for tests)
// ---------------------------------------------------------------------------

pub struct MemoryStore {
    data: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn live(entry: &(String, Option<Instant>)) -> Option<String> {
    match entry.1 {
        Some(deadline) if deadline <= Instant::now() => None,
        _ => Some(entry.0.clone()),
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<u64>) -> Result<(), ApiError> {
        let deadline = ttl.map(|secs| Instant::now() + Duration::from_secs(secs));
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        Ok(self.data.lock().unwrap().get(key).and_then(live))
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, ApiError> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .remove(key)
            .and_then(|entry| live(&entry)))
    }

    async fn del(&self, key: &str) -> Result<(), ApiError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> Result<u64, ApiError> {
        let mut data = self.data.lock().unwrap();
        let before = data.len();
        data.retain(|key, _| !key.starts_with(prefix));
        Ok((before - data.len()) as u64)
    }
}
