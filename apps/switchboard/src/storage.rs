use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Streaming,
    Complete,
    Failed,
}

/// Persisted snapshot of one agent turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: String,
    pub thread_id: String,
    pub content: String,
    pub state: TurnState,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TurnRecord {
    pub fn new(turn_id: String, thread_id: String) -> Self {
        let now = Utc::now();
        Self {
            turn_id,
            thread_id,
            content: String::new(),
            state: TurnState::Streaming,
            title: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Persistence seam for turns. The relay writes through this trait so tests
/// can count and inspect writes without a Redis instance.
#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn get_turn(&self, turn_id: &str) -> Result<Option<TurnRecord>>;
    async fn save_turn(&self, record: &TurnRecord) -> Result<()>;
    /// The turn currently receiving content for a thread, if any.
    async fn get_active_turn(&self, thread_id: &str) -> Result<Option<String>>;
    async fn set_active_turn(&self, thread_id: &str, turn_id: &str) -> Result<()>;
    async fn clear_active_turn(&self, thread_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct RedisTurnStore {
    redis: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisTurnStore {
    pub async fn new(redis_url: &str, ttl_seconds: u64) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;

        Ok(Self { redis, ttl_seconds })
    }
}

#[async_trait]
impl TurnStore for RedisTurnStore {
    async fn get_turn(&self, turn_id: &str) -> Result<Option<TurnRecord>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(turn_key(turn_id)).await?;

        match value {
            Some(json) => {
                let record = serde_json::from_str(&json)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn save_turn(&self, record: &TurnRecord) -> Result<()> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(record)?;
        conn.set_ex::<_, _, ()>(turn_key(&record.turn_id), value, self.ttl_seconds)
            .await?;
        Ok(())
    }

    async fn get_active_turn(&self, thread_id: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(active_turn_key(thread_id)).await?;
        Ok(value)
    }

    async fn set_active_turn(&self, thread_id: &str, turn_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(active_turn_key(thread_id), turn_id, self.ttl_seconds)
            .await?;
        Ok(())
    }

    async fn clear_active_turn(&self, thread_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(active_turn_key(thread_id)).await?;
        Ok(())
    }
}

fn turn_key(turn_id: &str) -> String {
    format!("turn:{}", turn_id)
}

fn active_turn_key(thread_id: &str) -> String {
    format!("thread:{}:active_turn", thread_id)
}

/// In-memory store for tests. Counts successful `save_turn` calls so
/// throttling behavior can be asserted, and can be told to fail the next N
/// saves to exercise flush-retry paths.
#[derive(Default)]
pub struct MemoryTurnStore {
    turns: Mutex<HashMap<String, TurnRecord>>,
    active: Mutex<HashMap<String, String>>,
    save_count: AtomicUsize,
    save_failures: AtomicUsize,
}

impl MemoryTurnStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    /// The next `n` calls to `save_turn` will return an error.
    pub fn fail_next_saves(&self, n: usize) {
        self.save_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl TurnStore for MemoryTurnStore {
    async fn get_turn(&self, turn_id: &str) -> Result<Option<TurnRecord>> {
        Ok(self.turns.lock().await.get(turn_id).cloned())
    }

    async fn save_turn(&self, record: &TurnRecord) -> Result<()> {
        if self
            .save_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("injected save failure");
        }
        self.save_count.fetch_add(1, Ordering::SeqCst);
        self.turns
            .lock()
            .await
            .insert(record.turn_id.clone(), record.clone());
        Ok(())
    }

    async fn get_active_turn(&self, thread_id: &str) -> Result<Option<String>> {
        Ok(self.active.lock().await.get(thread_id).cloned())
    }

    async fn set_active_turn(&self, thread_id: &str, turn_id: &str) -> Result<()> {
        self.active
            .lock()
            .await
            .insert(thread_id.to_string(), turn_id.to_string());
        Ok(())
    }

    async fn clear_active_turn(&self, thread_id: &str) -> Result<()> {
        self.active.lock().await.remove(thread_id);
        Ok(())
    }
}
