use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, error, info};

use agent_proto::generate_turn_id;

use crate::observer::ObserverHub;
use crate::storage::{TurnRecord, TurnState, TurnStore};

struct ActiveTurn {
    record: TurnRecord,
    dirty: bool,
    next_flush: Instant,
    next_publish: Instant,
}

/// Write-through cache between the token stream and the turn store.
///
/// Streaming tokens arrive far faster than we want to persist or fan out, so
/// updates land in memory first and are flushed when the per-turn throttle
/// deadlines pass. Terminal transitions bypass both throttles; if the
/// terminal flush itself fails, the finished record is parked and retried
/// until the store accepts it, so the final content is never dropped.
pub struct StreamingContext {
    store: Arc<dyn TurnStore>,
    hub: ObserverHub,
    flush_interval: Duration,
    publish_interval: Duration,
    /// Wait this long before re-attempting a failed store flush.
    retry_backoff: Duration,
    turns: HashMap<String, ActiveTurn>,
    /// Finished turns whose terminal flush failed, keyed by thread. Retried
    /// on the next event for that thread and on `flush_all`; the thread's
    /// active-turn index stays set until the save lands.
    retiring: HashMap<String, ActiveTurn>,
}

impl StreamingContext {
    pub fn new(
        store: Arc<dyn TurnStore>,
        hub: ObserverHub,
        flush_interval: Duration,
        publish_interval: Duration,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            flush_interval,
            publish_interval,
            retry_backoff,
            turns: HashMap::new(),
            retiring: HashMap::new(),
        }
    }

    /// Ensures a turn exists for `thread_id`, resuming the thread's active
    /// turn from the store when one survives a relay restart. Returns the
    /// previously persisted content, if any, so the caller can seed its
    /// accumulator.
    pub async fn begin(&mut self, thread_id: &str) -> Result<Option<String>> {
        // A finished turn awaiting its terminal flush must land before the
        // thread can start streaming again.
        if self.retiring.contains_key(thread_id) {
            self.retire(thread_id).await?;
        }

        if let Some(turn) = self.turns.get(thread_id) {
            return Ok(Some(turn.record.content.clone()));
        }

        if let Some(turn_id) = self.store.get_active_turn(thread_id).await? {
            match self.store.get_turn(&turn_id).await? {
                Some(record) if record.state == TurnState::Streaming => {
                    info!(
                        thread_id = %thread_id,
                        turn_id = %turn_id,
                        "resuming active turn from store"
                    );
                    let content = record.content.clone();
                    let now = Instant::now();
                    self.turns.insert(
                        thread_id.to_string(),
                        ActiveTurn {
                            record,
                            dirty: false,
                            next_flush: now,
                            next_publish: now,
                        },
                    );
                    let restored = if content.is_empty() {
                        None
                    } else {
                        Some(content)
                    };
                    return Ok(restored);
                }
                // Index points at a finished or expired turn; start fresh.
                _ => self.store.clear_active_turn(thread_id).await?,
            }
        }

        let turn_id = generate_turn_id();
        let record = TurnRecord::new(turn_id.clone(), thread_id.to_string());
        self.store.save_turn(&record).await?;
        self.store.set_active_turn(thread_id, &turn_id).await?;
        debug!(thread_id = %thread_id, turn_id = %turn_id, "started new turn");

        let now = Instant::now();
        self.turns.insert(
            thread_id.to_string(),
            ActiveTurn {
                record,
                dirty: false,
                next_flush: now + self.flush_interval,
                next_publish: now,
            },
        );
        Ok(None)
    }

    pub fn turn_id(&self, thread_id: &str) -> Option<&str> {
        self.turns
            .get(thread_id)
            .map(|turn| turn.record.turn_id.as_str())
    }

    /// Replaces the in-memory turn content and flushes or publishes if the
    /// respective throttle deadline has passed. A failed flush leaves the
    /// turn dirty and retries after the backoff.
    pub async fn update(&mut self, thread_id: &str, content: &str) -> Result<()> {
        let Some(turn) = self.turns.get_mut(thread_id) else {
            anyhow::bail!("no active turn for thread {thread_id}");
        };

        turn.record.content = content.to_string();
        turn.record.updated_at = Utc::now();
        turn.dirty = true;

        let now = Instant::now();
        if now >= turn.next_flush {
            match self.store.save_turn(&turn.record).await {
                Ok(()) => {
                    turn.dirty = false;
                    turn.next_flush = now + self.flush_interval;
                }
                Err(err) => {
                    // Content is still in memory; retry after the backoff.
                    turn.next_flush = now + self.retry_backoff;
                    error!(
                        thread_id = %thread_id,
                        turn_id = %turn.record.turn_id,
                        error = %err,
                        "failed to flush turn, will retry"
                    );
                }
            }
        }

        if now >= turn.next_publish {
            self.hub.publish(&turn.record.turn_id, content);
            turn.next_publish = now + self.publish_interval;
        }

        Ok(())
    }

    /// Records the thread's title on its turn, persisted with the next
    /// flush.
    pub async fn set_title(&mut self, thread_id: &str, title: &str) -> Result<()> {
        if !self.turns.contains_key(thread_id) {
            self.begin(thread_id).await?;
        }
        if let Some(turn) = self.turns.get_mut(thread_id) {
            turn.record.title = Some(title.to_string());
            turn.record.updated_at = Utc::now();
            turn.dirty = true;
        }
        Ok(())
    }

    /// Terminal success. Publishes the final content, flushes
    /// unconditionally, and releases the thread's active-turn index.
    /// Completion for a thread with nothing streaming is a no-op.
    pub async fn complete(&mut self, thread_id: &str) -> Result<()> {
        self.finish(thread_id, TurnState::Complete, None).await
    }

    /// Terminal failure. Same guarantees as `complete`, with the error
    /// recorded on the turn.
    pub async fn fail(&mut self, thread_id: &str, error_message: &str) -> Result<()> {
        self.finish(
            thread_id,
            TurnState::Failed,
            Some(error_message.to_string()),
        )
        .await
    }

    async fn finish(
        &mut self,
        thread_id: &str,
        state: TurnState,
        error_message: Option<String>,
    ) -> Result<()> {
        let Some(mut turn) = self.turns.remove(thread_id) else {
            debug!(thread_id = %thread_id, "terminal event for idle thread ignored");
            return Ok(());
        };

        turn.record.state = state;
        turn.record.error = error_message;
        turn.record.updated_at = Utc::now();
        turn.dirty = true;

        // Observers converge on the final content regardless of store health.
        self.hub.publish(&turn.record.turn_id, &turn.record.content);
        self.hub.finish(&turn.record.turn_id);

        self.retiring.insert(thread_id.to_string(), turn);
        self.retire(thread_id).await
    }

    /// Attempts the terminal flush for a finished turn. On success the
    /// active-turn index is cleared; on failure the turn stays parked for a
    /// later retry.
    async fn retire(&mut self, thread_id: &str) -> Result<()> {
        let Some(turn) = self.retiring.get_mut(thread_id) else {
            return Ok(());
        };

        match self.store.save_turn(&turn.record).await {
            Ok(()) => {
                turn.dirty = false;
                let turn_id = turn.record.turn_id.clone();
                let state = turn.record.state;
                let content_len = turn.record.content.len();
                self.retiring.remove(thread_id);
                self.store.clear_active_turn(thread_id).await?;
                info!(
                    thread_id = %thread_id,
                    turn_id = %turn_id,
                    state = ?state,
                    content_len,
                    "turn finished"
                );
                Ok(())
            }
            Err(err) => {
                turn.next_flush = Instant::now() + self.retry_backoff;
                error!(
                    thread_id = %thread_id,
                    turn_id = %turn.record.turn_id,
                    error = %err,
                    "terminal flush failed, will retry"
                );
                Err(err)
            }
        }
    }

    /// Flushes every dirty turn, leaving streaming turns resumable (their
    /// active-turn index stays set), and retries any parked terminal
    /// flushes. Called on agent disconnect so nothing buffered in memory is
    /// lost.
    pub async fn flush_all(&mut self) {
        for (thread_id, turn) in self.turns.iter_mut() {
            if !turn.dirty {
                continue;
            }
            match self.store.save_turn(&turn.record).await {
                Ok(()) => {
                    turn.dirty = false;
                    turn.next_flush = Instant::now() + self.flush_interval;
                }
                Err(err) => error!(
                    thread_id = %thread_id,
                    turn_id = %turn.record.turn_id,
                    error = %err,
                    "failed to flush turn on shutdown"
                ),
            }
        }

        let parked: Vec<String> = self.retiring.keys().cloned().collect();
        for thread_id in parked {
            if let Err(err) = self.retire(&thread_id).await {
                error!(
                    thread_id = %thread_id,
                    error = %err,
                    "terminal flush retry failed"
                );
            }
        }
    }
}
