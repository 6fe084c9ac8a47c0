use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use agent_proto::EntryRole;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::accumulator::MessageAccumulator;
use crate::connection::ConnectionRegistry;
use crate::streaming::StreamingContext;

/// Per-connection event callbacks. The dispatcher routes every decoded frame
/// through this trait, so tests can substitute a recording implementation.
#[async_trait]
pub trait SyncHandler: Send {
    async fn on_ready(&mut self, agent_name: Option<&str>) -> Result<()>;
    async fn on_thread_created(
        &mut self,
        thread_id: &str,
        request_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<()>;
    async fn on_thread_title_changed(&mut self, thread_id: &str, title: &str) -> Result<()>;
    async fn on_entry_added(
        &mut self,
        thread_id: &str,
        entry_id: &str,
        role: &EntryRole,
        content: &str,
    ) -> Result<()>;
    async fn on_turn_completed(&mut self, thread_id: &str, request_id: Option<&str>)
        -> Result<()>;
    async fn on_thread_load_error(
        &mut self,
        thread_id: Option<&str>,
        request_id: Option<&str>,
        error: &str,
    ) -> Result<()>;
    async fn on_snapshot(&mut self, request_id: Option<&str>, snapshot: Value) -> Result<()>;
    async fn on_raw_event(&mut self, kind: &str, payload: &Value) -> Result<()>;
    /// The underlying socket closed; flush whatever is buffered.
    async fn on_disconnect(&mut self) -> Result<()>;
}

/// Correlates `request_snapshot` commands with the agent's eventual response
/// so an HTTP caller can await it.
#[derive(Clone, Default)]
pub struct SnapshotWaiters {
    pending: Arc<DashMap<String, oneshot::Sender<Value>>>,
}

impl SnapshotWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.to_string(), tx);
        rx
    }

    /// Delivers a snapshot to its waiter. Returns false when nobody is
    /// waiting (timed out or never requested).
    pub fn resolve(&self, request_id: &str, snapshot: Value) -> bool {
        match self.pending.remove(request_id) {
            Some((_, tx)) => tx.send(snapshot).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, request_id: &str) {
        self.pending.remove(request_id);
    }
}

/// Production handler: reconciles entry streams into turns and relays them
/// to the store and observers. One instance per agent connection; the
/// accumulator table dies with it, persisted turn content is the recovery
/// source on reconnect.
pub struct RelayHandler {
    agent_name: String,
    registry: ConnectionRegistry,
    streaming: StreamingContext,
    snapshots: SnapshotWaiters,
    accumulators: HashMap<String, MessageAccumulator>,
}

impl RelayHandler {
    pub fn new(
        agent_name: String,
        registry: ConnectionRegistry,
        streaming: StreamingContext,
        snapshots: SnapshotWaiters,
    ) -> Self {
        Self {
            agent_name,
            registry,
            streaming,
            snapshots,
            accumulators: HashMap::new(),
        }
    }
}

#[async_trait]
impl SyncHandler for RelayHandler {
    async fn on_ready(&mut self, agent_name: Option<&str>) -> Result<()> {
        info!(
            agent = %self.agent_name,
            announced = agent_name.unwrap_or(""),
            "agent ready"
        );
        self.registry.mark_ready(&self.agent_name);
        Ok(())
    }

    async fn on_thread_created(
        &mut self,
        thread_id: &str,
        request_id: Option<&str>,
        title: Option<&str>,
    ) -> Result<()> {
        info!(
            agent = %self.agent_name,
            thread_id = %thread_id,
            request_id = request_id.unwrap_or(""),
            title = title.unwrap_or(""),
            "thread created"
        );
        self.streaming.begin(thread_id).await?;
        if let Some(title) = title {
            self.streaming.set_title(thread_id, title).await?;
        }
        Ok(())
    }

    async fn on_thread_title_changed(&mut self, thread_id: &str, title: &str) -> Result<()> {
        debug!(thread_id = %thread_id, title = %title, "thread title changed");
        self.streaming.set_title(thread_id, title).await
    }

    async fn on_entry_added(
        &mut self,
        thread_id: &str,
        entry_id: &str,
        _role: &EntryRole,
        content: &str,
    ) -> Result<()> {
        let accumulator = match self.accumulators.entry(thread_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let restored = self.streaming.begin(thread_id).await?;
                entry.insert(match restored {
                    Some(persisted) => MessageAccumulator::restore(persisted),
                    None => MessageAccumulator::new(),
                })
            }
        };
        let full = accumulator.apply(thread_id, entry_id, content);
        self.streaming.update(thread_id, full).await
    }

    async fn on_turn_completed(
        &mut self,
        thread_id: &str,
        request_id: Option<&str>,
    ) -> Result<()> {
        debug!(
            thread_id = %thread_id,
            request_id = request_id.unwrap_or(""),
            "turn completed"
        );
        self.accumulators.remove(thread_id);
        self.streaming.complete(thread_id).await
    }

    async fn on_thread_load_error(
        &mut self,
        thread_id: Option<&str>,
        request_id: Option<&str>,
        error_message: &str,
    ) -> Result<()> {
        error!(
            agent = %self.agent_name,
            thread_id = thread_id.unwrap_or(""),
            request_id = request_id.unwrap_or(""),
            error = %error_message,
            "thread load error"
        );
        if let Some(request_id) = request_id {
            self.snapshots.cancel(request_id);
        }
        if let Some(thread_id) = thread_id {
            self.accumulators.remove(thread_id);
            self.streaming.fail(thread_id, error_message).await?;
        }
        Ok(())
    }

    async fn on_snapshot(&mut self, request_id: Option<&str>, snapshot: Value) -> Result<()> {
        match request_id {
            Some(request_id) => {
                if !self.snapshots.resolve(request_id, snapshot) {
                    debug!(request_id = %request_id, "snapshot arrived with no waiter");
                }
            }
            None => debug!("snapshot response without request_id dropped"),
        }
        Ok(())
    }

    async fn on_raw_event(&mut self, kind: &str, payload: &Value) -> Result<()> {
        // Forward-compatibility: unmodeled events are observable but inert.
        debug!(
            agent = %self.agent_name,
            event_type = %kind,
            payload_bytes = payload.to_string().len(),
            "unhandled event type"
        );
        Ok(())
    }

    async fn on_disconnect(&mut self) -> Result<()> {
        warn!(agent = %self.agent_name, "agent disconnected, flushing turns");
        self.streaming.flush_all().await;
        self.accumulators.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::ObserverHub;
    use crate::storage::{MemoryTurnStore, TurnState, TurnStore};
    use std::time::Duration;

    fn handler(store: Arc<MemoryTurnStore>) -> RelayHandler {
        let streaming = StreamingContext::new(
            store,
            ObserverHub::new(),
            Duration::from_millis(200),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        RelayHandler::new(
            "agent-a".into(),
            ConnectionRegistry::new(),
            streaming,
            SnapshotWaiters::new(),
        )
    }

    #[tokio::test]
    async fn entry_stream_accumulates_and_completes() {
        let store = MemoryTurnStore::new();
        let mut h = handler(store.clone());

        h.on_thread_created("t1", Some("req-1"), None).await.unwrap();
        h.on_entry_added("t1", "e1", &EntryRole::Assistant, "Hello")
            .await
            .unwrap();
        h.on_entry_added("t1", "e1", &EntryRole::Assistant, "Hello, world")
            .await
            .unwrap();
        h.on_entry_added("t1", "e2", &EntryRole::Assistant, "Bye")
            .await
            .unwrap();

        let turn_id = h.streaming.turn_id("t1").unwrap().to_string();
        h.on_turn_completed("t1", Some("req-1")).await.unwrap();

        let record = store.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(record.content, "Hello, world\n\nBye");
        assert_eq!(record.state, TurnState::Complete);
    }

    #[tokio::test]
    async fn title_changes_land_on_the_persisted_turn() {
        let store = MemoryTurnStore::new();
        let mut h = handler(store.clone());

        h.on_thread_created("t1", Some("req-1"), Some("Draft reply"))
            .await
            .unwrap();
        h.on_entry_added("t1", "e1", &EntryRole::Assistant, "Hello")
            .await
            .unwrap();
        h.on_thread_title_changed("t1", "Reply to support ticket")
            .await
            .unwrap();

        let turn_id = h.streaming.turn_id("t1").unwrap().to_string();
        h.on_turn_completed("t1", Some("req-1")).await.unwrap();

        let record = store.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(record.title.as_deref(), Some("Reply to support ticket"));
        assert_eq!(record.content, "Hello");
    }

    #[tokio::test]
    async fn load_error_fails_the_waiting_turn() {
        let store = MemoryTurnStore::new();
        let mut h = handler(store.clone());

        h.on_entry_added("t1", "e1", &EntryRole::Assistant, "partial")
            .await
            .unwrap();
        let turn_id = h.streaming.turn_id("t1").unwrap().to_string();

        h.on_thread_load_error(Some("t1"), None, "model unavailable")
            .await
            .unwrap();

        let record = store.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(record.state, TurnState::Failed);
        assert_eq!(record.error.as_deref(), Some("model unavailable"));
        // A second terminal event for the same thread is a no-op.
        h.on_turn_completed("t1", None).await.unwrap();
        let record = store.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(record.state, TurnState::Failed);
    }

    #[tokio::test]
    async fn load_error_without_thread_only_logs() {
        let store = MemoryTurnStore::new();
        let mut h = handler(store.clone());
        h.on_thread_load_error(None, Some("req-9"), "boom")
            .await
            .unwrap();
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn snapshot_resolves_registered_waiter() {
        let store = MemoryTurnStore::new();
        let mut h = handler(store);
        let rx = h.snapshots.register("req-5");

        h.on_snapshot(Some("req-5"), serde_json::json!({"threads": 2}))
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap()["threads"], 2);
    }

    #[tokio::test]
    async fn disconnect_flushes_in_flight_content() {
        let store = MemoryTurnStore::new();
        let mut h = handler(store.clone());

        h.on_entry_added("t1", "e1", &EntryRole::Assistant, "in flight")
            .await
            .unwrap();
        let turn_id = h.streaming.turn_id("t1").unwrap().to_string();
        h.on_disconnect().await.unwrap();

        let record = store.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(record.content, "in flight");
        assert_eq!(record.state, TurnState::Streaming);
    }

    #[tokio::test]
    async fn reconnect_resumes_from_persisted_content() {
        let store = MemoryTurnStore::new();
        {
            let mut h = handler(store.clone());
            h.on_entry_added("t1", "e1", &EntryRole::Assistant, "before drop")
                .await
                .unwrap();
            h.on_disconnect().await.unwrap();
        }

        let mut h = handler(store.clone());
        h.on_entry_added("t1", "e2", &EntryRole::Assistant, "after reconnect")
            .await
            .unwrap();
        let turn_id = h.streaming.turn_id("t1").unwrap().to_string();
        h.on_turn_completed("t1", None).await.unwrap();

        let record = store.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(record.content, "before drop\n\nafter reconnect");
    }
}
