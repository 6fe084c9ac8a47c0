use agent_proto::{decode_sync_event, SyncEvent};
use anyhow::Result;
use tracing::{trace, warn};

use crate::handler::SyncHandler;

/// Routes decoded sync events to a [`SyncHandler`].
///
/// One dispatcher per agent connection, driven by that connection's reader
/// task only, so handler state needs no locking.
pub struct Dispatcher<H: SyncHandler> {
    handler: H,
}

impl<H: SyncHandler> Dispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    /// Decodes one text frame and dispatches it. Frames that are not JSON are
    /// logged and skipped; a malformed frame must not take down the
    /// connection.
    pub async fn dispatch_text(&mut self, text: &str) -> Result<()> {
        match decode_sync_event(text) {
            Ok(event) => self.dispatch(event).await,
            Err(err) => {
                warn!(error = %err, frame_bytes = text.len(), "discarding non-JSON frame");
                Ok(())
            }
        }
    }

    pub async fn dispatch(&mut self, event: SyncEvent) -> Result<()> {
        match event {
            SyncEvent::Ready { agent_name } => {
                self.handler.on_ready(agent_name.as_deref()).await
            }
            SyncEvent::ThreadCreated {
                thread_id,
                request_id,
                title,
            } => {
                self.handler
                    .on_thread_created(&thread_id, request_id.as_deref(), title.as_deref())
                    .await
            }
            SyncEvent::ThreadTitleChanged { thread_id, title } => {
                self.handler
                    .on_thread_title_changed(&thread_id, &title)
                    .await
            }
            SyncEvent::EntryAdded {
                thread_id,
                entry_id,
                role,
                content,
            } => {
                self.handler
                    .on_entry_added(&thread_id, &entry_id, &role, &content)
                    .await
            }
            SyncEvent::TurnCompleted {
                thread_id,
                request_id,
            } => {
                self.handler
                    .on_turn_completed(&thread_id, request_id.as_deref())
                    .await
            }
            SyncEvent::ThreadLoadError {
                thread_id,
                request_id,
                error,
            } => {
                self.handler
                    .on_thread_load_error(thread_id.as_deref(), request_id.as_deref(), &error)
                    .await
            }
            SyncEvent::SnapshotResponse {
                request_id,
                snapshot,
            } => self.handler.on_snapshot(request_id.as_deref(), snapshot).await,
            SyncEvent::Ping => {
                trace!("ping");
                Ok(())
            }
            SyncEvent::Raw { kind, payload } => self.handler.on_raw_event(&kind, &payload).await,
        }
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.handler.on_disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_proto::EntryRole;
    use async_trait::async_trait;
    use serde_json::Value;

    #[derive(Default)]
    struct RecordingHandler {
        calls: Vec<String>,
    }

    #[async_trait]
    impl SyncHandler for RecordingHandler {
        async fn on_ready(&mut self, agent_name: Option<&str>) -> Result<()> {
            self.calls
                .push(format!("ready:{}", agent_name.unwrap_or("-")));
            Ok(())
        }

        async fn on_thread_created(
            &mut self,
            thread_id: &str,
            _request_id: Option<&str>,
            _title: Option<&str>,
        ) -> Result<()> {
            self.calls.push(format!("thread_created:{thread_id}"));
            Ok(())
        }

        async fn on_thread_title_changed(&mut self, thread_id: &str, title: &str) -> Result<()> {
            self.calls.push(format!("title:{thread_id}:{title}"));
            Ok(())
        }

        async fn on_entry_added(
            &mut self,
            thread_id: &str,
            entry_id: &str,
            _role: &EntryRole,
            content: &str,
        ) -> Result<()> {
            self.calls
                .push(format!("entry:{thread_id}:{entry_id}:{content}"));
            Ok(())
        }

        async fn on_turn_completed(
            &mut self,
            thread_id: &str,
            _request_id: Option<&str>,
        ) -> Result<()> {
            self.calls.push(format!("completed:{thread_id}"));
            Ok(())
        }

        async fn on_thread_load_error(
            &mut self,
            thread_id: Option<&str>,
            _request_id: Option<&str>,
            error: &str,
        ) -> Result<()> {
            self.calls
                .push(format!("load_error:{}:{error}", thread_id.unwrap_or("-")));
            Ok(())
        }

        async fn on_snapshot(&mut self, request_id: Option<&str>, _snapshot: Value) -> Result<()> {
            self.calls
                .push(format!("snapshot:{}", request_id.unwrap_or("-")));
            Ok(())
        }

        async fn on_raw_event(&mut self, kind: &str, _payload: &Value) -> Result<()> {
            self.calls.push(format!("raw:{kind}"));
            Ok(())
        }

        async fn on_disconnect(&mut self) -> Result<()> {
            self.calls.push("disconnect".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_route_to_matching_callbacks() {
        let mut dispatcher = Dispatcher::new(RecordingHandler::default());
        dispatcher
            .dispatch_text(r#"{"event_type":"ready","agent_name":"a"}"#)
            .await
            .unwrap();
        dispatcher
            .dispatch_text(r#"{"event_type":"thread_created","thread_id":"t1"}"#)
            .await
            .unwrap();
        dispatcher
            .dispatch_text(
                r#"{"event_type":"entry_added","thread_id":"t1","entry_id":"e1","role":"assistant","content":"hi"}"#,
            )
            .await
            .unwrap();
        dispatcher
            .dispatch_text(r#"{"event_type":"turn_completed","thread_id":"t1"}"#)
            .await
            .unwrap();

        assert_eq!(
            dispatcher.handler.calls,
            vec![
                "ready:a",
                "thread_created:t1",
                "entry:t1:e1:hi",
                "completed:t1",
            ]
        );
    }

    #[tokio::test]
    async fn ping_is_a_noop() {
        let mut dispatcher = Dispatcher::new(RecordingHandler::default());
        dispatcher
            .dispatch_text(r#"{"event_type":"ping"}"#)
            .await
            .unwrap();
        assert!(dispatcher.handler.calls.is_empty());
    }

    #[tokio::test]
    async fn unknown_event_routes_to_raw() {
        let mut dispatcher = Dispatcher::new(RecordingHandler::default());
        dispatcher
            .dispatch_text(r#"{"event_type":"tool_call_started","tool":"bash"}"#)
            .await
            .unwrap();
        assert_eq!(dispatcher.handler.calls, vec!["raw:tool_call_started"]);
    }

    #[tokio::test]
    async fn non_json_frame_is_skipped_not_fatal() {
        let mut dispatcher = Dispatcher::new(RecordingHandler::default());
        dispatcher.dispatch_text("garbage").await.unwrap();
        assert!(dispatcher.handler.calls.is_empty());
    }

    mod relay_flow {
        use super::*;
        use crate::connection::ConnectionRegistry;
        use crate::handler::{RelayHandler, SnapshotWaiters};
        use crate::observer::ObserverHub;
        use crate::patch::apply_patch;
        use crate::storage::{MemoryTurnStore, TurnState, TurnStore};
        use crate::streaming::StreamingContext;
        use agent_proto::ObserverMessage;
        use std::sync::Arc;
        use std::time::Duration;
        use tokio::sync::mpsc;

        fn relay(
            store: Arc<MemoryTurnStore>,
            hub: ObserverHub,
        ) -> Dispatcher<RelayHandler> {
            let streaming = StreamingContext::new(
                store,
                hub,
                Duration::from_millis(0), // flush every update
                Duration::from_millis(0), // publish every update
                Duration::from_millis(0),
            );
            Dispatcher::new(RelayHandler::new(
                "agent-a".into(),
                ConnectionRegistry::new(),
                streaming,
                SnapshotWaiters::new(),
            ))
        }

        /// Drives the whole wire path: raw frames in, observer patches out,
        /// persisted turn at the end.
        #[tokio::test]
        async fn frames_to_observed_turn() {
            let store = MemoryTurnStore::new();
            let hub = ObserverHub::new();
            let mut dispatcher = relay(store.clone(), hub.clone());

            dispatcher
                .dispatch_text(r#"{"event_type":"thread_created","thread_id":"t1"}"#)
                .await
                .unwrap();

            let (tx, mut rx) = mpsc::unbounded_channel();
            let turn_id = store.get_active_turn("t1").await.unwrap().unwrap();
            hub.subscribe(&turn_id, tx);

            for frame in [
                r#"{"event_type":"entry_added","thread_id":"t1","entry_id":"e1","role":"assistant","content":"Hello"}"#,
                r#"{"event_type":"entry_added","thread_id":"t1","entry_id":"e1","role":"assistant","content":"Hello, world"}"#,
                r#"{"event_type":"ping"}"#,
                r#"{"event_type":"entry_added","thread_id":"t1","entry_id":"e2","role":"assistant","content":"Done 📤"}"#,
                r#"{"event_type":"turn_completed","thread_id":"t1"}"#,
            ] {
                dispatcher.dispatch_text(frame).await.unwrap();
            }

            // Reassemble the stream from the observer's point of view.
            let mut seen = String::new();
            while let Ok(msg) = rx.try_recv() {
                match msg {
                    ObserverMessage::TurnSnapshot { content, .. } => seen = content,
                    ObserverMessage::TurnPatch { patch, .. } => {
                        seen = apply_patch(&seen, &patch)
                    }
                }
            }
            assert_eq!(seen, "Hello, world\n\nDone 📤");

            let record = store.get_turn(&turn_id).await.unwrap().unwrap();
            assert_eq!(record.content, seen);
            assert_eq!(record.state, TurnState::Complete);
        }
    }
}
