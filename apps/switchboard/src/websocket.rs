use std::sync::Arc;
use std::time::Duration;

use agent_proto::AgentCommand;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionRegistry;
use crate::dispatcher::Dispatcher;
use crate::handler::{RelayHandler, SnapshotWaiters};
use crate::observer::ObserverHub;
use crate::storage::TurnStore;
use crate::streaming::StreamingContext;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub hub: ObserverHub,
    pub store: Arc<dyn TurnStore>,
    pub snapshots: SnapshotWaiters,
    pub flush_interval: Duration,
    pub publish_interval: Duration,
    pub flush_retry_backoff: Duration,
}

/// Agent-side upgrade: one long-lived sync connection per agent name.
pub async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    Path(agent_name): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, agent_name, state))
}

async fn handle_agent_socket(socket: WebSocket, agent_name: String, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // One writer task per socket; every outbound command goes through this
    // channel so frames never interleave.
    let (tx, mut rx) = mpsc::unbounded_channel::<AgentCommand>();
    state.registry.register(&agent_name, tx);

    let writer_agent = agent_name.clone();
    let writer = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let json = match serde_json::to_string(&command) {
                Ok(json) => json,
                Err(err) => {
                    error!(agent = %writer_agent, error = %err, "failed to encode command");
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        debug!(agent = %writer_agent, "agent writer task ended");
    });

    let streaming = StreamingContext::new(
        state.store.clone(),
        state.hub.clone(),
        state.flush_interval,
        state.publish_interval,
        state.flush_retry_backoff,
    );
    let handler = RelayHandler::new(
        agent_name.clone(),
        state.registry.clone(),
        streaming,
        state.snapshots.clone(),
    );
    let mut dispatcher = Dispatcher::new(handler);

    info!(agent = %agent_name, "agent sync connection established");

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(agent = %agent_name, error = %err, "agent socket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                if let Err(err) = dispatcher.dispatch_text(&text).await {
                    // A handler failure is logged, never fatal to the stream.
                    error!(agent = %agent_name, error = %err, "event dispatch failed");
                }
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                warn!(agent = %agent_name, "binary frame from agent ignored");
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    if let Err(err) = dispatcher.disconnect().await {
        error!(agent = %agent_name, error = %err, "disconnect flush failed");
    }
    state.registry.unregister(&agent_name);
    writer.abort();
    info!(agent = %agent_name, "agent sync connection closed");
}

/// Observer-side upgrade: read-only feed of one turn's content.
pub async fn observer_ws_handler(
    ws: WebSocketUpgrade,
    Path(turn_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_observer_socket(socket, turn_id, state))
}

async fn handle_observer_socket(socket: WebSocket, turn_id: String, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    // If the turn is persisted but not currently streaming, seed the hub so
    // the initial snapshot carries the stored content.
    match state.store.get_turn(&turn_id).await {
        Ok(Some(record)) => state.hub.seed(&turn_id, &record.content),
        Ok(None) => {}
        Err(err) => {
            warn!(turn_id = %turn_id, error = %err, "turn lookup failed for observer");
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriber_id = state.hub.subscribe(&turn_id, tx);
    debug!(turn_id = %turn_id, subscriber_id, "observer connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(err) => {
                        error!(turn_id = %turn_id, error = %err, "failed to encode observer message");
                        continue;
                    }
                };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // observers only listen
                    Some(Err(err)) => {
                        debug!(turn_id = %turn_id, error = %err, "observer socket error");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unsubscribe(&turn_id, subscriber_id);
    debug!(turn_id = %turn_id, subscriber_id, "observer disconnected");
}
