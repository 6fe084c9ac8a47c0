//! Shared protocol definitions for orchestrator ↔ agent-sandbox sync and the
//! downstream observer channel. Keeping these in a dedicated crate allows
//! regeneration of bindings for other consumers without pulling in the
//! server's runtime code.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a content-bearing entry within a turn. Roles the server does not
/// model are carried through untouched rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntryRole {
    User,
    Assistant,
    Other(String),
}

impl From<String> for EntryRole {
    fn from(value: String) -> Self {
        match value.as_str() {
            "user" => EntryRole::User,
            "assistant" => EntryRole::Assistant,
            _ => EntryRole::Other(value),
        }
    }
}

impl From<EntryRole> for String {
    fn from(role: EntryRole) -> Self {
        match role {
            EntryRole::User => "user".to_string(),
            EntryRole::Assistant => "assistant".to_string(),
            EntryRole::Other(value) => value,
        }
    }
}

/// Status events sent by the agent process over the sync connection.
///
/// The wire envelope is JSON keyed by `event_type`; every content-bearing or
/// creation event also carries a `request_id` so a command can be correlated
/// with its eventual completion. Event types not modeled here decode into
/// [`SyncEvent::Raw`] via [`decode_sync_event`] rather than being rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Agent finished initialization and can accept commands.
    Ready {
        #[serde(default)]
        agent_name: Option<String>,
    },
    ThreadCreated {
        thread_id: String,
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
    ThreadTitleChanged {
        thread_id: String,
        title: String,
    },
    /// Cumulative content for one entry. The agent resends the full text for
    /// the same `entry_id` on every update (overwrite semantics).
    EntryAdded {
        thread_id: String,
        entry_id: String,
        role: EntryRole,
        content: String,
    },
    TurnCompleted {
        thread_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    ThreadLoadError {
        #[serde(default)]
        thread_id: Option<String>,
        #[serde(default)]
        request_id: Option<String>,
        error: String,
    },
    SnapshotResponse {
        #[serde(default)]
        request_id: Option<String>,
        snapshot: serde_json::Value,
    },
    /// Heartbeat; no state attached.
    Ping,
    /// Escape hatch for event types the server does not model.
    Raw {
        kind: String,
        payload: serde_json::Value,
    },
}

/// Decode a wire frame into a [`SyncEvent`], falling back to
/// [`SyncEvent::Raw`] for unrecognized or partially malformed event types.
/// Only frames that are not JSON objects at all produce an error.
pub fn decode_sync_event(text: &str) -> Result<SyncEvent, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match serde_json::from_value::<SyncEvent>(value.clone()) {
        Ok(event) => Ok(event),
        Err(_) => {
            let kind = value
                .get("event_type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            Ok(SyncEvent::Raw {
                kind,
                payload: value,
            })
        }
    }
}

/// Commands sent from the orchestrator to the agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Start a new turn, or continue an existing thread when `thread_id` is
    /// present. `request_id` correlates with the eventual `turn_completed`.
    ChatMessage {
        message: String,
        request_id: String,
        #[serde(default)]
        thread_id: Option<String>,
        #[serde(default)]
        agent_name: Option<String>,
    },
    /// Inject raw input into an active turn.
    InjectInput { thread_id: String, data: String },
    /// Request a state snapshot from the agent.
    RequestSnapshot { request_id: String },
}

/// A minimal forward diff against a previously observed string.
///
/// `offset` and `total_length` are measured in UTF-16 code units — the
/// indexing convention of web observers — never in bytes or scalar values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPatch {
    pub offset: usize,
    pub patch: String,
    pub total_length: usize,
}

/// Messages sent to downstream observers of a streaming turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObserverMessage {
    /// Full current content; sent once on subscribe/reconnect.
    TurnSnapshot { turn_id: String, content: String },
    /// Incremental update; offsets in UTF-16 code units.
    TurnPatch {
        turn_id: String,
        #[serde(flatten)]
        patch: TextPatch,
    },
}

pub fn generate_request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

pub fn generate_turn_id() -> String {
    format!("turn-{}", Uuid::new_v4())
}
