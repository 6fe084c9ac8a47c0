use std::time::Duration;

use agent_proto::{generate_request_id, AgentCommand};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;
use tracing::{error, warn};

use crate::connection::SendError;
use crate::storage::TurnRecord;
use crate::websocket::AppState;

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub connected_agents: usize,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        connected_agents: state.registry.connected_agents().len(),
    })
}

pub async fn list_agents(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "agents": state.registry.connected_agents() }))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub request_id: String,
}

/// Starts or continues a turn on the named agent. Fire-and-forget: the
/// response only acknowledges delivery (or queueing); progress is observed
/// over the turn's observer channel.
pub async fn send_chat(
    Path(agent_name): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, StatusCode> {
    let request_id = generate_request_id();
    let command = AgentCommand::ChatMessage {
        message: request.message,
        request_id: request_id.clone(),
        thread_id: request.thread_id,
        agent_name: Some(agent_name.clone()),
    };
    dispatch_command(&state, &agent_name, command)?;
    Ok(Json(ChatResponse { request_id }))
}

#[derive(Debug, Deserialize)]
pub struct InjectRequest {
    pub thread_id: String,
    pub data: String,
}

pub async fn inject_input(
    Path(agent_name): Path<String>,
    State(state): State<AppState>,
    Json(request): Json<InjectRequest>,
) -> Result<StatusCode, StatusCode> {
    let command = AgentCommand::InjectInput {
        thread_id: request.thread_id,
        data: request.data,
    };
    dispatch_command(&state, &agent_name, command)?;
    Ok(StatusCode::ACCEPTED)
}

/// Round-trips a snapshot request through the agent, waiting up to ten
/// seconds for its response frame.
pub async fn get_snapshot(
    Path(agent_name): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let request_id = generate_request_id();
    let receiver = state.snapshots.register(&request_id);
    let command = AgentCommand::RequestSnapshot {
        request_id: request_id.clone(),
    };
    if let Err(status) = dispatch_command(&state, &agent_name, command) {
        state.snapshots.cancel(&request_id);
        return Err(status);
    }

    match timeout(SNAPSHOT_TIMEOUT, receiver).await {
        Ok(Ok(snapshot)) => Ok(Json(snapshot)),
        Ok(Err(_)) => {
            // The waiter was cancelled, e.g. by a thread_load_error.
            Err(StatusCode::BAD_GATEWAY)
        }
        Err(_) => {
            warn!(agent = %agent_name, request_id = %request_id, "snapshot request timed out");
            state.snapshots.cancel(&request_id);
            Err(StatusCode::GATEWAY_TIMEOUT)
        }
    }
}

pub async fn get_turn(
    Path(turn_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<TurnRecord>, StatusCode> {
    match state.store.get_turn(&turn_id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(err) => {
            error!(turn_id = %turn_id, error = %err, "turn lookup failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn dispatch_command(
    state: &AppState,
    agent_name: &str,
    command: AgentCommand,
) -> Result<(), StatusCode> {
    state
        .registry
        .send_command(agent_name, command)
        .map_err(|err| match err {
            SendError::NotConnected(_) => StatusCode::NOT_FOUND,
            SendError::Closed(_) => {
                warn!(agent = %agent_name, "command dropped on closed connection");
                StatusCode::BAD_GATEWAY
            }
        })
}
