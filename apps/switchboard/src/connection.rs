use std::sync::Arc;
use std::time::Duration;

use agent_proto::AgentCommand;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for an agent's ready event before giving up and flushing
/// queued commands anyway.
pub const READY_FALLBACK: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SendError {
    #[error("no agent connected with name {0}")]
    NotConnected(String),
    #[error("agent {0} connection closed")]
    Closed(String),
}

struct AgentConnection {
    sender: mpsc::UnboundedSender<AgentCommand>,
    ready: bool,
    /// Commands received before the agent announced readiness, flushed in
    /// arrival order once it does.
    pending: Vec<AgentCommand>,
    fallback: Option<JoinHandle<()>>,
}

/// Registry of live agent connections, keyed by agent name. One websocket per
/// agent; a new connection under the same name replaces the old one.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    agents: Arc<DashMap<String, AgentConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an agent connection. Commands sent before `mark_ready` are
    /// queued; a fallback timer flushes them after `READY_FALLBACK` in case
    /// the agent never announces readiness.
    pub fn register(&self, agent_name: &str, sender: mpsc::UnboundedSender<AgentCommand>) {
        let fallback = {
            let registry = self.clone();
            let agent_name = agent_name.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(READY_FALLBACK).await;
                warn!(
                    agent = %agent_name,
                    "agent never sent ready; flushing queued commands"
                );
                registry.mark_ready(&agent_name);
            })
        };

        let replaced = self.agents.insert(
            agent_name.to_string(),
            AgentConnection {
                sender,
                ready: false,
                pending: Vec::new(),
                fallback: Some(fallback),
            },
        );
        if let Some(old) = replaced {
            warn!(agent = %agent_name, "replacing existing agent connection");
            if let Some(handle) = old.fallback {
                handle.abort();
            }
        }
        info!(agent = %agent_name, "agent registered");
    }

    /// Marks the agent ready and flushes its queued commands in order.
    /// Idempotent; later calls are no-ops.
    pub fn mark_ready(&self, agent_name: &str) {
        let Some(mut conn) = self.agents.get_mut(agent_name) else {
            return;
        };
        if conn.ready {
            return;
        }
        conn.ready = true;
        if let Some(handle) = conn.fallback.take() {
            handle.abort();
        }

        let pending = std::mem::take(&mut conn.pending);
        if !pending.is_empty() {
            info!(
                agent = %agent_name,
                queued = pending.len(),
                "agent ready, flushing queued commands"
            );
        }
        for command in pending {
            if conn.sender.send(command).is_err() {
                warn!(agent = %agent_name, "agent connection closed during flush");
                break;
            }
        }
    }

    /// Sends a command to an agent, queueing it if the agent has connected
    /// but not yet announced readiness.
    pub fn send_command(&self, agent_name: &str, command: AgentCommand) -> Result<(), SendError> {
        let Some(mut conn) = self.agents.get_mut(agent_name) else {
            return Err(SendError::NotConnected(agent_name.to_string()));
        };
        if !conn.ready {
            debug!(agent = %agent_name, "agent not ready, queueing command");
            conn.pending.push(command);
            return Ok(());
        }
        conn.sender
            .send(command)
            .map_err(|_| SendError::Closed(agent_name.to_string()))
    }

    pub fn unregister(&self, agent_name: &str) {
        if let Some((_, conn)) = self.agents.remove(agent_name) {
            if let Some(handle) = conn.fallback {
                handle.abort();
            }
            if !conn.pending.is_empty() {
                warn!(
                    agent = %agent_name,
                    dropped = conn.pending.len(),
                    "agent disconnected with commands still queued"
                );
            }
            info!(agent = %agent_name, "agent unregistered");
        }
    }

    pub fn is_connected(&self, agent_name: &str) -> bool {
        self.agents.contains_key(agent_name)
    }

    pub fn connected_agents(&self) -> Vec<String> {
        self.agents.iter().map(|e| e.key().clone()).collect()
    }
}
