use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agent_proto::ObserverMessage;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::patch::compute_patch;

type ObserverSender = mpsc::UnboundedSender<ObserverMessage>;

struct TurnObservers {
    /// The exact content every subscriber has seen. Snapshots and patches are
    /// both derived from this string, so a client that connects between two
    /// publishes never misses or double-receives a span.
    last_published: String,
    subscribers: Vec<(u64, ObserverSender)>,
}

/// Fan-out hub for turn observers. Keyed by turn id; turns are independent.
#[derive(Clone, Default)]
pub struct ObserverHub {
    turns: Arc<DashMap<String, TurnObservers>>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer and immediately queues a full snapshot of the
    /// turn as currently published. Returns a token for `unsubscribe`.
    pub fn subscribe(&self, turn_id: &str, sender: ObserverSender) -> u64 {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let mut entry = self
            .turns
            .entry(turn_id.to_string())
            .or_insert_with(|| TurnObservers {
                last_published: String::new(),
                subscribers: Vec::new(),
            });
        let _ = sender.send(ObserverMessage::TurnSnapshot {
            turn_id: turn_id.to_string(),
            content: entry.last_published.clone(),
        });
        entry.subscribers.push((id, sender));
        debug!(turn_id = %turn_id, subscriber_id = id, "observer subscribed");
        id
    }

    pub fn unsubscribe(&self, turn_id: &str, subscriber_id: u64) {
        let drained = match self.turns.get_mut(turn_id) {
            Some(mut entry) => {
                entry.subscribers.retain(|(id, _)| *id != subscriber_id);
                entry.subscribers.is_empty()
            }
            None => false,
        };
        if drained {
            self.turns.remove(turn_id);
        }
    }

    /// Installs `content` as the published base for a turn the hub has no
    /// state for, so a subscriber to a persisted-but-quiet turn snapshots
    /// from the store instead of from empty. No-op when the turn is live.
    pub fn seed(&self, turn_id: &str, content: &str) {
        self.turns
            .entry(turn_id.to_string())
            .or_insert_with(|| TurnObservers {
                last_published: content.to_string(),
                subscribers: Vec::new(),
            });
    }

    /// Publishes new turn content, sending each subscriber the minimal patch
    /// from what was last published. No-op when the content is unchanged.
    pub fn publish(&self, turn_id: &str, content: &str) {
        let mut entry = self
            .turns
            .entry(turn_id.to_string())
            .or_insert_with(|| TurnObservers {
                last_published: String::new(),
                subscribers: Vec::new(),
            });

        let Some(patch) = compute_patch(&entry.last_published, content) else {
            return;
        };
        entry.last_published = content.to_string();

        entry.subscribers.retain(|(id, sender)| {
            let delivered = sender
                .send(ObserverMessage::TurnPatch {
                    turn_id: turn_id.to_string(),
                    patch: patch.clone(),
                })
                .is_ok();
            if !delivered {
                debug!(turn_id = %turn_id, subscriber_id = id, "dropping closed observer");
            }
            delivered
        });
    }

    /// Drops all hub state for a finished turn. Subscribers keep their local
    /// copy; no further patches will arrive.
    pub fn finish(&self, turn_id: &str) {
        self.turns.remove(turn_id);
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, turn_id: &str) -> usize {
        self.turns
            .get(turn_id)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }
}
