//! Subscriber registry: the set of accepted downlink WebSocket connections.
//!
//! Broadcast never blocks a healthy subscriber behind a slow one beyond the
//! send call itself, and membership changes (accept/disconnect) are the only
//! way the set grows or shrinks - a dead handle found during broadcast is
//! evicted, never resurrected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::downlink::status_message;

/// Registry of connected subscribers, keyed by a locally-assigned id.
pub struct SubscriberRegistry {
    subscribers: DashMap<u64, mpsc::UnboundedSender<Message>>,
    next_id: AtomicU64,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a newly accepted subscriber, returning a guard that
    /// unregisters it automatically when dropped.
    pub fn register(
        self: &Arc<Self>,
        sender: mpsc::UnboundedSender<Message>,
    ) -> SubscriberGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, sender);
        log::info!(
            "subscriber {} connected ({} total)",
            id,
            self.subscribers.len()
        );
        SubscriberGuard {
            id,
            registry: Arc::clone(self),
        }
    }

    fn unregister(&self, id: u64) {
        if self.subscribers.remove(&id).is_some() {
            log::info!(
                "subscriber {} disconnected ({} total)",
                id,
                self.subscribers.len()
            );
        }
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Serializes `message` once and sends it to every currently registered
    /// subscriber, evicting any whose channel has closed.
    pub fn broadcast(&self, message: &Value) {
        if self.subscribers.is_empty() {
            return;
        }
        let text = message.to_string();
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if entry.value().send(Message::Text(text.clone().into())).is_err() {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.unregister(id);
        }
    }

    /// Convenience wrapper that synthesizes and broadcasts a `status` message.
    pub fn broadcast_status(&self, state: &str, detail: &str) {
        self.broadcast(&status_message(state, detail));
    }
}

/// RAII guard returned by [`SubscriberRegistry::register`]; unregisters on drop.
pub struct SubscriberGuard {
    id: u64,
    registry: Arc<SubscriberRegistry>,
}

impl SubscriberGuard {
    /// The id assigned to this subscriber.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_to_empty_set_is_noop() {
        let registry = Arc::new(SubscriberRegistry::new());
        registry.broadcast_status("running", "ok");
    }

    #[test]
    fn register_then_drop_leaves_set_unchanged() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        {
            let _guard = registry.register(tx);
            assert_eq!(registry.connection_count(), 1);
        }
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn broadcast_delivers_to_live_subscriber_and_evicts_dead_one() {
        let registry = Arc::new(SubscriberRegistry::new());
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        let _live_guard = registry.register(tx_live);
        let dead_guard = registry.register(tx_dead);
        drop(rx_dead);

        registry.broadcast_status("running", "ASR connected");

        assert!(rx_live.try_recv().is_ok());
        // the dead subscriber's send failed, so it was evicted from the map
        // even though its guard has not been dropped yet.
        assert_eq!(registry.connection_count(), 1);
        drop(dead_guard);
    }
}
