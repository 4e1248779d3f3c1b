//! Lifecycle event broadcaster
//!
//! Lets whatever embeds the server (CLI, IDE shell, test harness) observe
//! `started`, `stopped`, `error` and `fileChanged` without callbacks.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A lifecycle event observable by the embedding process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ServerEvent {
    Started { port: u16, https: bool },
    Stopped,
    Error { message: String },
    #[serde(rename_all = "camelCase")]
    FileChanged { relative_path: String },
}

/// Broadcasts lifecycle events to all subscribers
pub struct EventBroadcaster {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBroadcaster {
    /// Create a new event broadcaster with a channel capacity of 256 events
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Emit an event to all current subscribers
    pub fn emit(&self, event: ServerEvent) {
        log::trace!("Lifecycle event: {:?}", event);
        // Ignore send errors (no receivers)
        let _ = self.tx.send(event);
    }

    /// Subscribe to events (returns a receiver)
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
