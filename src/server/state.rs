//! Per-instance state shared across handlers

use super::collab::CollabRelay;
use super::events::{EventBroadcaster, ServerEvent};
use super::proxy::ProxyForwarder;
use super::socket::{ConnectionRegistry, ReloadFrame};
use crate::config::{ProxyRule, ServerConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared state for one running server. Every instance owns its own
/// registry and document store, so several servers can live in one process.
#[derive(Clone)]
pub struct ServerAppState {
    /// Configuration captured at construction
    pub config: Arc<ServerConfig>,

    /// Open socket-channel connections
    pub registry: Arc<ConnectionRegistry>,

    /// Collaboration documents and relay logic
    pub collab: Arc<CollabRelay>,

    /// Lifecycle event fan-out
    pub broadcaster: Arc<EventBroadcaster>,

    /// Proxy rules (configured rules plus the HMR catch-all)
    pub proxy: Arc<ProxyForwarder>,

    /// Set once teardown begins; new socket clients are refused
    closing: Arc<AtomicBool>,
}

impl ServerAppState {
    pub fn new(
        config: Arc<ServerConfig>,
        proxy_rules: Vec<ProxyRule>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        let collab = Arc::new(CollabRelay::new(config.collab_max_documents));
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            collab,
            broadcaster,
            proxy: Arc::new(ProxyForwarder::new(proxy_rules)),
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    /// Emit `FileChanged` and push a reload frame to every open client.
    /// Returns the number of clients the frame was queued for.
    pub fn notify_file_changed(&self, relative_path: &str) -> usize {
        self.broadcaster.emit(ServerEvent::FileChanged {
            relative_path: relative_path.to_string(),
        });

        let frame = match serde_json::to_string(&ReloadFrame::for_path(relative_path)) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Failed to encode reload frame: {}", e);
                return 0;
            }
        };

        let delivered = self.registry.broadcast(&frame);
        log::debug!("Reload for {} sent to {} client(s)", relative_path, delivered);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;

    #[tokio::test]
    async fn test_notify_file_changed_emits_and_broadcasts() {
        let config = Arc::new(ServerConfig::new(std::env::temp_dir()));
        let broadcaster = Arc::new(EventBroadcaster::new());
        let mut events = broadcaster.subscribe();
        let state = ServerAppState::new(config, Vec::new(), broadcaster);

        let (_id, mut rx) = state.registry.register();
        assert_eq!(state.notify_file_changed("css/foo.css"), 1);

        match rx.try_recv().unwrap() {
            Message::Text(text) => assert_eq!(
                text,
                r#"{"type":"reload","file":"css/foo.css","extension":".css"}"#
            ),
            other => panic!("unexpected {:?}", other),
        }
        match events.recv().await.unwrap() {
            ServerEvent::FileChanged { relative_path } => assert_eq!(relative_path, "css/foo.css"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_closing_flag() {
        let state = ServerAppState::new(
            Arc::new(ServerConfig::new(std::env::temp_dir())),
            Vec::new(),
            Arc::new(EventBroadcaster::new()),
        );
        assert!(!state.is_closing());
        state.clone().mark_closing();
        assert!(state.is_closing());
    }
}
