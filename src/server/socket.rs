//! Socket channel: connection registry, reload fan-out and inbound dispatch
//!
//! Every browser tab holds one WebSocket on [`SOCKET_PATH`]. Outbound frames
//! go through a per-connection queue drained by a writer task, so a slow or
//! dead client never blocks delivery to the others.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::collab::CollabFrame;
use super::ServerAppState;

/// Path of the reload/collab socket channel
pub const SOCKET_PATH: &str = "/__devlight/ws";

/// Identifier of one open socket-channel connection
pub type ConnectionId = u64;

/// Server -> client reload instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub file: String,
    pub extension: String,
}

impl ReloadFrame {
    /// Build the frame for a path relative to the project root
    pub fn for_path(relative_path: &str) -> Self {
        let extension = Path::new(relative_path)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        Self {
            kind: "reload".to_string(),
            file: relative_path.to_string(),
            extension,
        }
    }
}

/// Registry of open socket-channel connections for one server instance
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    clients: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ConnectionId, mpsc::UnboundedSender<Message>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a connection; the receiver yields the frames queued for it
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients().insert(id, tx);
        (id, rx)
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        self.clients().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a text frame for a single connection
    pub fn send_to(&self, id: ConnectionId, text: String) -> bool {
        match self.clients().get(&id) {
            Some(tx) => tx.send(Message::Text(text)).is_ok(),
            None => false,
        }
    }

    /// Queue a text frame for every open connection
    pub fn broadcast(&self, text: &str) -> usize {
        self.fan_out(None, text)
    }

    /// Queue a text frame for every open connection except `except`
    pub fn broadcast_except(&self, except: ConnectionId, text: &str) -> usize {
        self.fan_out(Some(except), text)
    }

    fn fan_out(&self, except: Option<ConnectionId>, text: &str) -> usize {
        let clients = self.clients();
        let mut delivered = 0;
        for (id, tx) in clients.iter() {
            if Some(*id) == except || tx.is_closed() {
                continue;
            }
            match tx.send(Message::Text(text.to_string())) {
                Ok(()) => delivered += 1,
                Err(_) => log::debug!("Dropping frame for closed connection {}", id),
            }
        }
        delivered
    }

    /// Drop every connection; writer tasks send a close frame and exit
    pub fn close_all(&self) -> usize {
        let mut clients = self.clients();
        let count = clients.len();
        clients.clear();
        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// WebSocket upgrade handler
pub async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerAppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Register a new connection unless the server is closing. The closing flag
/// is checked after registering so `close_all` cannot miss this connection.
fn admit(state: &ServerAppState) -> Option<(ConnectionId, mpsc::UnboundedReceiver<Message>)> {
    let (id, outbound) = state.registry.register();
    if state.is_closing() {
        state.registry.unregister(id);
        return None;
    }
    Some((id, outbound))
}

/// Handle a socket-channel connection
async fn handle_socket(socket: WebSocket, state: ServerAppState) {
    let Some((id, mut outbound)) = admit(&state) else {
        log::debug!("Rejecting socket connection during shutdown");
        return;
    };

    let (mut sender, mut receiver) = socket.split();

    log::info!(
        "Socket client {} connected ({} open)",
        id,
        state.registry.len()
    );

    // Forward queued frames to this client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if let Err(e) = sender.send(msg).await {
                log::debug!("Socket client {} write failed: {}", id, e);
                return;
            }
        }
        // Registry dropped us (server stopping)
        let _ = sender.send(Message::Close(None)).await;
    });

    while let Some(result) = receiver.next().await {
        match result {
            Ok(Message::Text(text)) => dispatch_frame(&state, id, &text),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                log::trace!("Socket client {} keepalive", id);
            }
            Ok(Message::Binary(_)) => {
                log::debug!("Ignoring binary frame from socket client {}", id);
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                log::debug!("Socket client {} error: {}", id, e);
                break;
            }
        }
    }

    // Clean up
    state.registry.unregister(id);
    send_task.abort();
    log::info!(
        "Socket client {} disconnected ({} open)",
        id,
        state.registry.len()
    );
}

/// Route an inbound text frame; only collab frames have an effect
pub(crate) fn dispatch_frame(state: &ServerAppState, sender: ConnectionId, text: &str) {
    match CollabFrame::parse(text) {
        Ok(Some(frame)) => state.collab.handle(&state.registry, sender, frame, text),
        Ok(None) => log::trace!("Ignoring non-collab frame from socket client {}", sender),
        Err(e) => log::debug!("Dropping malformed frame from socket client {}: {}", sender, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> Option<String> {
        match rx.try_recv().ok()? {
            Message::Text(text) => Some(text),
            _ => None,
        }
    }

    #[test]
    fn test_admit_refuses_connections_once_closing() {
        let config = crate::config::ServerConfig::new(std::env::temp_dir());
        let state = ServerAppState::new(
            std::sync::Arc::new(config),
            Vec::new(),
            std::sync::Arc::new(super::super::EventBroadcaster::new()),
        );

        let (id, _rx) = admit(&state).unwrap();
        assert_eq!(state.registry.len(), 1);
        state.registry.unregister(id);

        state.mark_closing();
        assert!(admit(&state).is_none());
        assert!(state.registry.is_empty());
    }

    #[test]
    fn test_reload_frame_shape() {
        let frame = ReloadFrame::for_path("foo.css");
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"reload","file":"foo.css","extension":".css"}"#);

        assert_eq!(ReloadFrame::for_path("Makefile").extension, "");
        assert_eq!(ReloadFrame::for_path("a/b/app.min.js").extension, ".js");
    }

    #[test]
    fn test_broadcast_reaches_every_open_connection() {
        let registry = ConnectionRegistry::new();
        let mut receivers: Vec<_> = (0..4).map(|_| registry.register().1).collect();

        assert_eq!(registry.broadcast("hello"), 4);
        for rx in receivers.iter_mut() {
            assert_eq!(recv_text(rx).as_deref(), Some("hello"));
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_broadcast_skips_closed_connections() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = registry.register();
        let (b, rx_b) = registry.register();
        let (_c, mut rx_c) = registry.register();

        // b's writer is gone but it has not been unregistered yet
        drop(rx_b);
        assert_eq!(registry.broadcast("x"), 2);
        assert_eq!(recv_text(&mut rx_a).as_deref(), Some("x"));
        assert_eq!(recv_text(&mut rx_c).as_deref(), Some("x"));

        assert!(registry.unregister(b));
        assert!(!registry.unregister(b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_broadcast_except_and_send_to() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = registry.register();
        let (b, mut rx_b) = registry.register();

        assert_eq!(registry.broadcast_except(a, "edit"), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(recv_text(&mut rx_b).as_deref(), Some("edit"));

        assert!(registry.send_to(a, "state".to_string()));
        assert_eq!(recv_text(&mut rx_a).as_deref(), Some("state"));
        assert!(!registry.send_to(b + 100, "nobody".to_string()));
    }

    #[test]
    fn test_close_all_clears_registry() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx) = registry.register();
        registry.register();

        assert_eq!(registry.close_all(), 2);
        assert!(registry.is_empty());
        // Sender dropped: the writer task sees the channel end
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
