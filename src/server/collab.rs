//! Collaboration relay multiplexed on the socket channel
//!
//! Frames carry the envelope `{channel:"collab", type, docId, userId, ...}`.
//! Each document keeps last-writer-wins content, one cursor per user and a
//! comment list keyed by comment id. Edits are rebroadcast channel-wide to
//! every connection except the sender.

use super::socket::{ConnectionId, ConnectionRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Channel name that routes a frame to the relay
pub const COLLAB_CHANNEL: &str = "collab";

/// Why an inbound collab frame was dropped
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollabError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("collab frame is missing docId")]
    MissingDocId,
    #[error("collab frame is missing type")]
    MissingType,
    #[error("'{0}' frame is missing required field '{1}'")]
    MissingField(String, &'static str),
    #[error("comment has no id")]
    CommentWithoutId,
}

/// A comment record; only `id` is interpreted, everything else is opaque
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Value,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// The known collab message types, plus a catch-all that is ignored
#[derive(Debug, Clone, PartialEq)]
pub enum CollabAction {
    GetState,
    DocSync { content: String },
    CursorSync { cursor: Value },
    CommentAdd { comment: Comment },
    CommentRemove { comment_id: Value },
    Unknown(String),
}

/// A parsed collab frame addressed to one document
#[derive(Debug, Clone, PartialEq)]
pub struct CollabFrame {
    pub doc_id: String,
    pub user_id: Option<String>,
    pub action: CollabAction,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    channel: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    doc_id: Option<String>,
    user_id: Option<String>,
    content: Option<Value>,
    cursor: Option<Value>,
    comment: Option<Value>,
}

impl CollabFrame {
    /// Parse a text frame.
    ///
    /// `Ok(None)` means the frame does not belong to the collab channel.
    pub fn parse(text: &str) -> Result<Option<CollabFrame>, CollabError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| CollabError::InvalidJson(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Same as [`CollabFrame::parse`] for an already-decoded JSON value
    pub fn from_value(value: Value) -> Result<Option<CollabFrame>, CollabError> {
        let raw: RawFrame =
            serde_json::from_value(value).map_err(|e| CollabError::InvalidJson(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawFrame) -> Result<Option<CollabFrame>, CollabError> {
        if raw.channel.as_deref() != Some(COLLAB_CHANNEL) {
            return Ok(None);
        }

        let kind = raw.kind.ok_or(CollabError::MissingType)?;
        let doc_id = raw
            .doc_id
            .filter(|d| !d.is_empty())
            .ok_or(CollabError::MissingDocId)?;

        let action = match kind.as_str() {
            "get-state" => CollabAction::GetState,
            "doc-sync" => match raw.content {
                Some(Value::String(content)) => CollabAction::DocSync { content },
                _ => return Err(CollabError::MissingField(kind, "content")),
            },
            "cursor-sync" => {
                if raw.user_id.is_none() {
                    return Err(CollabError::MissingField(kind, "userId"));
                }
                let cursor = raw
                    .cursor
                    .ok_or_else(|| CollabError::MissingField(kind.clone(), "cursor"))?;
                CollabAction::CursorSync { cursor }
            }
            "comment-add" => {
                let comment = raw
                    .comment
                    .ok_or_else(|| CollabError::MissingField(kind.clone(), "comment"))?;
                let comment: Comment =
                    serde_json::from_value(comment).map_err(|_| CollabError::CommentWithoutId)?;
                if comment.id.is_null() {
                    return Err(CollabError::CommentWithoutId);
                }
                CollabAction::CommentAdd { comment }
            }
            "comment-remove" => {
                let comment = raw
                    .comment
                    .ok_or_else(|| CollabError::MissingField(kind.clone(), "comment"))?;
                match comment.get("id") {
                    Some(id) if !id.is_null() => CollabAction::CommentRemove {
                        comment_id: id.clone(),
                    },
                    _ => return Err(CollabError::CommentWithoutId),
                }
            }
            _ => CollabAction::Unknown(kind),
        };

        Ok(Some(CollabFrame {
            doc_id,
            user_id: raw.user_id,
            action,
        }))
    }
}

/// Shared state of one collaborative document
#[derive(Debug, Clone, Default)]
pub struct CollabDocument {
    pub content: String,
    pub cursors: BTreeMap<String, Value>,
    pub comments: Vec<Comment>,
    last_used: u64,
}

/// Reply to `get-state`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StateReply<'a> {
    channel: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    doc_id: &'a str,
    content: &'a str,
    cursors: &'a BTreeMap<String, Value>,
    comments: &'a [Comment],
}

/// Document map with least-recently-used eviction
struct DocumentStore {
    docs: HashMap<String, CollabDocument>,
    capacity: usize,
    clock: u64,
}

impl DocumentStore {
    fn new(capacity: usize) -> Self {
        Self {
            docs: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    /// Get a document, creating it empty on first reference
    fn touch(&mut self, doc_id: &str) -> &mut CollabDocument {
        self.clock += 1;
        if !self.docs.contains_key(doc_id) {
            if self.docs.len() >= self.capacity {
                self.evict_oldest();
            }
            log::debug!("Creating collab document '{}'", doc_id);
            self.docs.insert(doc_id.to_string(), CollabDocument::default());
        }
        let clock = self.clock;
        let doc = self.docs.entry(doc_id.to_string()).or_default();
        doc.last_used = clock;
        doc
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .docs
            .iter()
            .min_by_key(|(_, doc)| doc.last_used)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            log::debug!("Evicting least recently used collab document '{}'", id);
            self.docs.remove(&id);
        }
    }
}

/// Per-server collaboration relay
pub struct CollabRelay {
    store: Mutex<DocumentStore>,
}

impl CollabRelay {
    pub fn new(max_documents: usize) -> Self {
        Self {
            store: Mutex::new(DocumentStore::new(max_documents)),
        }
    }

    fn store(&self) -> MutexGuard<'_, DocumentStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a frame from `sender` and fan it out.
    ///
    /// `raw` is the original text, rebroadcast verbatim. The store lock is
    /// held while enqueueing so every client sees edits in apply order.
    pub fn handle(
        &self,
        registry: &ConnectionRegistry,
        sender: ConnectionId,
        frame: CollabFrame,
        raw: &str,
    ) {
        let mut store = self.store();
        let doc = store.touch(&frame.doc_id);

        match frame.action {
            CollabAction::GetState => {
                let reply = StateReply {
                    channel: COLLAB_CHANNEL,
                    kind: "state",
                    doc_id: &frame.doc_id,
                    content: &doc.content,
                    cursors: &doc.cursors,
                    comments: &doc.comments,
                };
                match serde_json::to_string(&reply) {
                    Ok(json) => {
                        if !registry.send_to(sender, json) {
                            log::debug!("State reply for '{}' not delivered", frame.doc_id);
                        }
                    }
                    Err(e) => log::warn!("Failed to serialize collab state: {}", e),
                }
                return;
            }
            CollabAction::DocSync { content } => {
                doc.content = content;
            }
            CollabAction::CursorSync { cursor } => {
                if let Some(user_id) = frame.user_id {
                    doc.cursors.insert(user_id, cursor);
                }
            }
            CollabAction::CommentAdd { comment } => {
                doc.comments.push(comment);
            }
            CollabAction::CommentRemove { comment_id } => {
                doc.comments.retain(|c| c.id != comment_id);
            }
            CollabAction::Unknown(kind) => {
                log::trace!("Ignoring unknown collab type '{}'", kind);
                return;
            }
        }

        let delivered = registry.broadcast_except(sender, raw);
        log::trace!(
            "Relayed collab frame for '{}' to {} client(s)",
            frame.doc_id,
            delivered
        );
    }

    /// Snapshot of a document, if it exists
    pub fn document(&self, doc_id: &str) -> Option<CollabDocument> {
        self.store().docs.get(doc_id).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.store().docs.len()
    }
}
