//! Chat message model.

use super::PeerId;
use serde::{Deserialize, Serialize};

/// A point-to-point text message.
///
/// Insertion order in a conversation is delivery order. Nothing here
/// deduplicates or reorders; the relay is assumed at-most-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "from")]
    pub sender: PeerId,
    pub sender_name: String,
    #[serde(rename = "message")]
    pub body: String,
}

impl ChatMessage {
    pub fn new(sender: PeerId, sender_name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender,
            sender_name: sender_name.into(),
            body: body.into(),
        }
    }
}

/// A typing indicator reported by a peer. Transient: it expires on its own
/// after the quiet window unless refreshed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub from: PeerId,
    pub is_typing: bool,
}
