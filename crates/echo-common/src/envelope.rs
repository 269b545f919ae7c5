//! Relay envelope types: the wire format between a client and the relay.
//!
//! Every frame is `{"event": <name>, "data": <payload>}`. The relay forwards
//! addressed envelopes between two identities, rewriting `to` into `from`, and
//! renames a few events on the way (`incoming_call` arrives as `receive_offer`,
//! `incoming_answer` as `receive_answer`). This module lives in `echo-common`
//! so the call and client crates share it without circular deps.

use crate::models::{ChatMessage, IceCandidate, MediaControlState, Participant, PeerId, SessionDescription};
use serde::{Deserialize, Serialize};

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Outbound {
    /// Bind a display name to this connection.
    SetUsername(String),

    /// Ask for the stored conversation with a peer.
    RetrieveChatHistory(PeerId),

    #[serde(rename_all = "camelCase")]
    PrivateMessage {
        to: PeerId,
        sender_name: String,
        message: String,
    },

    #[serde(rename_all = "camelCase")]
    Typing { to: PeerId, is_typing: bool },

    #[serde(rename = "incoming_call")]
    Offer {
        to: PeerId,
        offer: SessionDescription,
    },

    #[serde(rename = "incoming_answer")]
    Answer {
        to: PeerId,
        answer: SessionDescription,
    },

    IceCandidate {
        to: PeerId,
        candidate: IceCandidate,
    },

    CallEnded { to: PeerId },

    CallRejected { to: PeerId, reason: String },

    #[serde(rename_all = "camelCase")]
    MediaController {
        to: PeerId,
        mic_enabled: bool,
        camera_enabled: bool,
    },
}

impl Outbound {
    /// Wire event name, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::SetUsername(_) => "set_username",
            Self::RetrieveChatHistory(_) => "retrieve_chat_history",
            Self::PrivateMessage { .. } => "private_message",
            Self::Typing { .. } => "typing",
            Self::Offer { .. } => "incoming_call",
            Self::Answer { .. } => "incoming_answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::CallEnded { .. } => "call_ended",
            Self::CallRejected { .. } => "call_rejected",
            Self::MediaController { .. } => "media_controller",
        }
    }

    pub fn media_controller(to: PeerId, state: MediaControlState) -> Self {
        Self::MediaController {
            to,
            mic_enabled: state.audio_enabled,
            camera_enabled: state.video_enabled,
        }
    }
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Inbound {
    /// The relay accepted the connection and assigned this identity.
    Connect { id: PeerId },

    /// Presence snapshot of every connected participant (self included).
    UsersList(Vec<Participant>),

    ChatHistory(ChatHistory),

    #[serde(rename_all = "camelCase")]
    PrivateMessage {
        from: PeerId,
        sender_name: String,
        message: String,
    },

    #[serde(rename_all = "camelCase")]
    Typing {
        #[serde(alias = "from")]
        user_id: PeerId,
        is_typing: bool,
    },

    #[serde(rename = "receive_offer")]
    Offer {
        from: PeerId,
        offer: SessionDescription,
    },

    #[serde(rename = "receive_answer")]
    Answer {
        from: PeerId,
        answer: SessionDescription,
    },

    IceCandidate {
        from: PeerId,
        candidate: IceCandidate,
    },

    CallEnded { from: PeerId },

    CallRejected {
        from: PeerId,
        #[serde(default)]
        reason: Option<String>,
    },

    CallAccepted { from: PeerId },

    #[serde(rename_all = "camelCase")]
    MediaController {
        from: PeerId,
        mic_enabled: bool,
        camera_enabled: bool,
    },
}

impl Inbound {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Connect { .. } => EnvelopeKind::Connect,
            Self::UsersList(_) => EnvelopeKind::UsersList,
            Self::ChatHistory(_) => EnvelopeKind::ChatHistory,
            Self::PrivateMessage { .. } => EnvelopeKind::PrivateMessage,
            Self::Typing { .. } => EnvelopeKind::Typing,
            Self::Offer { .. } => EnvelopeKind::Offer,
            Self::Answer { .. } => EnvelopeKind::Answer,
            Self::IceCandidate { .. } => EnvelopeKind::Candidate,
            Self::CallEnded { .. } => EnvelopeKind::CallEnded,
            Self::CallRejected { .. } => EnvelopeKind::CallRejected,
            Self::CallAccepted { .. } => EnvelopeKind::CallAccepted,
            Self::MediaController { .. } => EnvelopeKind::MediaController,
        }
    }
}

/// One inbound envelope type; the unit of subscription in the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Connect,
    UsersList,
    ChatHistory,
    PrivateMessage,
    Typing,
    Offer,
    Answer,
    Candidate,
    CallEnded,
    CallRejected,
    CallAccepted,
    MediaController,
}

impl EnvelopeKind {
    pub const ALL: [EnvelopeKind; 12] = [
        Self::Connect,
        Self::UsersList,
        Self::ChatHistory,
        Self::PrivateMessage,
        Self::Typing,
        Self::Offer,
        Self::Answer,
        Self::Candidate,
        Self::CallEnded,
        Self::CallRejected,
        Self::CallAccepted,
        Self::MediaController,
    ];
}

/// A `chat_history` response.
///
/// Relays that know which conversation they are answering for send
/// `{with, messages}`; older ones send a bare array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatHistory {
    Tagged {
        with: PeerId,
        messages: Vec<ChatMessage>,
    },
    Bare(Vec<ChatMessage>),
}

impl ChatHistory {
    pub fn messages(&self) -> &[ChatMessage] {
        match self {
            Self::Tagged { messages, .. } | Self::Bare(messages) => messages,
        }
    }

    pub fn into_messages(self) -> Vec<ChatMessage> {
        match self {
            Self::Tagged { messages, .. } | Self::Bare(messages) => messages,
        }
    }
}
