//! What the session loop accepts from the presentation layer and what it
//! publishes back.

use echo_call::{CallPhase, RemoteStream};
use echo_common::models::{ChatMessage, MediaControlState, Participant, PeerId};

/// A local user action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SelectPeer(PeerId),
    /// The compose buffer changed (a keystroke).
    Compose(String),
    SendMessage(String),
    /// Call the selected peer.
    Call,
    HangUp,
    ToggleVideo,
    ToggleAudio,
    /// Leave the session: hang up, release subscriptions, stop the loop.
    Leave,
}

/// State changes for presentation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The relay assigned our identity.
    Connected { id: PeerId },
    /// Everyone reachable, self excluded.
    Roster(Vec<Participant>),
    PeerSelected(Participant),
    /// The message list was replaced by history.
    History(Vec<ChatMessage>),
    MessageAppended(ChatMessage),
    PeerTyping { peer: PeerId, typing: bool },
    CallPhase(CallPhase),
    IncomingCall { from: PeerId },
    CallConnected { peer: PeerId },
    CallFailed { peer: PeerId, reason: String },
    CallRejected { peer: PeerId, reason: String },
    CallEnded { peer: PeerId },
    RemoteStream { peer: PeerId, stream: RemoteStream },
    MediaControl {
        local: MediaControlState,
        peer: MediaControlState,
    },
    /// A command could not be carried out.
    Error { code: String, message: String },
    /// The relay is gone; all state was dropped.
    Disconnected,
    /// We left the session.
    Left,
}
