//! Chat & presence sync: the conversation with the selected peer and the
//! typing indicators in both directions.
//!
//! Everything here is synchronous and returns the envelopes to transmit; the
//! caller owns the relay. Timers are plain deadlines polled by the session
//! loop, so they die with this value and are cleared on peer change.
//!
//! Outgoing typing is a debounce: the first keystroke while not signaling
//! sends `isTyping: true`, every keystroke pushes the quiet deadline back, and
//! the deadline sends `isTyping: false`. A burst that starts right after the
//! deadline fired sends `true` again immediately.
//!
//! History requests are answered in the order they were sent. A response is
//! attributed to the peer whose messages it holds; one with nothing but our
//! own messages (or nothing at all) is attributed to the oldest outstanding
//! request.

use echo_common::envelope::{ChatHistory, Outbound};
use echo_common::models::{ChatMessage, Participant, PeerId, TypingSignal};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ClientError, ClientResult};

/// What a timer poll produced.
#[derive(Debug, Default, PartialEq)]
pub struct Expired {
    /// Our own `isTyping: false`, if the quiet window elapsed.
    pub outbound: Option<Outbound>,
    /// Peers whose typing indicator lapsed without a refresh.
    pub peers: Vec<PeerId>,
}

#[derive(Debug)]
pub struct ChatSync {
    quiet: Duration,
    selected: Option<Participant>,
    messages: Vec<ChatMessage>,
    compose: String,
    /// `isTyping: true` was sent and `false` is still owed.
    signaling: bool,
    typing_deadline: Option<Instant>,
    peer_typing: HashMap<PeerId, Instant>,
    /// `retrieve_chat_history` requests still waiting for a response, oldest first.
    requested: VecDeque<PeerId>,
}

impl ChatSync {
    pub fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            selected: None,
            messages: Vec::new(),
            compose: String::new(),
            signaling: false,
            typing_deadline: None,
            peer_typing: HashMap::new(),
            requested: VecDeque::new(),
        }
    }

    pub fn selected(&self) -> Option<&Participant> {
        self.selected.as_ref()
    }

    pub fn selected_id(&self) -> Option<&PeerId> {
        self.selected.as_ref().map(|p| &p.id)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn compose_buffer(&self) -> &str {
        &self.compose
    }

    pub fn is_peer_typing(&self, peer: &PeerId) -> bool {
        self.peer_typing.contains_key(peer)
    }

    /// Switch the conversation. Clears the compose buffer, the message list,
    /// and every pending timer, then asks the relay for history.
    pub fn select_peer(&mut self, participant: Participant) -> Outbound {
        tracing::debug!(peer = %participant.id, "Selecting conversation");
        let request = Outbound::RetrieveChatHistory(participant.id.clone());
        self.compose.clear();
        self.messages.clear();
        self.clear_timers();
        self.requested.push_back(participant.id.clone());
        self.selected = Some(participant);
        request
    }

    /// A local keystroke. Returns `isTyping: true` when a new burst starts.
    pub fn compose(&mut self, text: impl Into<String>, now: Instant) -> Option<Outbound> {
        self.compose = text.into();
        let to = self.selected_id()?.clone();

        self.typing_deadline = Some(now + self.quiet);
        if self.signaling {
            return None;
        }
        self.signaling = true;
        Some(Outbound::Typing { to, is_typing: true })
    }

    /// Send `body` to the selected peer and append it locally right away.
    /// Blank bodies are ignored.
    pub fn send_message(
        &mut self,
        me: &PeerId,
        sender_name: &str,
        body: &str,
    ) -> ClientResult<Option<Outbound>> {
        if body.trim().is_empty() {
            return Ok(None);
        }
        let to = self.selected_id().ok_or(ClientError::NoPeerSelected)?.clone();

        self.messages
            .push(ChatMessage::new(me.clone(), sender_name, body));
        self.compose.clear();
        Ok(Some(Outbound::PrivateMessage {
            to,
            sender_name: sender_name.to_owned(),
            message: body.to_owned(),
        }))
    }

    /// Append a relayed message. Our own sends echoed back by the relay are
    /// already in the list and are skipped.
    pub fn append_incoming(&mut self, message: ChatMessage, me: Option<&PeerId>) -> bool {
        if me == Some(&message.sender) {
            tracing::debug!("Skipping echo of our own message");
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Replace the message list with a history response, unless it belongs
    /// to a conversation that is no longer selected.
    pub fn replace_history(&mut self, history: ChatHistory, me: Option<&PeerId>) -> bool {
        let owner = match &history {
            ChatHistory::Tagged { with, .. } => Some(with.clone()),
            ChatHistory::Bare(messages) => messages
                .iter()
                .map(|m| &m.sender)
                .find(|sender| Some(*sender) != me)
                .cloned(),
        };
        let owner = match owner {
            Some(peer) => {
                self.settle_request(&peer);
                Some(peer)
            }
            None => self.requested.pop_front(),
        };

        let Some(selected) = self.selected_id() else {
            tracing::debug!("History arrived with no conversation selected");
            return false;
        };
        if owner.as_ref() != Some(selected) {
            tracing::debug!(
                selected = %selected,
                count = history.messages().len(),
                "Discarding history for a previous selection"
            );
            return false;
        }
        self.messages = history.into_messages();
        true
    }

    fn settle_request(&mut self, peer: &PeerId) {
        if let Some(at) = self.requested.iter().position(|p| p == peer) {
            self.requested.remove(at);
        }
    }

    /// A peer's typing report. Returns whether the indicator changed.
    pub fn apply_typing_signal(&mut self, signal: TypingSignal, now: Instant) -> bool {
        if signal.is_typing {
            self.peer_typing
                .insert(signal.from, now + self.quiet)
                .is_none()
        } else {
            self.peer_typing.remove(&signal.from).is_some()
        }
    }

    /// Earliest pending deadline, if any timer is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.peer_typing
            .values()
            .copied()
            .chain(self.typing_deadline)
            .min()
    }

    /// Fire every timer whose deadline is at or before `now`.
    pub fn poll_timers(&mut self, now: Instant) -> Expired {
        let mut expired = Expired::default();

        if self.typing_deadline.is_some_and(|deadline| deadline <= now) {
            self.typing_deadline = None;
            self.signaling = false;
            expired.outbound = self.selected_id().map(|to| Outbound::Typing {
                to: to.clone(),
                is_typing: false,
            });
        }

        self.peer_typing.retain(|peer, deadline| {
            let live = *deadline > now;
            if !live {
                expired.peers.push(peer.clone());
            }
            live
        });
        expired
    }

    /// Forget everything; used when the relay connection is gone.
    pub fn clear(&mut self) {
        self.selected = None;
        self.messages.clear();
        self.compose.clear();
        self.requested.clear();
        self.clear_timers();
    }

    fn clear_timers(&mut self) {
        self.signaling = false;
        self.typing_deadline = None;
        self.peer_typing.clear();
    }
}
