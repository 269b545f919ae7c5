//! Signaling dispatcher: routes relay envelopes into the call machine, the
//! media control sync, and the chat sync, and local commands the other way.
//!
//! Each inbound envelope type has exactly one handler. [`Subscriptions`]
//! records which types are live; subscribing twice is a no-op, and teardown
//! releases all of them at once so nothing is delivered after leaving.

use echo_call::{
    CallController, CallError, CallOutcome, CallPhase, MediaControl, MediaEngine, Negotiation,
    SessionNotice, SessionSignal,
};
use echo_common::envelope::{EnvelopeKind, Inbound, Outbound};
use echo_common::models::{
    ChatMessage, MediaControlState, MediaKind, Participant, PeerId, SessionDescription,
    TypingSignal,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chat::ChatSync;
use crate::error::{ClientError, ClientResult};
use crate::event::{ClientEvent, Command};
use crate::session::SessionSettings;

/// Reason sent with `call_rejected` when an offer arrives mid-call.
pub const BUSY: &str = "busy";

/// The set of envelope types with a live handler.
#[derive(Debug, Default)]
pub struct Subscriptions {
    active: HashSet<EnvelopeKind>,
}

impl Subscriptions {
    /// Register the handler for `kind`. Returns `false` if it already was.
    pub fn subscribe(&mut self, kind: EnvelopeKind) -> bool {
        self.active.insert(kind)
    }

    pub fn subscribe_all(&mut self) {
        for kind in EnvelopeKind::ALL {
            self.subscribe(kind);
        }
    }

    pub fn is_subscribed(&self, kind: EnvelopeKind) -> bool {
        self.active.contains(&kind)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Drop every handler. Returns how many were live.
    pub fn release_all(&mut self) -> usize {
        let released = self.active.len();
        self.active.clear();
        released
    }
}

pub struct Dispatcher {
    username: String,
    identity: Option<PeerId>,
    roster: Vec<Participant>,
    call: CallController,
    media: MediaControl,
    chat: ChatSync,
    subscriptions: Subscriptions,
    relay: mpsc::UnboundedSender<Outbound>,
    events: broadcast::Sender<ClientEvent>,
}

impl Dispatcher {
    /// Build the dispatcher and its call machine. The returned receiver carries
    /// engine reports for [`Self::on_session_signal`].
    pub fn new(
        username: impl Into<String>,
        engine: Arc<dyn MediaEngine>,
        settings: &SessionSettings,
        relay: mpsc::UnboundedSender<Outbound>,
        events: broadcast::Sender<ClientEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionSignal>) {
        let (call, signals) =
            CallController::new(engine, settings.ice_servers.clone(), relay.clone());
        let mut subscriptions = Subscriptions::default();
        subscriptions.subscribe_all();

        let dispatcher = Self {
            username: username.into(),
            identity: None,
            roster: Vec::new(),
            call,
            media: MediaControl::new(),
            chat: ChatSync::new(settings.typing_quiet),
            subscriptions,
            relay,
            events,
        };
        (dispatcher, signals)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn identity(&self) -> Option<&PeerId> {
        self.identity.as_ref()
    }

    pub fn roster(&self) -> &[Participant] {
        &self.roster
    }

    pub fn call(&self) -> &CallController {
        &self.call
    }

    pub fn chat(&self) -> &ChatSync {
        &self.chat
    }

    pub fn media(&self) -> &MediaControl {
        &self.media
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    /// Announce our display name to the relay.
    pub fn join(&self) {
        self.transmit(Outbound::SetUsername(self.username.clone()));
    }

    // === Inbound ===

    /// Route one relay envelope. Returns the negotiation to drive when the
    /// envelope started one.
    pub async fn dispatch(&mut self, envelope: Inbound) -> Option<Negotiation> {
        let kind = envelope.kind();
        if !self.subscriptions.is_subscribed(kind) {
            debug!(?kind, "No handler for envelope, dropping");
            return None;
        }

        match envelope {
            Inbound::Connect { id } => {
                info!(id = %id, "Relay assigned identity");
                self.identity = Some(id.clone());
                self.emit(ClientEvent::Connected { id });
            }
            Inbound::UsersList(participants) => {
                self.roster = participants
                    .into_iter()
                    .filter(|p| Some(&p.id) != self.identity.as_ref())
                    .collect();
                self.emit(ClientEvent::Roster(self.roster.clone()));
            }
            Inbound::ChatHistory(history) => {
                if self.chat.replace_history(history, self.identity.as_ref()) {
                    self.emit(ClientEvent::History(self.chat.messages().to_vec()));
                }
            }
            Inbound::PrivateMessage {
                from,
                sender_name,
                message,
            } => {
                let message = ChatMessage::new(from, sender_name, message);
                if self
                    .chat
                    .append_incoming(message.clone(), self.identity.as_ref())
                {
                    self.emit(ClientEvent::MessageAppended(message));
                }
            }
            Inbound::Typing { user_id, is_typing } => {
                let signal = TypingSignal {
                    from: user_id.clone(),
                    is_typing,
                };
                if self.chat.apply_typing_signal(signal, Instant::now()) {
                    self.emit(ClientEvent::PeerTyping {
                        peer: user_id,
                        typing: is_typing,
                    });
                }
            }
            Inbound::Offer { from, offer } => {
                return self.on_offer(from, offer);
            }
            Inbound::Answer { from, answer } => match self.call.receive_answer(from, answer) {
                Ok(negotiation) => return Some(negotiation),
                Err(e) => debug!(error = %e, "Ignoring answer"),
            },
            Inbound::IceCandidate { from, candidate } => {
                match self.call.receive_candidate(&from, candidate).await {
                    Ok(disposition) => debug!(peer = %from, ?disposition, "Remote candidate"),
                    Err(e) => debug!(peer = %from, error = %e, "Ignoring candidate"),
                }
            }
            Inbound::CallEnded { from } => match self.call.receive_call_ended(&from).await {
                Ok(peer) => self.call_over(peer),
                Err(e) => debug!(peer = %from, error = %e, "Ignoring call_ended"),
            },
            Inbound::CallRejected { from, reason } => {
                match self.call.receive_rejection(&from).await {
                    Ok(peer) => {
                        let reason = reason.unwrap_or_else(|| BUSY.to_owned());
                        self.emit(ClientEvent::CallRejected {
                            peer: peer.clone(),
                            reason,
                        });
                        self.call_over(peer);
                    }
                    Err(e) => debug!(peer = %from, error = %e, "Ignoring call_rejected"),
                }
            }
            Inbound::CallAccepted { from } => {
                info!(peer = %from, "Peer accepted the call");
            }
            Inbound::MediaController {
                from,
                mic_enabled,
                camera_enabled,
            } => {
                let known = self.chat.selected_id() == Some(&from)
                    || self.call.peer().as_ref() == Some(&from);
                if !known {
                    debug!(peer = %from, "Ignoring media control from an unrelated peer");
                    return None;
                }
                self.media.apply_peer_control(MediaControlState {
                    video_enabled: camera_enabled,
                    audio_enabled: mic_enabled,
                });
                self.emit_media();
            }
        }
        None
    }

    fn on_offer(
        &mut self,
        from: PeerId,
        offer: SessionDescription,
    ) -> Option<Negotiation> {
        match self.call.receive_offer(from.clone(), offer) {
            Ok(negotiation) => {
                self.emit(ClientEvent::IncomingCall { from });
                self.emit(ClientEvent::CallPhase(CallPhase::IncomingOffer));
                Some(negotiation)
            }
            Err(CallError::Busy { peer }) => {
                warn!(caller = %from, current = %peer, "Offer while busy, rejecting");
                self.transmit(Outbound::CallRejected {
                    to: from,
                    reason: BUSY.to_owned(),
                });
                None
            }
            Err(e) => {
                debug!(peer = %from, error = %e, "Ignoring offer");
                None
            }
        }
    }

    // === Local commands ===

    /// Carry out a local action. [`Command::Leave`] is handled by the session
    /// loop through [`Self::teardown`].
    pub async fn handle_command(&mut self, command: Command) -> ClientResult<Option<Negotiation>> {
        match command {
            Command::SelectPeer(id) => {
                let participant = self
                    .roster
                    .iter()
                    .find(|p| p.id == id)
                    .cloned()
                    .ok_or_else(|| ClientError::UnknownPeer(id.to_string()))?;
                let request = self.chat.select_peer(participant.clone());
                self.transmit(request);
                self.emit(ClientEvent::PeerSelected(participant));
            }
            Command::Compose(text) => {
                if let Some(typing) = self.chat.compose(text, Instant::now()) {
                    self.transmit(typing);
                }
            }
            Command::SendMessage(body) => {
                let me = self.identity.clone().ok_or(ClientError::NotIdentified)?;
                if let Some(envelope) = self.chat.send_message(&me, &self.username, &body)? {
                    self.transmit(envelope);
                    if let Some(message) = self.chat.messages().last() {
                        self.emit(ClientEvent::MessageAppended(message.clone()));
                    }
                }
            }
            Command::Call => {
                let peer = self
                    .chat
                    .selected_id()
                    .cloned()
                    .ok_or(ClientError::NoPeerSelected)?;
                let negotiation = self.call.initiate_call(peer)?;
                self.emit(ClientEvent::CallPhase(CallPhase::OutgoingOffer));
                return Ok(Some(negotiation));
            }
            Command::HangUp => {
                let peer = self.call.end_call().await?;
                self.call_over(peer);
            }
            Command::ToggleVideo => self.toggle(MediaKind::Video),
            Command::ToggleAudio => self.toggle(MediaKind::Audio),
            Command::Leave => self.teardown(true).await,
        }
        Ok(None)
    }

    fn toggle(&mut self, kind: MediaKind) {
        if let Some(envelope) = self.media.toggle_self(kind, self.chat.selected_id()) {
            self.transmit(envelope);
        }
        self.emit_media();
    }

    // === Call and engine results ===

    /// Publish how a negotiation finished.
    pub fn on_outcome(&mut self, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Offered { peer } => debug!(peer = %peer, "Waiting for answer"),
            CallOutcome::Answered { peer } | CallOutcome::Connected { peer } => {
                self.emit(ClientEvent::CallPhase(CallPhase::Active));
                self.emit(ClientEvent::CallConnected { peer });
            }
            CallOutcome::Failed { peer, error } => {
                self.media.reset();
                self.emit(ClientEvent::CallFailed {
                    peer,
                    reason: error.to_string(),
                });
                self.emit(ClientEvent::CallPhase(self.call.phase()));
                self.emit_media();
            }
            CallOutcome::Superseded { generation } => {
                debug!(generation, "Negotiation finished for an ended session");
            }
        }
    }

    /// Handle an engine report. Losing media connectivity ends the call as a
    /// local hang-up would.
    pub async fn on_session_signal(&mut self, signal: SessionSignal) {
        match self.call.on_session_signal(signal) {
            Some(SessionNotice::RemoteStream { peer, stream }) => {
                info!(peer = %peer, stream = %stream.id, "Remote stream available");
                self.emit(ClientEvent::RemoteStream { peer, stream });
            }
            Some(SessionNotice::ConnectionLost { peer }) => {
                warn!(peer = %peer, "Media connection lost, ending call");
                if let Ok(peer) = self.call.end_call().await {
                    self.call_over(peer);
                }
            }
            None => {}
        }
    }

    /// Fire due typing timers.
    pub fn poll_timers(&mut self, now: Instant) {
        let expired = self.chat.poll_timers(now);
        if let Some(envelope) = expired.outbound {
            self.transmit(envelope);
        }
        for peer in expired.peers {
            self.emit(ClientEvent::PeerTyping {
                peer,
                typing: false,
            });
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.chat.next_deadline()
    }

    /// Release every subscription and force-end any call. With `notify_peer`
    /// the peer is told the call ended; without it (relay gone) all session
    /// state is dropped as well.
    pub async fn teardown(&mut self, notify_peer: bool) {
        let released = self.subscriptions.release_all();
        let ended = if notify_peer {
            self.call.end_call().await.ok()
        } else {
            self.call.shutdown().await
        };
        if let Some(peer) = ended {
            self.call_over(peer);
        }
        self.chat.clear();
        if !notify_peer {
            self.roster.clear();
            self.identity = None;
        }
        info!(released, "Session torn down");
    }

    pub fn report(&self, error: &ClientError) {
        warn!(code = error.error_code(), error = %error, "Command failed");
        self.emit(ClientEvent::Error {
            code: error.error_code().to_owned(),
            message: error.to_string(),
        });
    }

    pub fn emit(&self, event: ClientEvent) {
        // No subscribers is fine; presentation may not be attached.
        let _ = self.events.send(event);
    }

    fn call_over(&mut self, peer: PeerId) {
        self.media.reset();
        self.emit(ClientEvent::CallEnded { peer });
        self.emit(ClientEvent::CallPhase(self.call.phase()));
        self.emit_media();
    }

    fn emit_media(&self) {
        self.emit(ClientEvent::MediaControl {
            local: self.media.self_state(),
            peer: self.media.peer_state(),
        });
    }

    fn transmit(&self, envelope: Outbound) {
        let event = envelope.event_name();
        if self.relay.send(envelope).is_err() {
            warn!(event, "Relay closed, envelope dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echo_call::testing::FakeEngine;
    use echo_common::envelope::ChatHistory;
    use echo_common::models::IceServer;
    use std::time::Duration;

    struct Harness {
        dispatcher: Dispatcher,
        sent: mpsc::UnboundedReceiver<Outbound>,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
        events: broadcast::Receiver<ClientEvent>,
    }

    impl Harness {
        async fn new(engine: &FakeEngine) -> Self {
            let settings = SessionSettings {
                ice_servers: IceServer::default_stun(),
                typing_quiet: Duration::from_millis(500),
            };
            let (relay, sent) = mpsc::unbounded_channel();
            let (events_tx, events) = broadcast::channel(64);
            let (mut dispatcher, signals) =
                Dispatcher::new("Me", Arc::new(engine.clone()), &settings, relay, events_tx);

            dispatcher.dispatch(Inbound::Connect { id: "me".into() }).await;
            dispatcher
                .dispatch(Inbound::UsersList(vec![
                    Participant::new("me", "Me"),
                    Participant::new("alice", "Alice"),
                    Participant::new("bob", "Bob"),
                ]))
                .await;
            Self {
                dispatcher,
                sent,
                signals,
                events,
            }
        }

        fn sent(&mut self) -> Vec<Outbound> {
            let mut sent = Vec::new();
            while let Ok(envelope) = self.sent.try_recv() {
                sent.push(envelope);
            }
            sent
        }

        fn events(&mut self) -> Vec<ClientEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        async fn select(&mut self, peer: &str) {
            self.dispatcher
                .handle_command(Command::SelectPeer(peer.into()))
                .await
                .unwrap();
        }

        /// Take an incoming call from `from` through to active.
        async fn accept_call(&mut self, from: &str) {
            let negotiation = self
                .dispatcher
                .dispatch(Inbound::Offer {
                    from: from.into(),
                    offer: SessionDescription::offer("v=0 caller"),
                })
                .await
                .expect("offer starts a negotiation");
            let outcome = negotiation.await;
            self.dispatcher.on_outcome(outcome);
            assert_eq!(self.dispatcher.call().phase(), CallPhase::Active);
        }
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut subs = Subscriptions::default();
        assert!(subs.subscribe(EnvelopeKind::Offer));
        assert!(!subs.subscribe(EnvelopeKind::Offer));
        assert_eq!(subs.len(), 1);

        subs.subscribe_all();
        assert_eq!(subs.len(), EnvelopeKind::ALL.len());
        assert_eq!(subs.release_all(), EnvelopeKind::ALL.len());
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn test_roster_excludes_self() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine).await;
        let ids: Vec<_> = h.dispatcher.roster().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["alice", "bob"]);
        assert!(h.sent().is_empty());
        assert!(h.events().contains(&ClientEvent::Connected { id: "me".into() }));
    }

    #[tokio::test]
    async fn test_select_requests_history_and_rejects_unknown() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine).await;

        h.select("alice").await;
        assert_eq!(h.sent(), vec![Outbound::RetrieveChatHistory("alice".into())]);

        let unknown = h
            .dispatcher
            .handle_command(Command::SelectPeer("zed".into()))
            .await;
        assert!(matches!(unknown, Err(ClientError::UnknownPeer(_))));
        assert_eq!(h.dispatcher.chat().selected_id(), Some(&PeerId::from("alice")));
    }

    #[tokio::test]
    async fn test_stale_history_after_reselect() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine).await;
        h.select("alice").await;
        h.select("bob").await;

        h.dispatcher
            .dispatch(Inbound::ChatHistory(ChatHistory::Bare(vec![
                ChatMessage::new("alice".into(), "Alice", "late"),
            ])))
            .await;
        assert!(h.dispatcher.chat().messages().is_empty());

        h.dispatcher
            .dispatch(Inbound::ChatHistory(ChatHistory::Tagged {
                with: "bob".into(),
                messages: vec![ChatMessage::new("bob".into(), "Bob", "hi")],
            }))
            .await;
        assert_eq!(h.dispatcher.chat().messages().len(), 1);
    }

    #[tokio::test]
    async fn test_sent_message_shown_once_despite_echo() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine).await;
        h.select("bob").await;
        h.sent();

        h.dispatcher
            .handle_command(Command::SendMessage("hi".into()))
            .await
            .unwrap();
        assert_eq!(
            h.sent(),
            vec![Outbound::PrivateMessage {
                to: "bob".into(),
                sender_name: "Me".into(),
                message: "hi".into(),
            }]
        );

        h.dispatcher
            .dispatch(Inbound::PrivateMessage {
                from: "me".into(),
                sender_name: "Me".into(),
                message: "hi".into(),
            })
            .await;
        assert_eq!(h.dispatcher.chat().messages().len(), 1);

        h.dispatcher
            .dispatch(Inbound::PrivateMessage {
                from: "bob".into(),
                sender_name: "Bob".into(),
                message: "hey".into(),
            })
            .await;
        assert_eq!(h.dispatcher.chat().messages().len(), 2);
    }

    #[tokio::test]
    async fn test_call_requires_selected_peer() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine).await;
        let result = h.dispatcher.handle_command(Command::Call).await;
        assert!(matches!(result, Err(ClientError::NoPeerSelected)));
        assert_eq!(h.dispatcher.call().phase(), CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_offer_while_busy_is_rejected() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine).await;
        h.accept_call("alice").await;
        h.sent();

        let second = h
            .dispatcher
            .dispatch(Inbound::Offer {
                from: "bob".into(),
                offer: SessionDescription::offer("v=0 bob"),
            })
            .await;
        assert!(second.is_none());
        assert_eq!(
            h.sent(),
            vec![Outbound::CallRejected {
                to: "bob".into(),
                reason: BUSY.into(),
            }]
        );
        assert_eq!(h.dispatcher.call().peer(), Some(PeerId::from("alice")));
        assert_eq!(h.dispatcher.call().phase(), CallPhase::Active);
    }

    #[tokio::test]
    async fn test_media_toggle_pushes_full_state_to_selected_peer() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine).await;

        h.dispatcher.handle_command(Command::ToggleAudio).await.unwrap();
        assert!(h.sent().is_empty());

        h.select("bob").await;
        h.sent();
        h.dispatcher.handle_command(Command::ToggleVideo).await.unwrap();
        assert_eq!(
            h.sent(),
            vec![Outbound::MediaController {
                to: "bob".into(),
                mic_enabled: false,
                camera_enabled: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_peer_media_control_and_reset_on_hangup() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine).await;
        h.accept_call("alice").await;

        h.dispatcher
            .dispatch(Inbound::MediaController {
                from: "alice".into(),
                mic_enabled: false,
                camera_enabled: true,
            })
            .await;
        assert!(!h.dispatcher.media().peer_state().audio_enabled);

        h.dispatcher
            .dispatch(Inbound::CallEnded { from: "alice".into() })
            .await;
        assert_eq!(h.dispatcher.call().phase(), CallPhase::Idle);
        assert_eq!(h.dispatcher.media().peer_state(), MediaControlState::default());
        assert!(h.events().contains(&ClientEvent::CallEnded { peer: "alice".into() }));

        let log = engine.log();
        assert_eq!(log.live_media(), 0);
        assert_eq!(log.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_ends_call_and_notifies_peer() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine).await;
        h.accept_call("alice").await;
        h.sent();

        engine.session_events(0).unwrap().connection_lost();
        let signal = h.signals.recv().await.unwrap();
        h.dispatcher.on_session_signal(signal).await;

        assert_eq!(h.dispatcher.call().phase(), CallPhase::Idle);
        assert_eq!(h.sent(), vec![Outbound::CallEnded { to: "alice".into() }]);
    }

    #[tokio::test]
    async fn test_failed_negotiation_reports_call_failed() {
        let engine = FakeEngine::new().fail_media();
        let mut h = Harness::new(&engine).await;
        h.select("bob").await;
        h.events();

        let negotiation = h
            .dispatcher
            .handle_command(Command::Call)
            .await
            .unwrap()
            .expect("call starts a negotiation");
        let outcome = negotiation.await;
        h.dispatcher.on_outcome(outcome);

        let events = h.events();
        assert!(events.iter().any(|e| matches!(e, ClientEvent::CallFailed { .. })));
        assert_eq!(events.last(), Some(&ClientEvent::MediaControl {
            local: MediaControlState::default(),
            peer: MediaControlState::default(),
        }));
        assert!(!h.sent().iter().any(|e| matches!(e, Outbound::Offer { .. })));
    }

    #[tokio::test]
    async fn test_teardown_releases_handlers_and_ends_call() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine).await;
        h.accept_call("alice").await;
        h.sent();

        h.dispatcher.handle_command(Command::Leave).await.unwrap();
        assert!(h.dispatcher.subscriptions().is_empty());
        assert_eq!(h.sent(), vec![Outbound::CallEnded { to: "alice".into() }]);

        // Nothing is delivered after leaving
        h.dispatcher
            .dispatch(Inbound::PrivateMessage {
                from: "alice".into(),
                sender_name: "Alice".into(),
                message: "still there?".into(),
            })
            .await;
        assert!(h.dispatcher.chat().messages().is_empty());
        assert_eq!(engine.log().live_media(), 0);
    }

    #[tokio::test]
    async fn test_relay_loss_drops_all_state() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine).await;
        h.select("bob").await;
        h.accept_call("alice").await;
        h.sent();

        h.dispatcher.teardown(false).await;
        assert!(h.sent().is_empty());
        assert!(h.dispatcher.roster().is_empty());
        assert!(h.dispatcher.identity().is_none());
        assert!(h.dispatcher.chat().selected().is_none());
        assert_eq!(h.dispatcher.call().phase(), CallPhase::Idle);
    }
}
