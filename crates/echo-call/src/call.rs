//! Call state machine: the lifecycle of the single one-to-one call session.
//!
//! ```text
//!   Idle ──initiate_call──▶ OutgoingOffer ──receive_answer──▶ Active
//!   Idle ──receive_offer──▶ IncomingOffer ──answer sent─────▶ Active
//!   any ──end_call / receive_call_ended / failure──▶ Ended ──▶ Idle
//! ```
//!
//! Entry points validate and reserve the session synchronously, then hand back
//! a [`Negotiation`] future for the suspending part (media acquisition, session
//! creation, offer/answer, descriptions). Every time such a future resumes it
//! re-checks the session generation before touching state, so a step that
//! completes after `end_call` releases what it produced and reports
//! [`CallOutcome::Superseded`] instead of mutating the next session.
//!
//! Call state sits behind a mutex that is never held across an `.await`.

use crate::candidates::CandidateBuffer;
use crate::engine::{
    LocalMedia, MediaEngine, PeerSession, RemoteStream, SessionEvents, SessionSignal, SignalKind,
};
use crate::error::{CallError, CallResult};
use echo_common::envelope::Outbound;
use echo_common::models::{IceCandidate, IceServer, PeerId, SessionDescription};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Where the call lifecycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    /// We are producing or have sent an offer and wait for the answer.
    OutgoingOffer,
    /// We received an offer and are producing the answer.
    IncomingOffer,
    Active,
    /// Teardown in progress; always followed by `Idle`.
    Ended,
}

/// The suspending remainder of a call operation.
pub type Negotiation = BoxFuture<'static, CallOutcome>;

/// How a [`Negotiation`] finished.
#[derive(Debug)]
pub enum CallOutcome {
    /// Offer transmitted; waiting for the peer's answer.
    Offered { peer: PeerId },
    /// Answer transmitted; the call is active.
    Answered { peer: PeerId },
    /// The peer's answer was applied; the call is active.
    Connected { peer: PeerId },
    /// The attempt failed and the machine is back to `Idle`.
    Failed { peer: PeerId, error: CallError },
    /// The session this step belonged to ended while it was suspended.
    Superseded { generation: u64 },
}

/// What happened to an inbound candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Held until the remote description is set.
    Buffered,
    Applied,
    /// The session refused it; logged and skipped.
    Skipped,
}

/// Engine reports the client has to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    RemoteStream { peer: PeerId, stream: RemoteStream },
    ConnectionLost { peer: PeerId },
}

struct CallSession {
    generation: u64,
    peer: PeerId,
    handle: Option<Arc<dyn PeerSession>>,
    media: Option<LocalMedia>,
    candidates: CandidateBuffer,
    /// Remote description applied and the buffer flushed.
    remote_ready: bool,
    offer_sent: bool,
    answer_in_flight: bool,
}

impl CallSession {
    fn new(generation: u64, peer: PeerId) -> Self {
        Self {
            generation,
            peer,
            handle: None,
            media: None,
            candidates: CandidateBuffer::new(),
            remote_ready: false,
            offer_sent: false,
            answer_in_flight: false,
        }
    }

    /// Close the peer session and stop capture.
    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.close().await;
        }
        if let Some(mut media) = self.media.take() {
            media.stop();
        }
    }
}

struct CallState {
    phase: CallPhase,
    generation: u64,
    session: Option<CallSession>,
}

impl CallState {
    fn current(&mut self, generation: u64) -> CallResult<&mut CallSession> {
        match self.session.as_mut() {
            Some(session) if session.generation == generation => Ok(session),
            _ => Err(CallError::Superseded),
        }
    }
}

/// Owns the one call session and drives it through negotiation.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct CallController {
    state: Arc<Mutex<CallState>>,
    engine: Arc<dyn MediaEngine>,
    ice_servers: Arc<[IceServer]>,
    relay: mpsc::UnboundedSender<Outbound>,
    signals: mpsc::UnboundedSender<SessionSignal>,
}

impl CallController {
    /// Build a controller. The returned receiver yields engine reports
    /// ([`SessionSignal`]); feed them back through [`Self::on_session_signal`].
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        ice_servers: Vec<IceServer>,
        relay: mpsc::UnboundedSender<Outbound>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionSignal>) {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let controller = Self {
            state: Arc::new(Mutex::new(CallState {
                phase: CallPhase::Idle,
                generation: 0,
                session: None,
            })),
            engine,
            ice_servers: ice_servers.into(),
            relay,
            signals,
        };
        (controller, signal_rx)
    }

    pub fn phase(&self) -> CallPhase {
        self.lock().phase
    }

    /// The peer of the current session, if any.
    pub fn peer(&self) -> Option<PeerId> {
        self.lock().session.as_ref().map(|s| s.peer.clone())
    }

    /// Generation of the current (or most recent) session.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Number of candidates waiting for the remote description.
    pub fn buffered_candidates(&self) -> usize {
        self.lock()
            .session
            .as_ref()
            .map_or(0, |s| s.candidates.len())
    }

    /// Start a call to `peer`. Valid only from `Idle`.
    pub fn initiate_call(&self, peer: PeerId) -> CallResult<Negotiation> {
        let generation = self.reserve(&peer, CallPhase::OutgoingOffer)?;
        tracing::info!(peer = %peer, generation, "Starting outgoing call");

        let this = self.clone();
        Ok(async move {
            let result = this.negotiate_outgoing(generation, &peer).await;
            match result {
                Ok(()) => CallOutcome::Offered { peer },
                Err(error) => this.fail(generation, peer, error).await,
            }
        }
        .boxed())
    }

    /// Accept an offer from `from`. Valid only from `Idle`; anything else is
    /// [`CallError::Busy`] and leaves the current call untouched.
    pub fn receive_offer(&self, from: PeerId, offer: SessionDescription) -> CallResult<Negotiation> {
        let generation = self.reserve(&from, CallPhase::IncomingOffer)?;
        tracing::info!(peer = %from, generation, "Answering incoming call");

        let this = self.clone();
        Ok(async move {
            let result = this.negotiate_incoming(generation, &from, offer).await;
            match result {
                Ok(()) => CallOutcome::Answered { peer: from },
                Err(error) => this.fail(generation, from, error).await,
            }
        }
        .boxed())
    }

    /// Apply the peer's answer. Valid only in `OutgoingOffer`, from the peer
    /// we offered to, once per session.
    pub fn receive_answer(&self, from: PeerId, answer: SessionDescription) -> CallResult<Negotiation> {
        let (generation, handle) = {
            let mut state = self.lock();
            if state.phase != CallPhase::OutgoingOffer {
                return Err(CallError::StaleEnvelope { envelope: "answer" });
            }
            let session = state
                .session
                .as_mut()
                .ok_or(CallError::StaleEnvelope { envelope: "answer" })?;
            if session.peer != from || !session.offer_sent || session.answer_in_flight {
                return Err(CallError::StaleEnvelope { envelope: "answer" });
            }
            let handle = session
                .handle
                .clone()
                .ok_or(CallError::StaleEnvelope { envelope: "answer" })?;
            session.answer_in_flight = true;
            (session.generation, handle)
        };
        tracing::debug!(peer = %from, generation, "Applying answer");

        let this = self.clone();
        Ok(async move {
            let result = this.apply_answer(generation, &handle, answer).await;
            match result {
                Ok(()) => CallOutcome::Connected { peer: from },
                Err(error) => this.fail(generation, from, error).await,
            }
        }
        .boxed())
    }

    /// Feed a remote candidate. Buffered until the remote description is set,
    /// applied right away after. Candidates while `Idle`/`Ended` or from a peer
    /// other than ours are stale.
    pub async fn receive_candidate(
        &self,
        from: &PeerId,
        candidate: IceCandidate,
    ) -> CallResult<CandidateDisposition> {
        let (handle, candidate) = {
            let mut state = self.lock();
            if matches!(state.phase, CallPhase::Idle | CallPhase::Ended) {
                return Err(CallError::StaleEnvelope { envelope: "candidate" });
            }
            let session = state
                .session
                .as_mut()
                .ok_or(CallError::StaleEnvelope { envelope: "candidate" })?;
            if &session.peer != from {
                return Err(CallError::StaleEnvelope { envelope: "candidate" });
            }
            let ready = session.remote_ready;
            let Some(candidate) = session.candidates.drain_if_ready(candidate, ready) else {
                tracing::debug!(peer = %from, "Candidate buffered until remote description is set");
                return Ok(CandidateDisposition::Buffered);
            };
            let Some(handle) = session.handle.clone() else {
                return Err(CallError::StaleEnvelope { envelope: "candidate" });
            };
            (handle, candidate)
        };

        match handle.add_candidate(&candidate).await {
            Ok(()) => Ok(CandidateDisposition::Applied),
            Err(e) => {
                let error = CallError::CandidateApplication(e);
                tracing::warn!(peer = %from, error = %error, "Skipping candidate");
                Ok(CandidateDisposition::Skipped)
            }
        }
    }

    /// Hang up: tear down, stop capture, and tell the peer.
    pub async fn end_call(&self) -> CallResult<PeerId> {
        let peer = self.terminate().await?;
        self.transmit(Outbound::CallEnded { to: peer.clone() });
        tracing::info!(peer = %peer, "Call ended locally");
        Ok(peer)
    }

    /// The peer hung up. Same teardown as [`Self::end_call`] without notifying
    /// the relay back.
    pub async fn receive_call_ended(&self, from: &PeerId) -> CallResult<PeerId> {
        self.ensure_peer(from, "call_ended")?;
        let peer = self.terminate().await?;
        tracing::info!(peer = %peer, "Call ended by peer");
        Ok(peer)
    }

    /// The peer refused our offer (busy). Only meaningful while offering to them.
    pub async fn receive_rejection(&self, from: &PeerId) -> CallResult<PeerId> {
        if self.phase() != CallPhase::OutgoingOffer {
            return Err(CallError::StaleEnvelope { envelope: "call_rejected" });
        }
        self.ensure_peer(from, "call_rejected")?;
        let peer = self.terminate().await?;
        tracing::info!(peer = %peer, "Call rejected by peer");
        Ok(peer)
    }

    /// Tear down without notifying anyone. Used when the relay is gone.
    pub async fn shutdown(&self) -> Option<PeerId> {
        self.terminate().await.ok()
    }

    /// Route an engine report for the current session. Reports from earlier
    /// sessions are dropped.
    pub fn on_session_signal(&self, signal: SessionSignal) -> Option<SessionNotice> {
        let peer = {
            let state = self.lock();
            match state.session.as_ref() {
                Some(session) if session.generation == signal.generation => session.peer.clone(),
                _ => {
                    tracing::debug!(generation = signal.generation, "Dropping report from a finished session");
                    return None;
                }
            }
        };

        match signal.kind {
            SignalKind::LocalCandidate(candidate) => {
                self.transmit(Outbound::IceCandidate { to: peer, candidate });
                None
            }
            SignalKind::RemoteStream(stream) => Some(SessionNotice::RemoteStream { peer, stream }),
            SignalKind::ConnectionLost => Some(SessionNotice::ConnectionLost { peer }),
        }
    }

    // === Negotiation steps ===

    async fn negotiate_outgoing(&self, generation: u64, peer: &PeerId) -> CallResult<()> {
        let handle = self.prepare_session(generation).await?;

        let offer = handle.create_offer().await.map_err(CallError::Negotiation)?;
        handle
            .set_local_description(&offer)
            .await
            .map_err(CallError::Negotiation)?;

        let mut state = self.lock();
        state.current(generation)?.offer_sent = true;
        self.transmit(Outbound::Offer {
            to: peer.clone(),
            offer,
        });
        tracing::info!(peer = %peer, generation, "Offer sent");
        Ok(())
    }

    async fn negotiate_incoming(
        &self,
        generation: u64,
        from: &PeerId,
        offer: SessionDescription,
    ) -> CallResult<()> {
        let handle = self.prepare_session(generation).await?;

        handle
            .set_remote_description(&offer)
            .await
            .map_err(CallError::Negotiation)?;
        self.flush_candidates(generation, &handle).await?;

        let answer = handle.create_answer().await.map_err(CallError::Negotiation)?;
        handle
            .set_local_description(&answer)
            .await
            .map_err(CallError::Negotiation)?;

        let mut state = self.lock();
        state.current(generation)?;
        state.phase = CallPhase::Active;
        self.transmit(Outbound::Answer {
            to: from.clone(),
            answer,
        });
        tracing::info!(peer = %from, generation, "Answer sent, call active");
        Ok(())
    }

    async fn apply_answer(
        &self,
        generation: u64,
        handle: &Arc<dyn PeerSession>,
        answer: SessionDescription,
    ) -> CallResult<()> {
        handle
            .set_remote_description(&answer)
            .await
            .map_err(CallError::Negotiation)?;
        self.flush_candidates(generation, handle).await?;

        let mut state = self.lock();
        state.current(generation)?;
        state.phase = CallPhase::Active;
        tracing::info!(generation, "Answer applied, call active");
        Ok(())
    }

    /// Acquire capture, create the peer session, and attach the local tracks.
    /// Each product is installed into the session as soon as it exists so that
    /// teardown owns it from then on.
    async fn prepare_session(&self, generation: u64) -> CallResult<Arc<dyn PeerSession>> {
        let media = self
            .engine
            .acquire_local_media()
            .await
            .map_err(CallError::MediaAcquisition)?;
        let tracks = media.tracks().to_vec();
        {
            let mut state = self.lock();
            // On a stale generation `media` is dropped here, which stops it.
            state.current(generation)?.media = Some(media);
        }

        let events = SessionEvents::new(generation, self.signals.clone());
        let handle = self
            .engine
            .create_session(&self.ice_servers, events)
            .await
            .map_err(CallError::Negotiation)?;
        let installed = {
            let mut state = self.lock();
            match state.current(generation) {
                Ok(session) => {
                    session.handle = Some(handle.clone());
                    true
                }
                Err(_) => false,
            }
        };
        if !installed {
            handle.close().await;
            return Err(CallError::Superseded);
        }

        for track in &tracks {
            handle.add_track(track).await.map_err(CallError::Negotiation)?;
        }
        Ok(handle)
    }

    /// Apply buffered candidates in arrival order, then mark the session ready.
    /// Candidates that arrive while a batch is being applied are picked up by
    /// the next round, so ordering holds.
    async fn flush_candidates(&self, generation: u64, handle: &Arc<dyn PeerSession>) -> CallResult<()> {
        loop {
            let batch = {
                let mut state = self.lock();
                let session = state.current(generation)?;
                let batch = session.candidates.flush_all();
                if batch.is_empty() {
                    session.remote_ready = true;
                    return Ok(());
                }
                batch
            };
            tracing::debug!(generation, count = batch.len(), "Flushing buffered candidates");
            for candidate in batch {
                if let Err(e) = handle.add_candidate(&candidate).await {
                    let error = CallError::CandidateApplication(e);
                    tracing::warn!(generation, error = %error, "Skipping buffered candidate");
                }
            }
        }
    }

    /// Roll a failed attempt back to `Idle`, unless it was already superseded.
    async fn fail(&self, generation: u64, peer: PeerId, error: CallError) -> CallOutcome {
        if matches!(error, CallError::Superseded) {
            tracing::debug!(peer = %peer, generation, "Negotiation step outlived its session");
            return CallOutcome::Superseded { generation };
        }
        let session = {
            let mut state = self.lock();
            if state.current(generation).is_err() {
                return CallOutcome::Superseded { generation };
            }
            state.phase = CallPhase::Idle;
            state.session.take()
        };
        if let Some(session) = session {
            session.release().await;
        }
        tracing::error!(peer = %peer, generation, error = %error, "Call failed");
        CallOutcome::Failed { peer, error }
    }

    // === Helpers ===

    /// Claim the session slot for a new call. Only one session at a time.
    fn reserve(&self, peer: &PeerId, phase: CallPhase) -> CallResult<u64> {
        let mut state = self.lock();
        if let Some(session) = state.session.as_ref() {
            return Err(CallError::Busy {
                peer: session.peer.clone(),
            });
        }
        if state.phase != CallPhase::Idle {
            return Err(CallError::Busy { peer: peer.clone() });
        }
        state.generation += 1;
        let generation = state.generation;
        state.session = Some(CallSession::new(generation, peer.clone()));
        state.phase = phase;
        Ok(generation)
    }

    fn ensure_peer(&self, from: &PeerId, envelope: &'static str) -> CallResult<()> {
        match self.lock().session.as_ref() {
            Some(session) if &session.peer == from => Ok(()),
            Some(_) => Err(CallError::StaleEnvelope { envelope }),
            None => Err(CallError::NotInCall),
        }
    }

    /// Take the session out, mark `Ended`, release it, settle on `Idle`.
    async fn terminate(&self) -> CallResult<PeerId> {
        let session = {
            let mut state = self.lock();
            let session = state.session.take().ok_or(CallError::NotInCall)?;
            state.phase = CallPhase::Ended;
            session
        };
        let peer = session.peer.clone();
        session.release().await;

        let mut state = self.lock();
        if state.session.is_none() {
            state.phase = CallPhase::Idle;
        }
        Ok(peer)
    }

    fn transmit(&self, envelope: Outbound) {
        let event = envelope.event_name();
        if self.relay.send(envelope).is_err() {
            tracing::warn!(event, "Relay closed, envelope dropped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEngine;

    struct Harness {
        call: CallController,
        relay: mpsc::UnboundedReceiver<Outbound>,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
    }

    impl Harness {
        fn new(engine: &FakeEngine) -> Self {
            let (relay_tx, relay) = mpsc::unbounded_channel();
            let (call, signals) =
                CallController::new(Arc::new(engine.clone()), IceServer::default_stun(), relay_tx);
            Self {
                call,
                relay,
                signals,
            }
        }

        fn sent(&mut self) -> Vec<Outbound> {
            let mut sent = Vec::new();
            while let Ok(envelope) = self.relay.try_recv() {
                sent.push(envelope);
            }
            sent
        }
    }

    fn peer(id: &str) -> PeerId {
        PeerId::from(id)
    }

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000 typ host"))
    }

    /// Let spawned negotiation tasks run up to their next suspend point.
    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    async fn active_incoming(h: &mut Harness, from: &str) {
        let negotiation = h
            .call
            .receive_offer(peer(from), SessionDescription::offer("v=0 remote"))
            .expect("idle machine accepts offers");
        assert!(matches!(negotiation.await, CallOutcome::Answered { .. }));
        assert_eq!(h.call.phase(), CallPhase::Active);
    }

    #[tokio::test]
    async fn test_outgoing_call_offers_then_connects() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine);

        let negotiation = h.call.initiate_call(peer("bob")).unwrap();
        assert_eq!(h.call.phase(), CallPhase::OutgoingOffer);
        assert!(matches!(negotiation.await, CallOutcome::Offered { .. }));

        let sent = h.sent();
        assert!(matches!(
            sent.as_slice(),
            [Outbound::Offer { to, .. }] if to == &peer("bob")
        ));
        assert_eq!(h.call.phase(), CallPhase::OutgoingOffer);

        let negotiation = h
            .call
            .receive_answer(peer("bob"), SessionDescription::answer("v=0 bob"))
            .unwrap();
        assert!(matches!(negotiation.await, CallOutcome::Connected { .. }));
        assert_eq!(h.call.phase(), CallPhase::Active);
        assert_eq!(engine.log().remote_descriptions.len(), 1);
        assert_eq!(engine.log().tracks_added, 2);
    }

    #[tokio::test]
    async fn test_media_failure_returns_to_idle_without_offer() {
        let engine = FakeEngine::new().fail_media();
        let mut h = Harness::new(&engine);

        let outcome = h.call.initiate_call(peer("bob")).unwrap().await;
        let CallOutcome::Failed { error, .. } = outcome else {
            panic!("expected media acquisition to fail");
        };
        assert!(matches!(error, CallError::MediaAcquisition(_)));
        assert!(error.is_user_visible());
        assert_eq!(h.call.phase(), CallPhase::Idle);
        assert!(h.call.peer().is_none());
        assert!(h.sent().is_empty());
        assert_eq!(engine.log().sessions_created, 0);

        // The failed attempt does not block the next one
        assert!(h.call.initiate_call(peer("bob")).is_ok());
    }

    #[tokio::test]
    async fn test_session_creation_failure_releases_media() {
        let engine = FakeEngine::new().fail_session();
        let mut h = Harness::new(&engine);

        let outcome = h.call.initiate_call(peer("bob")).unwrap().await;
        let CallOutcome::Failed { error, .. } = outcome else {
            panic!("expected session creation to fail");
        };
        assert!(matches!(error, CallError::Negotiation(_)));
        assert_eq!(h.call.phase(), CallPhase::Idle);
        assert!(h.call.peer().is_none());

        let log = engine.log();
        assert_eq!(log.media_acquired, 1);
        assert_eq!(log.live_media(), 0);
        assert_eq!(log.sessions_created, 0);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_end_call_during_session_creation_closes_late_session() {
        let engine = FakeEngine::new();
        let gate = engine.gate_session();
        let mut h = Harness::new(&engine);

        let task = tokio::spawn(h.call.initiate_call(peer("bob")).unwrap());
        settle().await;
        assert_eq!(engine.log().media_acquired, 1);

        assert_eq!(h.call.end_call().await.unwrap(), peer("bob"));
        assert_eq!(engine.log().live_media(), 0);

        gate.notify_one();
        assert!(matches!(task.await.unwrap(), CallOutcome::Superseded { .. }));
        assert_eq!(h.call.phase(), CallPhase::Idle);

        let log = engine.log();
        assert_eq!(log.sessions_created, 1);
        assert_eq!(log.live_sessions(), 0);
        assert_eq!(log.tracks_added, 0);
        let sent = h.sent();
        assert!(matches!(sent.as_slice(), [Outbound::CallEnded { .. }]));
    }

    #[tokio::test]
    async fn test_early_candidates_applied_once_in_order() {
        let engine = FakeEngine::new();
        let gate = engine.gate_remote_description();
        let mut h = Harness::new(&engine);

        let task = tokio::spawn(
            h.call
                .receive_offer(peer("alice"), SessionDescription::offer("v=0 alice"))
                .unwrap(),
        );
        settle().await;
        assert_eq!(h.call.phase(), CallPhase::IncomingOffer);

        for n in 1..=3 {
            let disposition = h.call.receive_candidate(&peer("alice"), cand(n)).await.unwrap();
            assert_eq!(disposition, CandidateDisposition::Buffered);
        }
        assert_eq!(h.call.buffered_candidates(), 3);
        assert!(engine.log().applied_candidates.is_empty());

        gate.notify_one();
        assert!(matches!(task.await.unwrap(), CallOutcome::Answered { .. }));

        let expected: Vec<String> = (1..=3).map(|n| cand(n).candidate).collect();
        assert_eq!(engine.log().applied_candidates, expected);
        assert_eq!(h.call.buffered_candidates(), 0);

        let disposition = h.call.receive_candidate(&peer("alice"), cand(4)).await.unwrap();
        assert_eq!(disposition, CandidateDisposition::Applied);
        assert_eq!(engine.log().applied_candidates.len(), 4);

        let sent = h.sent();
        assert!(matches!(
            sent.as_slice(),
            [Outbound::Answer { to, .. }] if to == &peer("alice")
        ));
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_answer_applied() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine);
        h.call.initiate_call(peer("bob")).unwrap().await;

        let disposition = h.call.receive_candidate(&peer("bob"), cand(1)).await.unwrap();
        assert_eq!(disposition, CandidateDisposition::Buffered);

        h.call
            .receive_answer(peer("bob"), SessionDescription::answer("v=0 bob"))
            .unwrap()
            .await;
        assert_eq!(engine.log().applied_candidates, vec![cand(1).candidate]);
        h.sent();
    }

    #[tokio::test]
    async fn test_stale_candidates_discarded() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine);

        let idle = h.call.receive_candidate(&peer("alice"), cand(1)).await;
        assert!(matches!(idle, Err(CallError::StaleEnvelope { .. })));

        active_incoming(&mut h, "alice").await;
        let foreign = h.call.receive_candidate(&peer("mallory"), cand(2)).await;
        assert!(matches!(foreign, Err(CallError::StaleEnvelope { .. })));
        assert!(engine.log().applied_candidates.is_empty());
    }

    #[tokio::test]
    async fn test_bad_candidate_skipped_session_continues() {
        let engine = FakeEngine::new().reject_candidate(&cand(2).candidate);
        let gate = engine.gate_remote_description();
        let mut h = Harness::new(&engine);

        let task = tokio::spawn(
            h.call
                .receive_offer(peer("alice"), SessionDescription::offer("v=0 alice"))
                .unwrap(),
        );
        settle().await;
        for n in 1..=3 {
            h.call.receive_candidate(&peer("alice"), cand(n)).await.unwrap();
        }
        gate.notify_one();
        assert!(matches!(task.await.unwrap(), CallOutcome::Answered { .. }));
        assert_eq!(
            engine.log().applied_candidates,
            vec![cand(1).candidate, cand(3).candidate]
        );

        let skipped = h.call.receive_candidate(&peer("alice"), cand(2)).await.unwrap();
        assert_eq!(skipped, CandidateDisposition::Skipped);
        assert_eq!(h.call.phase(), CallPhase::Active);
    }

    #[tokio::test]
    async fn test_end_call_during_media_acquisition_supersedes_step() {
        let engine = FakeEngine::new();
        let gate = engine.gate_media();
        let mut h = Harness::new(&engine);

        let task = tokio::spawn(h.call.initiate_call(peer("bob")).unwrap());
        settle().await;

        assert_eq!(h.call.end_call().await.unwrap(), peer("bob"));
        assert_eq!(h.call.phase(), CallPhase::Idle);

        gate.notify_one();
        assert!(matches!(task.await.unwrap(), CallOutcome::Superseded { .. }));

        let log = engine.log();
        assert_eq!(log.media_acquired, 1);
        assert_eq!(log.live_media(), 0);
        assert_eq!(log.sessions_created, 0);
        let sent = h.sent();
        assert!(matches!(sent.as_slice(), [Outbound::CallEnded { .. }]));

        // A new call afterwards owns the only session
        gate.notify_one();
        let outcome = h.call.initiate_call(peer("bob")).unwrap().await;
        assert!(matches!(outcome, CallOutcome::Offered { .. }));
        assert_eq!(engine.log().live_sessions(), 1);
    }

    #[tokio::test]
    async fn test_end_call_during_answer_application_keeps_idle() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine);
        h.call.initiate_call(peer("bob")).unwrap().await;

        let gate = engine.gate_remote_description();
        let task = tokio::spawn(
            h.call
                .receive_answer(peer("bob"), SessionDescription::answer("v=0 bob"))
                .unwrap(),
        );
        settle().await;
        h.call.end_call().await.unwrap();
        gate.notify_one();

        // The closed session fails the step, but the call was already torn down
        assert!(matches!(task.await.unwrap(), CallOutcome::Superseded { .. }));
        assert_eq!(h.call.phase(), CallPhase::Idle);
        assert_eq!(engine.log().live_sessions(), 0);
        h.sent();
    }

    #[tokio::test]
    async fn test_second_call_rejected_while_busy() {
        let engine = FakeEngine::new();
        let h = Harness::new(&engine);
        h.call.initiate_call(peer("bob")).unwrap().await;

        assert!(matches!(
            h.call.initiate_call(peer("carol")),
            Err(CallError::Busy { .. })
        ));
        assert!(matches!(
            h.call.receive_offer(peer("carol"), SessionDescription::offer("v=0")),
            Err(CallError::Busy { .. })
        ));
        assert_eq!(h.call.peer(), Some(peer("bob")));
        assert_eq!(engine.log().sessions_created, 1);
    }

    #[tokio::test]
    async fn test_answer_outside_offer_state_is_stale() {
        let engine = FakeEngine::new();
        let h = Harness::new(&engine);
        assert!(matches!(
            h.call.receive_answer(peer("bob"), SessionDescription::answer("v=0")),
            Err(CallError::StaleEnvelope { .. })
        ));

        h.call.initiate_call(peer("bob")).unwrap().await;
        assert!(matches!(
            h.call.receive_answer(peer("carol"), SessionDescription::answer("v=0")),
            Err(CallError::StaleEnvelope { .. })
        ));

        h.call
            .receive_answer(peer("bob"), SessionDescription::answer("v=0"))
            .unwrap()
            .await;
        assert!(matches!(
            h.call.receive_answer(peer("bob"), SessionDescription::answer("v=0")),
            Err(CallError::StaleEnvelope { .. })
        ));
    }

    #[tokio::test]
    async fn test_peer_hangup_does_not_echo() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine);
        active_incoming(&mut h, "alice").await;
        h.sent();

        assert!(matches!(
            h.call.receive_call_ended(&peer("mallory")).await,
            Err(CallError::StaleEnvelope { .. })
        ));
        assert_eq!(h.call.receive_call_ended(&peer("alice")).await.unwrap(), peer("alice"));
        assert!(h.sent().is_empty());
        assert_eq!(h.call.phase(), CallPhase::Idle);

        let log = engine.log();
        assert_eq!(log.live_sessions(), 0);
        assert_eq!(log.live_media(), 0);
    }

    #[tokio::test]
    async fn test_end_call_releases_exactly_once() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine);
        active_incoming(&mut h, "alice").await;
        h.sent();

        h.call.end_call().await.unwrap();
        assert!(matches!(h.call.end_call().await, Err(CallError::NotInCall)));
        assert!(h.call.shutdown().await.is_none());

        let log = engine.log();
        assert_eq!(log.media_stopped, 1);
        assert_eq!(log.sessions_closed, 1);
        let sent = h.sent();
        assert!(matches!(
            sent.as_slice(),
            [Outbound::CallEnded { to }] if to == &peer("alice")
        ));
    }

    #[tokio::test]
    async fn test_negotiation_failure_reverts_to_idle() {
        let engine = FakeEngine::new().fail_remote_description();
        let mut h = Harness::new(&engine);

        let outcome = h
            .call
            .receive_offer(peer("alice"), SessionDescription::offer("garbage"))
            .unwrap()
            .await;
        assert!(matches!(
            outcome,
            CallOutcome::Failed { error: CallError::Negotiation(_), .. }
        ));
        assert_eq!(h.call.phase(), CallPhase::Idle);
        assert_eq!(engine.log().live_media(), 0);
        assert_eq!(engine.log().live_sessions(), 0);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_local_candidates_trickle_to_current_peer_only() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine);
        h.call.initiate_call(peer("bob")).unwrap().await;
        h.sent();

        let events = engine.session_events(0).unwrap();
        events.local_candidate(cand(9));
        let signal = h.signals.recv().await.unwrap();
        assert!(h.call.on_session_signal(signal).is_none());
        let sent = h.sent();
        assert!(matches!(
            sent.as_slice(),
            [Outbound::IceCandidate { to, candidate }] if to == &peer("bob") && candidate == &cand(9)
        ));

        h.call.end_call().await.unwrap();
        h.sent();
        events.local_candidate(cand(10));
        events.connection_lost();
        for _ in 0..2 {
            let signal = h.signals.recv().await.unwrap();
            assert!(h.call.on_session_signal(signal).is_none());
        }
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_ends_offer_silently() {
        let engine = FakeEngine::new();
        let mut h = Harness::new(&engine);
        h.call.initiate_call(peer("bob")).unwrap().await;
        h.sent();

        assert_eq!(h.call.receive_rejection(&peer("bob")).await.unwrap(), peer("bob"));
        assert_eq!(h.call.phase(), CallPhase::Idle);
        assert!(h.sent().is_empty());
        assert!(matches!(
            h.call.receive_rejection(&peer("bob")).await,
            Err(CallError::StaleEnvelope { .. })
        ));
    }
}
