//! Scripted in-memory media engine for tests.
//!
//! Records every engine call, can be told to fail specific steps, and can hold
//! media acquisition, session creation, or remote-description application open until a test
//! releases it, which is how in-flight negotiation is exercised.

use crate::engine::{
    EngineError, EngineResult, LocalMedia, LocalTrack, MediaEngine, MediaStream, PeerSession,
    SessionEvents,
};
use async_trait::async_trait;
use echo_common::models::{IceCandidate, IceServer, MediaKind, SessionDescription};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Default)]
struct Script {
    fail_media: bool,
    fail_session: bool,
    fail_remote_description: bool,
    reject_candidates: Vec<String>,
    media_gate: Option<Arc<Notify>>,
    session_gate: Option<Arc<Notify>>,
    remote_gate: Option<Arc<Notify>>,
}

/// Everything the fake engine observed.
#[derive(Debug, Clone, Default)]
pub struct EngineLog {
    pub media_acquired: usize,
    pub media_stopped: usize,
    pub sessions_created: usize,
    pub sessions_closed: usize,
    pub tracks_added: usize,
    pub applied_candidates: Vec<String>,
    pub remote_descriptions: Vec<SessionDescription>,
    pub local_descriptions: Vec<SessionDescription>,
}

impl EngineLog {
    pub fn live_sessions(&self) -> usize {
        self.sessions_created - self.sessions_closed
    }

    pub fn live_media(&self) -> usize {
        self.media_acquired - self.media_stopped
    }
}

#[derive(Clone, Default)]
pub struct FakeEngine {
    script: Arc<Mutex<Script>>,
    log: Arc<Mutex<EngineLog>>,
    events: Arc<Mutex<Vec<SessionEvents>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_media(self) -> Self {
        lock(&self.script).fail_media = true;
        self
    }

    pub fn fail_session(self) -> Self {
        lock(&self.script).fail_session = true;
        self
    }

    pub fn fail_remote_description(self) -> Self {
        lock(&self.script).fail_remote_description = true;
        self
    }

    /// Make `add_candidate` refuse this candidate line.
    pub fn reject_candidate(self, candidate: &str) -> Self {
        lock(&self.script).reject_candidates.push(candidate.to_owned());
        self
    }

    /// Hold `acquire_local_media` until the returned handle is notified.
    pub fn gate_media(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.script).media_gate = Some(gate.clone());
        gate
    }

    /// Hold `create_session` until the returned handle is notified.
    pub fn gate_session(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.script).session_gate = Some(gate.clone());
        gate
    }

    /// Hold `set_remote_description` until the returned handle is notified.
    pub fn gate_remote_description(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.script).remote_gate = Some(gate.clone());
        gate
    }

    pub fn log(&self) -> EngineLog {
        lock(&self.log).clone()
    }

    /// The event handle passed to the `index`-th created session.
    pub fn session_events(&self, index: usize) -> Option<SessionEvents> {
        lock(&self.events).get(index).cloned()
    }
}

struct FakeStream {
    log: Arc<Mutex<EngineLog>>,
}

impl MediaStream for FakeStream {
    fn tracks(&self) -> Vec<LocalTrack> {
        vec![
            LocalTrack {
                id: "fake-audio".into(),
                kind: MediaKind::Audio,
            },
            LocalTrack {
                id: "fake-video".into(),
                kind: MediaKind::Video,
            },
        ]
    }

    fn stop(&self) {
        lock(&self.log).media_stopped += 1;
    }
}

struct FakeSession {
    id: usize,
    log: Arc<Mutex<EngineLog>>,
    script: Arc<Mutex<Script>>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn acquire_local_media(&self) -> EngineResult<LocalMedia> {
        let (fail, gate) = {
            let script = lock(&self.script);
            (script.fail_media, script.media_gate.clone())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if fail {
            return Err(EngineError::PermissionDenied("camera blocked".into()));
        }
        lock(&self.log).media_acquired += 1;
        Ok(LocalMedia::new(FakeStream {
            log: self.log.clone(),
        }))
    }

    async fn create_session(
        &self,
        _ice_servers: &[IceServer],
        events: SessionEvents,
    ) -> EngineResult<Arc<dyn PeerSession>> {
        let (fail, gate) = {
            let script = lock(&self.script);
            (script.fail_session, script.session_gate.clone())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if fail {
            return Err(EngineError::Rtc("no transport".into()));
        }
        let id = {
            let mut log = lock(&self.log);
            log.sessions_created += 1;
            log.sessions_created
        };
        lock(&self.events).push(events);
        Ok(Arc::new(FakeSession {
            id,
            log: self.log.clone(),
            script: self.script.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

impl FakeSession {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerSession for FakeSession {
    async fn add_track(&self, _track: &LocalTrack) -> EngineResult<()> {
        self.ensure_open()?;
        lock(&self.log).tracks_added += 1;
        Ok(())
    }

    async fn create_offer(&self) -> EngineResult<SessionDescription> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!("v=0 fake-offer-{}", self.id)))
    }

    async fn create_answer(&self) -> EngineResult<SessionDescription> {
        self.ensure_open()?;
        Ok(SessionDescription::answer(format!("v=0 fake-answer-{}", self.id)))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> EngineResult<()> {
        self.ensure_open()?;
        lock(&self.log).local_descriptions.push(description.clone());
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> EngineResult<()> {
        let (fail, gate) = {
            let script = lock(&self.script);
            (script.fail_remote_description, script.remote_gate.clone())
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.ensure_open()?;
        if fail {
            return Err(EngineError::Sdp("malformed description".into()));
        }
        lock(&self.log).remote_descriptions.push(description.clone());
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> EngineResult<()> {
        self.ensure_open()?;
        if lock(&self.script)
            .reject_candidates
            .contains(&candidate.candidate)
        {
            return Err(EngineError::Candidate(candidate.candidate.clone()));
        }
        lock(&self.log)
            .applied_candidates
            .push(candidate.candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.log).sessions_closed += 1;
        }
    }
}
