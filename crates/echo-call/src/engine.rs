//! Media engine boundary.
//!
//! The call state machine never touches media bytes. It asks an engine for a
//! local capture and a peer session, then drives negotiation through
//! [`PeerSession`]. The engine reports back asynchronously through
//! [`SessionEvents`]: locally gathered candidates, remote streams, and loss of
//! connectivity.

use async_trait::async_trait;
use echo_common::models::{IceCandidate, IceServer, MediaKind, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failures reported by a media engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Media device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Media permission denied: {0}")]
    PermissionDenied(String),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("Invalid candidate: {0}")]
    Candidate(String),

    #[error("Session is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebRTC error: {0}")]
    Rtc(String),
}

/// One captured track offered to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Engine-side capture behind a [`LocalMedia`] handle.
pub trait MediaStream: Send + Sync {
    fn tracks(&self) -> Vec<LocalTrack>;

    /// Release the capture devices.
    fn stop(&self);
}

/// The local capture owned by the active call session.
///
/// Stopping is idempotent and also happens on drop, so every exit path
/// releases the devices exactly once.
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
    stream: Option<Box<dyn MediaStream>>,
}

impl LocalMedia {
    pub fn new(stream: impl MediaStream + 'static) -> Self {
        Self {
            tracks: stream.tracks(),
            stream: Some(Box::new(stream)),
        }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn is_live(&self) -> bool {
        self.stream.is_some()
    }

    /// Stop capture. Returns `false` if it was already stopped.
    pub fn stop(&mut self) -> bool {
        match self.stream.take() {
            Some(stream) => {
                stream.stop();
                true
            }
            None => false,
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("tracks", &self.tracks)
            .field("live", &self.is_live())
            .finish()
    }
}

/// A remote stream that became available on the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub kinds: Vec<MediaKind>,
}

/// What an engine reports about a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    /// A local candidate was gathered; trickle it to the peer right away.
    LocalCandidate(IceCandidate),
    RemoteStream(RemoteStream),
    /// Media connectivity to the peer is gone.
    ConnectionLost,
}

/// A session report tagged with the generation of the session that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSignal {
    pub generation: u64,
    pub kind: SignalKind,
}

/// Handed to the engine when a session is created. Cloneable so engine tasks
/// can keep reporting after `create_session` returns.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionSignal>,
}

impl SessionEvents {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionSignal>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(SignalKind::LocalCandidate(candidate));
    }

    pub fn remote_stream(&self, stream: RemoteStream) {
        self.emit(SignalKind::RemoteStream(stream));
    }

    pub fn connection_lost(&self) {
        self.emit(SignalKind::ConnectionLost);
    }

    fn emit(&self, kind: SignalKind) {
        // The receiver is gone only after the client loop exits.
        let _ = self.tx.send(SessionSignal {
            generation: self.generation,
            kind,
        });
    }
}

/// Produces local captures and peer sessions.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn acquire_local_media(&self) -> EngineResult<LocalMedia>;

    async fn create_session(
        &self,
        ice_servers: &[IceServer],
        events: SessionEvents,
    ) -> EngineResult<Arc<dyn PeerSession>>;
}

/// One negotiation/connection with a single peer.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> EngineResult<()>;

    async fn create_offer(&self) -> EngineResult<SessionDescription>;

    async fn create_answer(&self) -> EngineResult<SessionDescription>;

    async fn set_local_description(&self, description: &SessionDescription) -> EngineResult<()>;

    async fn set_remote_description(&self, description: &SessionDescription) -> EngineResult<()>;

    async fn add_candidate(&self, candidate: &IceCandidate) -> EngineResult<()>;

    /// Tear the session down. Safe to call more than once.
    async fn close(&self);
}
