//! # echo-call
//!
//! One-to-one call signaling for Echo.
//!
//! Architecture: the client negotiates directly with one peer
//! - Session descriptions and candidates travel over the relay
//! - Media flows peer to peer through a [`MediaEngine`], never through here
//! - At most one call session exists at a time
//! - Candidates that outrun the remote description wait in a [`CandidateBuffer`]
//!
//! Mute/camera state is synchronized by [`MediaControl`] independently of the
//! call's connection state.

pub mod call;
pub mod candidates;
pub mod engine;
pub mod error;
pub mod media_control;
pub mod rtc;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use call::{CallController, CallOutcome, CallPhase, CandidateDisposition, Negotiation, SessionNotice};
pub use candidates::CandidateBuffer;
pub use engine::{
    EngineError, EngineResult, LocalMedia, LocalTrack, MediaEngine, MediaStream, PeerSession,
    RemoteStream, SessionEvents, SessionSignal, SignalKind,
};
pub use error::{CallError, CallResult};
pub use media_control::MediaControl;
pub use rtc::RtcEngine;
