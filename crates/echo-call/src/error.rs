//! Call error taxonomy.

use crate::engine::EngineError;
use echo_common::models::PeerId;

/// Why a call operation did not go through.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Camera/microphone denied or unavailable. Aborts the attempt.
    #[error("Could not acquire local media: {0}")]
    MediaAcquisition(#[source] EngineError),

    /// Offer/answer creation or application failed. Aborts the current call only.
    #[error("Negotiation failed: {0}")]
    Negotiation(#[source] EngineError),

    /// An envelope that does not belong to the current session or state.
    #[error("Stale {envelope} envelope discarded")]
    StaleEnvelope { envelope: &'static str },

    /// One candidate was refused by the session; the session continues.
    #[error("Candidate rejected: {0}")]
    CandidateApplication(#[source] EngineError),

    /// A session already exists; only one call at a time.
    #[error("Already in a call with {peer}")]
    Busy { peer: PeerId },

    #[error("No call in progress")]
    NotInCall,

    /// The step belonged to a session that has since been ended.
    #[error("Call session was superseded")]
    Superseded,
}

impl CallError {
    /// Whether presentation should show this as a terminal "call failed".
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::MediaAcquisition(_) | Self::Negotiation(_))
    }

    pub fn error_code(&self) -> &str {
        match self {
            Self::MediaAcquisition(_) => "MEDIA_ACQUISITION_FAILED",
            Self::Negotiation(_) => "NEGOTIATION_FAILED",
            Self::StaleEnvelope { .. } => "STALE_ENVELOPE",
            Self::CandidateApplication(_) => "CANDIDATE_REJECTED",
            Self::Busy { .. } => "BUSY",
            Self::NotInCall => "NOT_IN_CALL",
            Self::Superseded => "SUPERSEDED",
        }
    }
}

pub type CallResult<T> = Result<T, CallError>;
