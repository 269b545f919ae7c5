//! Error types for the Echo client.

use echo_call::CallError;
use echo_common::EchoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// An error from the WebSocket layer.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid relay URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Relay URL must use ws:// or wss://, got {0}")]
    UnsupportedScheme(String),

    #[error(transparent)]
    Relay(#[from] EchoError),

    #[error(transparent)]
    Call(#[from] CallError),

    /// The action needs a selected conversation partner.
    #[error("No peer selected")]
    NoPeerSelected,

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// The relay has not assigned us an identity yet.
    #[error("Not identified by the relay yet")]
    NotIdentified,
}

impl ClientError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::WebSocket(_) | Self::Url(_) | Self::UnsupportedScheme(_) => "TRANSPORT_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Relay(e) => e.error_code(),
            Self::Call(e) => e.error_code(),
            Self::NoPeerSelected => "NO_PEER_SELECTED",
            Self::UnknownPeer(_) => "UNKNOWN_PEER",
            Self::NotIdentified => "NOT_IDENTIFIED",
        }
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;
