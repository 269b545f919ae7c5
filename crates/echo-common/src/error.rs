//! Centralized error types for Echo.
//!
//! Uses `thiserror` for the failures every crate can hit: loading configuration,
//! decoding relay frames, and losing the relay itself. Call-specific failures
//! live next to the call state machine in `echo-call`.

/// Core error type shared across the Echo crates.
#[derive(Debug, thiserror::Error)]
pub enum EchoError {
    // === Configuration ===
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // === Wire format ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Relay ===
    /// The relay connection is gone. Fatal to the whole session: there is no
    /// resume, every in-memory state is dropped.
    #[error("Relay disconnected")]
    RelayDisconnected,
}

impl EchoError {
    /// Error code string for programmatic handling by presentation layers.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Config(_) | Self::InvalidConfig { .. } => "CONFIG_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::RelayDisconnected => "RELAY_DISCONNECTED",
        }
    }
}

/// Convenience type alias for Results using EchoError.
pub type EchoResult<T> = Result<T, EchoError>;
