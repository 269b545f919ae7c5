//! # echo-common
//!
//! Shared types, configuration, error handling, and the relay wire format used
//! across all Echo crates. No signaling logic lives here, only the contracts
//! the call and chat layers agree on.

pub mod config;
pub mod envelope;
pub mod error;
pub mod models;

pub use error::{EchoError, EchoResult};
pub use models::*;
