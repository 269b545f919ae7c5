//! Core domain models shared across the Echo crates.
//!
//! These are the "truth" types: what travels over the relay and what the
//! presentation layer renders. Identities are opaque strings assigned by the relay.

pub mod media;
pub mod message;
pub mod participant;
pub mod signal;

/// Re-export all model types for convenience.
pub use media::*;
pub use message::*;
pub use participant::*;
pub use signal::*;
