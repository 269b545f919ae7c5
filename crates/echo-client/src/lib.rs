//! Echo client for Rust.
//!
//! Connects to a relay, keeps the chat with the selected peer in sync, and
//! drives one-to-one calls through [`echo_call`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use echo_call::RtcEngine;
//! use echo_client::{relay, ClientSession, Command, SessionSettings};
//!
//! #[tokio::main]
//! async fn main() -> echo_client::ClientResult<()> {
//!     let link = relay::connect("ws://localhost:3000/relay").await?;
//!     let engine = Arc::new(RtcEngine::new([127, 0, 0, 1].into()));
//!     let (session, handle) =
//!         ClientSession::new("alice", engine, &SessionSettings::default(), link);
//!
//!     let mut events = handle.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{event:?}");
//!         }
//!     });
//!
//!     handle.send(Command::SelectPeer("bob".into())).await?;
//!     session.run().await
//! }
//! ```

pub mod chat;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod relay;
pub mod session;

pub use chat::ChatSync;
pub use dispatcher::{Dispatcher, Subscriptions};
pub use error::{ClientError, ClientResult};
pub use event::{ClientEvent, Command};
pub use relay::{RelayEnd, RelayLink};
pub use session::{ClientSession, SessionHandle, SessionSettings};
