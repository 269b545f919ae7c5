//! WebSocket link to the relay.
//!
//! The relay is a plain forwarder: every frame is one JSON envelope. A reader
//! task decodes frames into [`Inbound`] values and a writer task encodes
//! [`Outbound`] values; both end when the socket does. There is no reconnect:
//! when the inbound channel closes the session is over.

use echo_common::envelope::{Inbound, Outbound};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ClientError, ClientResult};

/// Inbound envelopes buffered between the reader task and the session loop.
const INBOUND_CAPACITY: usize = 256;

/// Both directions of a relay connection.
///
/// `inbound` yields `None` once the relay is gone.
pub struct RelayLink {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::Receiver<Inbound>,
}

/// The relay side of an in-memory link.
pub struct RelayEnd {
    /// Envelopes to deliver to the client. Dropping it disconnects the client.
    pub deliver: mpsc::Sender<Inbound>,
    /// Envelopes the client sent.
    pub sent: mpsc::UnboundedReceiver<Outbound>,
}

impl RelayLink {
    /// A link backed by channels instead of a socket.
    pub fn in_memory() -> (Self, RelayEnd) {
        let (outbound, sent) = mpsc::unbounded_channel();
        let (deliver, inbound) = mpsc::channel(INBOUND_CAPACITY);
        (Self { outbound, inbound }, RelayEnd { deliver, sent })
    }
}

/// Check that `url` is a WebSocket URL.
pub fn parse_relay_url(url: &str) -> ClientResult<Url> {
    let url = Url::parse(url)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ClientError::UnsupportedScheme(other.to_owned())),
    }
}

/// Open the WebSocket and spawn the reader and writer tasks.
pub async fn connect(url: &str) -> ClientResult<RelayLink> {
    let url = parse_relay_url(url)?;
    let (ws, _) = connect_async(url.as_str()).await?;
    info!(relay = %url, "Connected to relay");

    let (mut sink, mut stream) = ws.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);

    // Writer: encode and send until the session drops its sender or the socket fails
    tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            let event = envelope.event_name();
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!(event, error = %e, "Failed to encode envelope");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                warn!(event, error = %e, "Relay write failed");
                break;
            }
        }
        let _ = sink.close().await;
        debug!("Relay writer stopped");
    });

    // Reader: decode frames; dropping `inbound_tx` on exit signals the disconnect
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "Relay read failed");
                    break;
                }
            };
            let text = match &msg {
                Message::Text(t) => t.as_str().to_owned(),
                Message::Close(_) => break,
                _ => continue,
            };
            match decode(&text) {
                Ok(envelope) => {
                    if inbound_tx.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "Ignoring undecodable relay frame"),
            }
        }
        info!("Relay connection closed");
    });

    Ok(RelayLink { outbound, inbound })
}

/// Decode one relay frame.
pub fn decode(text: &str) -> ClientResult<Inbound> {
    Ok(serde_json::from_str(text)?)
}
