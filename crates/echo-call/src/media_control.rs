//! Media control sync: mute / camera-off state for both ends.
//!
//! Independent of the call's connection state. A local toggle pushes the full
//! self state to the selected peer (last write wins on their side); an inbound
//! control message overwrites the peer state wholesale. No acks, no retries:
//! a lost message leaves the peer's view stale until the next toggle.

use echo_common::envelope::Outbound;
use echo_common::models::{MediaControlState, MediaKind, PeerId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaControl {
    local: MediaControlState,
    remote: MediaControlState,
}

impl MediaControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Our own camera/microphone state.
    pub fn self_state(&self) -> MediaControlState {
        self.local
    }

    /// What the peer last reported.
    pub fn peer_state(&self) -> MediaControlState {
        self.remote
    }

    /// Flip one of our flags. Returns the envelope to transmit when a peer is
    /// selected.
    pub fn toggle_self(&mut self, kind: MediaKind, selected: Option<&PeerId>) -> Option<Outbound> {
        let enabled = self.local.toggle(kind);
        tracing::debug!(?kind, enabled, "Local media toggled");
        selected.map(|peer| Outbound::media_controller(peer.clone(), self.local))
    }

    /// Overwrite the peer state with what they reported.
    pub fn apply_peer_control(&mut self, state: MediaControlState) {
        self.remote = state;
    }

    /// Back to everything enabled. Called when a call ends.
    pub fn reset(&mut self) {
        self.local = MediaControlState::default();
        self.remote = MediaControlState::default();
    }
}
