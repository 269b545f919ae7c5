//! Mute / camera-off state exchanged between the two ends of a call.

use serde::{Deserialize, Serialize};

/// Which local capture a toggle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Whether a party's camera and microphone are enabled.
///
/// Two independent instances exist per client: self (changed only by local
/// actions) and peer (changed only by inbound control messages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaControlState {
    pub video_enabled: bool,
    pub audio_enabled: bool,
}

impl MediaControlState {
    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Video => self.video_enabled,
        }
    }

    /// Flip one flag, returning the new value.
    pub fn toggle(&mut self, kind: MediaKind) -> bool {
        let flag = match kind {
            MediaKind::Audio => &mut self.audio_enabled,
            MediaKind::Video => &mut self.video_enabled,
        };
        *flag = !*flag;
        *flag
    }
}

impl Default for MediaControlState {
    fn default() -> Self {
        Self {
            video_enabled: true,
            audio_enabled: true,
        }
    }
}
