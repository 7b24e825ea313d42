//! Player event notifications
//!
//! Everything asynchronous a player reports (completions, failures, line
//! switches, position updates) is a [`PlayerEvent`] wrapped in a
//! [`PlayerEventRecord`] and broadcast to every subscriber.

use crate::{
    cdn::LineSwitchReason,
    error::{Error, ErrorKind},
    types::{PlayerId, PlayerState, TextCue},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Player event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayerEvent {
    /// State machine transition
    StateChanged {
        from: PlayerState,
        to: PlayerState,
    },

    /// `open` resolved; the player is Ready
    OpenCompleted {
        uri: String,
        duration_ms: Option<i64>,
        stream_count: usize,
    },

    /// `open` failed; the player is Failed
    OpenFailed {
        uri: String,
        kind: ErrorKind,
        message: String,
    },

    PreloadCompleted {
        uri: String,
    },

    PreloadFailed {
        uri: String,
        kind: ErrorKind,
        message: String,
    },

    SeekCompleted {
        position_ms: i64,
    },

    /// A switched-to source is Ready
    SourceSwitched {
        uri: String,
        position_ms: i64,
    },

    SwitchFailed {
        uri: String,
        kind: ErrorKind,
        message: String,
    },

    CdnLineSwitched {
        from: usize,
        to: usize,
        reason: LineSwitchReason,
    },

    CdnTokenRenewed {
        line: usize,
        ts: i64,
    },

    /// Reading the playing source failed and could not be recovered
    TransportError {
        kind: ErrorKind,
        message: String,
    },

    /// An external subtitle was registered as stream `stream_index`
    SubtitleLoaded {
        stream_index: usize,
        cue_count: usize,
    },

    SubtitleFailed {
        uri: String,
        kind: ErrorKind,
        message: String,
    },

    /// The active cue of the selected subtitle changed; `None` clears it
    SubtitleCue {
        stream_index: usize,
        cue: Option<TextCue>,
    },

    PositionChanged {
        position_ms: i64,
    },

    /// The media ended and playback restarted from the beginning
    LoopCompleted {
        loops_done: u32,
    },

    /// The media ended with no loops left; the player is Stopped
    PlaybackCompleted,

    ScreenshotTaken {
        path: String,
    },

    ScreenshotFailed {
        path: String,
        message: String,
    },
}

impl PlayerEvent {
    pub fn open_failed(uri: &str, error: &Error) -> Self {
        PlayerEvent::OpenFailed {
            uri: uri.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn preload_failed(uri: &str, error: &Error) -> Self {
        PlayerEvent::PreloadFailed {
            uri: uri.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn switch_failed(uri: &str, error: &Error) -> Self {
        PlayerEvent::SwitchFailed {
            uri: uri.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn transport_error(error: &Error) -> Self {
        PlayerEvent::TransportError {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Whether this event reports a failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PlayerEvent::OpenFailed { .. }
                | PlayerEvent::PreloadFailed { .. }
                | PlayerEvent::SwitchFailed { .. }
                | PlayerEvent::TransportError { .. }
                | PlayerEvent::SubtitleFailed { .. }
                | PlayerEvent::ScreenshotFailed { .. }
        )
    }
}

/// Event with delivery metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerEventRecord {
    pub player_id: PlayerId,
    /// Session epoch the event belongs to
    pub epoch: u64,
    /// Per-player sequence number
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: PlayerEvent,
}
