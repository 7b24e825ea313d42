//! Core types for Vireo

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::source::CustomSource;

/// Unique identifier for a media player instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlayerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlayerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Playout and publish volume bounds (100 = unity gain)
pub const VOLUME_MIN: i32 = 0;
pub const VOLUME_MAX: i32 = 400;
pub const VOLUME_UNITY: i32 = 100;

/// Pitch bounds in semitones
pub const PITCH_MIN: i32 = -12;
pub const PITCH_MAX: i32 = 12;

/// Playback speed bounds in percent of normal speed
pub const SPEED_MIN: i32 = 30;
pub const SPEED_MAX: i32 = 400;
pub const SPEED_NORMAL: i32 = 100;

/// Player state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    /// No source loaded
    Idle,
    /// Resolving a source
    Opening,
    /// Source resolved, playback not started
    Ready,
    /// Frames are being delivered
    Playing,
    /// Playback paused
    Paused,
    /// Playback stopped, source closed
    Stopped,
    /// The last open failed
    Failed,
    /// A preload is resolving
    PreloadPending,
    /// At least one source is preloaded
    Preloaded,
}

impl PlayerState {
    /// States from which `open` is accepted
    pub fn can_open(&self) -> bool {
        matches!(
            self,
            PlayerState::Idle
                | PlayerState::Stopped
                | PlayerState::Failed
                | PlayerState::PreloadPending
                | PlayerState::Preloaded
        )
    }

    /// States in which the current source has been resolved
    pub fn has_source(&self) -> bool {
        matches!(self, PlayerState::Ready | PlayerState::Playing | PlayerState::Paused)
    }

    /// States that a preload request moves into `PreloadPending`
    pub fn is_idle_like(&self) -> bool {
        matches!(
            self,
            PlayerState::Idle | PlayerState::PreloadPending | PlayerState::Preloaded
        )
    }

    /// Check if a caller-driven transition to target state is valid
    pub fn can_transition_to(&self, target: PlayerState) -> bool {
        use PlayerState::*;
        matches!(
            (self, target),
            // Open
            (Idle, Opening) | (Stopped, Opening) | (Failed, Opening) |
            (PreloadPending, Opening) | (Preloaded, Opening) |
            // Resolution
            (Opening, Ready) | (Opening, Failed) |
            // Playback
            (Ready, Playing) | (Playing, Paused) | (Paused, Playing) |
            // Stop
            (Playing, Stopped) | (Paused, Stopped) | (Ready, Stopped) | (Opening, Stopped) |
            // Preload
            (Idle, PreloadPending) | (Preloaded, PreloadPending) |
            (PreloadPending, Preloaded) | (PreloadPending, Idle) | (Preloaded, Idle)
        )
    }
}

impl std::fmt::Display for PlayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayerState::Idle => write!(f, "idle"),
            PlayerState::Opening => write!(f, "opening"),
            PlayerState::Ready => write!(f, "ready"),
            PlayerState::Playing => write!(f, "playing"),
            PlayerState::Paused => write!(f, "paused"),
            PlayerState::Stopped => write!(f, "stopped"),
            PlayerState::Failed => write!(f, "failed"),
            PlayerState::PreloadPending => write!(f, "preload_pending"),
            PlayerState::Preloaded => write!(f, "preloaded"),
        }
    }
}

/// Kind of an elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Audio,
    Video,
    Subtitle,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Audio => write!(f, "audio"),
            StreamKind::Video => write!(f, "video"),
            StreamKind::Subtitle => write!(f, "subtitle"),
        }
    }
}

/// Stream discovered in an opened source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Position in the source's stream table
    pub index: usize,
    /// Stream kind
    pub kind: StreamKind,
    /// Short codec name ("pcm_s16le", "rawvideo", "srt", ...)
    pub codec_name: String,
    /// Codec parameters exactly as found in the container
    #[serde(skip)]
    pub codec_params: Bytes,
    /// Language tag, if the container carries one
    pub language: Option<String>,
    /// Stream duration (ms), if bounded
    pub duration_ms: Option<i64>,
}

/// How decoded video is fitted into the render surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Fill the surface, cropping overflow
    #[default]
    Hidden,
    /// Fit inside the surface, letterboxing
    Fit,
}

/// Output mapping for stereo sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioDualMonoMode {
    #[default]
    Stereo,
    Left,
    Right,
    Mix,
}

/// A media source handed to `open`
#[derive(Clone)]
pub struct MediaSource {
    /// Location of the media (URL, file path or a label for custom streams)
    pub uri: String,
    /// Position (ms) to start from
    pub start_position_ms: i64,
    /// Bytes come from a caller-supplied custom stream
    pub is_custom_stream: bool,
    /// Whether downloaded bytes may be kept in the disk cache
    pub cacheable: bool,
    /// Alternate delivery endpoints for the same media (CDN sources)
    pub cdn_lines: Vec<String>,
    /// Read/seek capability for custom streams
    pub custom: Option<Arc<Mutex<Box<dyn CustomSource>>>>,
}

impl MediaSource {
    /// Source addressed by URL or path
    pub fn url(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            start_position_ms: 0,
            is_custom_stream: false,
            cacheable: false,
            cdn_lines: Vec::new(),
            custom: None,
        }
    }

    /// Source delivered over redundant CDN lines; the first line is primary
    pub fn cdn(lines: Vec<String>) -> Self {
        let uri = lines.first().cloned().unwrap_or_default();
        Self {
            cdn_lines: lines,
            ..Self::url(uri)
        }
    }

    /// Source whose bytes are pulled from a caller-supplied capability
    pub fn custom(source: Box<dyn CustomSource>) -> Self {
        Self {
            uri: "custom://stream".to_string(),
            start_position_ms: 0,
            is_custom_stream: true,
            cacheable: false,
            cdn_lines: Vec::new(),
            custom: Some(Arc::new(Mutex::new(source))),
        }
    }

    pub fn with_start_position(mut self, position_ms: i64) -> Self {
        self.start_position_ms = position_ms.max(0);
        self
    }

    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Endpoints to try, in line order
    pub fn endpoints(&self) -> Vec<String> {
        if self.cdn_lines.is_empty() {
            vec![self.uri.clone()]
        } else {
            self.cdn_lines.clone()
        }
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("uri", &self.uri)
            .field("start_position_ms", &self.start_position_ms)
            .field("is_custom_stream", &self.is_custom_stream)
            .field("cacheable", &self.cacheable)
            .field("cdn_lines", &self.cdn_lines)
            .finish()
    }
}

/// Sample encoding of a decoded audio frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16,
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

/// Decoded PCM audio delivered to the audio frame observer
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Presentation time (ms)
    pub pts_ms: i64,
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples normalised to [-1.0, 1.0] after volume
    pub samples: Vec<f32>,
}

impl AudioFrame {
    /// Samples per channel
    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    /// Mono mixdown used for spectrum analysis
    pub fn mono(&self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        self.samples
            .chunks(channels)
            .map(|c| c.iter().sum::<f32>() / channels as f32)
            .collect()
    }
}

/// Decoded planar YUV 4:2:0 video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Presentation time (ms)
    pub pts_ms: i64,
    pub width: u32,
    pub height: u32,
    pub y: Bytes,
    pub u: Bytes,
    pub v: Bytes,
}

/// Spectrum magnitudes dispatched to the spectrum observer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSpectrum {
    /// Presentation time (ms) of the analysed frame
    pub pts_ms: i64,
    /// Magnitudes in dB, one per frequency bin
    pub magnitudes_db: Vec<f32>,
}

/// Timed subtitle cue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextCue {
    pub id: String,
    /// Start time in milliseconds
    pub start_ms: i64,
    /// End time in milliseconds
    pub end_ms: i64,
    pub text: String,
}

impl TextCue {
    pub fn is_active_at(&self, position_ms: i64) -> bool {
        position_ms >= self.start_ms && position_ms < self.end_ms
    }
}
