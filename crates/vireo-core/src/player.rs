//! Media player handle
//!
//! [`MediaPlayer`] is the public face of one player. Every mutating call
//! validates and transitions the state machine under a single control lock,
//! hands the work to the player's worker and returns without waiting for
//! I/O. Completions and failures arrive as [`PlayerEvent`]s.
//!
//! Each open, switch or stop starts a new session epoch. The worker checks
//! the epoch under the same control lock before it reports anything, so a
//! completion belonging to a superseded session is never delivered.

use crate::{
    cache::CacheManager,
    cdn::{CdnLineManager, CdnSource, LineSwitchReason},
    config::PlayerConfig,
    dispatch::{
        AudioFrameObserver, AudioSpectrumObserver, Dispatcher, RenderSurface, VideoFrameObserver,
    },
    events::{PlayerEvent, PlayerEventRecord},
    session::{Command, Worker},
    source::{CustomSource, SourceResolver},
    transport::{DefaultTransport, Transport},
    types::*,
    Error, Result,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Sentinel stored in `duration_ms` while the duration is unknown
const UNKNOWN_DURATION: i64 = -1;

/// Player options understood by the engine; other keys are stored as given
pub const OPTION_AUDIO_FRAME_MS: &str = "audio_frame_ms";
pub const OPTION_POSITION_REPORT_INTERVAL_MS: &str = "position_report_interval_ms";

pub(crate) enum PreloadStatus {
    Pending(CancellationToken),
    Ready,
}

pub(crate) struct PreloadSlot {
    pub generation: u64,
    pub lines: Arc<Mutex<CdnLineManager>>,
    pub status: PreloadStatus,
}

impl PreloadSlot {
    pub fn is_pending(&self) -> bool {
        matches!(self.status, PreloadStatus::Pending(_))
    }
}

/// State guarded by the control lock
pub(crate) struct Control {
    pub state: PlayerState,
    pub epoch: u64,
    pub session_cancel: CancellationToken,
    pub play_src: Option<String>,
    pub streams: Vec<StreamInfo>,
    pub live: bool,
    pub lines: Arc<Mutex<CdnLineManager>>,
    pub auto_switch_cdn: bool,
    pub preloads: HashMap<String, PreloadSlot>,
    pub preload_generation: u64,
    pub selected_audio: Option<usize>,
    pub selected_subtitle: Option<usize>,
    pub options: HashMap<String, i64>,
}

/// Audio parameters shared with the worker
///
/// `publish_volume` and `pitch` are stored and reported only; frames are
/// delivered without publishing or pitch shifting.
pub(crate) struct PlaybackParams {
    pub volume: AtomicI32,
    pub publish_volume: AtomicI32,
    pub pitch: AtomicI32,
    pub speed: AtomicI32,
    pub muted: AtomicBool,
    pub dual_mono: AtomicU8,
    pub loop_count: AtomicI32,
}

impl Default for PlaybackParams {
    fn default() -> Self {
        Self {
            volume: AtomicI32::new(VOLUME_UNITY),
            publish_volume: AtomicI32::new(VOLUME_UNITY),
            pitch: AtomicI32::new(0),
            speed: AtomicI32::new(SPEED_NORMAL),
            muted: AtomicBool::new(false),
            dual_mono: AtomicU8::new(dual_mono_to_u8(AudioDualMonoMode::Stereo)),
            loop_count: AtomicI32::new(0),
        }
    }
}

impl PlaybackParams {
    pub fn dual_mono(&self) -> AudioDualMonoMode {
        dual_mono_from_u8(self.dual_mono.load(Ordering::Relaxed))
    }

    /// Apply channel mapping, mute and playout volume in place
    pub fn apply(&self, frame: &mut AudioFrame) {
        if frame.channels == 2 {
            let mode = self.dual_mono();
            for pair in frame.samples.chunks_exact_mut(2) {
                let (l, r) = (pair[0], pair[1]);
                let (out_l, out_r) = match mode {
                    AudioDualMonoMode::Stereo => (l, r),
                    AudioDualMonoMode::Left => (l, l),
                    AudioDualMonoMode::Right => (r, r),
                    AudioDualMonoMode::Mix => ((l + r) / 2.0, (l + r) / 2.0),
                };
                pair[0] = out_l;
                pair[1] = out_r;
            }
        }

        let gain = if self.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            self.volume.load(Ordering::Relaxed) as f32 / VOLUME_UNITY as f32
        };
        if gain != 1.0 {
            for s in frame.samples.iter_mut() {
                *s = (*s * gain).clamp(-1.0, 1.0);
            }
        }
    }

    /// Wall-clock time needed to present `media_ms` at the current speed
    pub fn wall_time(&self, media_ms: f64) -> Duration {
        let speed = self.speed.load(Ordering::Relaxed).max(SPEED_MIN) as f64;
        Duration::from_secs_f64(media_ms * SPEED_NORMAL as f64 / speed / 1000.0)
    }
}

fn dual_mono_to_u8(mode: AudioDualMonoMode) -> u8 {
    match mode {
        AudioDualMonoMode::Stereo => 0,
        AudioDualMonoMode::Left => 1,
        AudioDualMonoMode::Right => 2,
        AudioDualMonoMode::Mix => 3,
    }
}

fn dual_mono_from_u8(value: u8) -> AudioDualMonoMode {
    match value {
        1 => AudioDualMonoMode::Left,
        2 => AudioDualMonoMode::Right,
        3 => AudioDualMonoMode::Mix,
        _ => AudioDualMonoMode::Stereo,
    }
}

/// State shared between the handle and its worker
pub(crate) struct Shared {
    pub id: PlayerId,
    pub config: PlayerConfig,
    pub control: Mutex<Control>,
    pub dispatcher: Dispatcher,
    pub resolver: SourceResolver,
    pub params: PlaybackParams,
    pub state_tx: watch::Sender<PlayerState>,
    /// Mirror of `Control::epoch` for lock-free staleness checks
    pub epoch: AtomicU64,
    pub position_ms: AtomicI64,
    pub duration_ms: AtomicI64,
}

impl Shared {
    /// Move to `to`, notifying watchers and subscribers
    pub fn transition(&self, control: &mut Control, to: PlayerState) {
        let from = control.state;
        if from == to {
            return;
        }
        control.state = to;
        self.state_tx.send_replace(to);
        info!(player = %self.id, from = %from, to = %to, "State transition");
        self.dispatcher.emit(control.epoch, PlayerEvent::StateChanged { from, to });
    }

    /// Start a new session epoch for `uri`, cancelling the previous one
    pub fn begin_session(
        &self,
        control: &mut Control,
        uri: &str,
        lines: Arc<Mutex<CdnLineManager>>,
        start_position_ms: i64,
    ) -> (u64, CancellationToken) {
        control.epoch += 1;
        self.epoch.store(control.epoch, Ordering::SeqCst);
        control.session_cancel.cancel();
        control.session_cancel = CancellationToken::new();
        control.lines = lines;
        control.play_src = Some(uri.to_string());
        control.streams.clear();
        control.live = false;
        control.selected_audio = None;
        control.selected_subtitle = None;
        self.position_ms.store(start_position_ms.max(0), Ordering::SeqCst);
        self.duration_ms.store(UNKNOWN_DURATION, Ordering::SeqCst);
        (control.epoch, control.session_cancel.clone())
    }

    /// Forget the current source after it was closed by the worker
    pub fn close_source(&self, control: &mut Control) {
        control.streams.clear();
        control.live = false;
        control.selected_audio = None;
        control.selected_subtitle = None;
        self.position_ms.store(0, Ordering::SeqCst);
    }

    /// Record the streams and duration of a freshly installed source
    pub fn source_ready(&self, control: &mut Control, streams: Vec<StreamInfo>, live: bool, duration_ms: Option<i64>, position_ms: i64) {
        control.streams = streams;
        control.live = live;
        self.duration_ms
            .store(duration_ms.unwrap_or(UNKNOWN_DURATION), Ordering::SeqCst);
        self.position_ms.store(position_ms, Ordering::SeqCst);
    }

    /// Derive the idle-like state from the outstanding preloads
    pub fn settle_preload_state(&self, control: &mut Control) {
        if !control.state.is_idle_like() {
            return;
        }
        let target = if control.preloads.values().any(PreloadSlot::is_pending) {
            PlayerState::PreloadPending
        } else if control.preloads.is_empty() {
            PlayerState::Idle
        } else {
            PlayerState::Preloaded
        };
        self.transition(control, target);
    }

    pub fn new_lines(&self, source: &MediaSource, auto_switch: bool) -> Arc<Mutex<CdnLineManager>> {
        Arc::new(Mutex::new(CdnLineManager::new(source.endpoints(), auto_switch)))
    }
}

/// A media player
pub struct MediaPlayer {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl MediaPlayer {
    /// Create a player reading through `transport`, optionally backed by a
    /// shared disk cache. Must be called within a tokio runtime.
    pub fn new(
        config: PlayerConfig,
        transport: Arc<dyn Transport>,
        cache: Option<Arc<CacheManager>>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Internal("a media player needs a tokio runtime".into()))?;

        let id = PlayerId::new();
        let (state_tx, _) = watch::channel(PlayerState::Idle);
        let auto_switch_cdn = config.auto_switch_cdn;

        let shared = Arc::new(Shared {
            id,
            dispatcher: Dispatcher::new(id, config.event_capacity)?,
            resolver: SourceResolver::new(transport, cache, config.clone()),
            control: Mutex::new(Control {
                state: PlayerState::Idle,
                epoch: 0,
                session_cancel: CancellationToken::new(),
                play_src: None,
                streams: Vec::new(),
                live: false,
                lines: Arc::new(Mutex::new(CdnLineManager::new(Vec::new(), auto_switch_cdn))),
                auto_switch_cdn,
                preloads: HashMap::new(),
                preload_generation: 0,
                selected_audio: None,
                selected_subtitle: None,
                options: HashMap::new(),
            }),
            params: PlaybackParams::default(),
            state_tx,
            epoch: AtomicU64::new(0),
            position_ms: AtomicI64::new(0),
            duration_ms: AtomicI64::new(UNKNOWN_DURATION),
            config,
        });

        let (commands, rx) = mpsc::unbounded_channel();
        runtime.spawn(Worker::new(shared.clone(), rx).run());

        info!(player = %id, "Media player created");
        Ok(Self { shared, commands })
    }

    /// Create a player using the default HTTP/file transport
    pub fn with_default_transport(
        config: PlayerConfig,
        cache: Option<Arc<CacheManager>>,
    ) -> Result<Self> {
        let transport = DefaultTransport::new(Duration::from_millis(config.request_timeout_ms))?;
        Self::new(config, Arc::new(transport), cache)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Internal("player worker has stopped".into()))
    }

    fn invalid_state(state: PlayerState, operation: &'static str) -> Error {
        Error::InvalidState {
            state: state.to_string(),
            operation,
        }
    }

    // ---------------------------------------------------------------------
    // Identity and derived state
    // ---------------------------------------------------------------------

    pub fn player_id(&self) -> PlayerId {
        self.shared.id
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> PlayerState {
        *self.shared.state_tx.borrow()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.shared.state_tx.subscribe()
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEventRecord> {
        self.shared.dispatcher.subscribe()
    }

    /// Current playback position (ms)
    pub fn position(&self) -> i64 {
        self.shared.position_ms.load(Ordering::SeqCst)
    }

    /// Duration of the open source; `None` when unknown or live
    pub fn duration(&self) -> Option<i64> {
        let duration = self.shared.duration_ms.load(Ordering::SeqCst);
        (duration >= 0).then_some(duration)
    }

    pub fn stream_count(&self) -> usize {
        self.shared.control.lock().streams.len()
    }

    pub fn stream_by_index(&self, index: usize) -> Result<StreamInfo> {
        let control = self.shared.control.lock();
        control
            .streams
            .get(index)
            .cloned()
            .ok_or(Error::IndexOutOfRange {
                index,
                count: control.streams.len(),
            })
    }

    /// Uri of the source most recently opened or switched to
    pub fn play_src(&self) -> Option<String> {
        self.shared.control.lock().play_src.clone()
    }

    /// Current session epoch
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------------
    // Opening sources
    // ---------------------------------------------------------------------

    /// Open a URL or file path
    pub fn open_url(&self, uri: &str, start_position_ms: i64) -> Result<()> {
        self.open_with_media_source(MediaSource::url(uri).with_start_position(start_position_ms))
    }

    /// Open a source delivered over redundant CDN lines
    pub fn open_with_cdn_src(&self, src: CdnSource, start_position_ms: i64) -> Result<()> {
        self.open_with_media_source(MediaSource::cdn(src.lines).with_start_position(start_position_ms))
    }

    /// Open a caller-supplied byte source
    pub fn open_with_custom_source(
        &self,
        source: Box<dyn CustomSource>,
        start_position_ms: i64,
    ) -> Result<()> {
        self.open_with_media_source(MediaSource::custom(source).with_start_position(start_position_ms))
    }

    #[instrument(skip(self), fields(player = %self.shared.id))]
    pub fn open_with_media_source(&self, source: MediaSource) -> Result<()> {
        let shared = &self.shared;
        let mut control = shared.control.lock();
        if !control.state.can_open() {
            return Err(Error::AlreadyOpen {
                state: control.state.to_string(),
            });
        }

        let lines = shared.new_lines(&source, control.auto_switch_cdn);
        let (epoch, cancel) =
            shared.begin_session(&mut control, &source.uri, lines.clone(), source.start_position_ms);
        shared.transition(&mut control, PlayerState::Opening);
        self.send(Command::Open {
            epoch,
            source,
            lines,
            cancel,
        })
    }

    // ---------------------------------------------------------------------
    // Transport controls
    // ---------------------------------------------------------------------

    /// Start playback of a Ready source, or resume a paused one
    pub fn play(&self) -> Result<()> {
        let mut control = self.shared.control.lock();
        if !matches!(control.state, PlayerState::Ready | PlayerState::Paused) {
            return Err(Self::invalid_state(control.state, "play"));
        }
        self.shared.transition(&mut control, PlayerState::Playing);
        self.send(Command::Play {
            epoch: control.epoch,
        })
    }

    pub fn pause(&self) -> Result<()> {
        let mut control = self.shared.control.lock();
        if control.state != PlayerState::Playing {
            return Err(Self::invalid_state(control.state, "pause"));
        }
        self.shared.transition(&mut control, PlayerState::Paused);
        self.send(Command::Pause {
            epoch: control.epoch,
        })
    }

    pub fn resume(&self) -> Result<()> {
        let mut control = self.shared.control.lock();
        if control.state != PlayerState::Paused {
            return Err(Self::invalid_state(control.state, "resume"));
        }
        self.shared.transition(&mut control, PlayerState::Playing);
        self.send(Command::Play {
            epoch: control.epoch,
        })
    }

    /// Close the source. Accepted while Opening, Ready, Playing or Paused;
    /// a no-op when already Stopped.
    pub fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        let mut control = shared.control.lock();
        match control.state {
            PlayerState::Stopped => return Ok(()),
            state if state.can_transition_to(PlayerState::Stopped) => {}
            state => return Err(Self::invalid_state(state, "stop")),
        }

        control.epoch += 1;
        shared.epoch.store(control.epoch, Ordering::SeqCst);
        control.session_cancel.cancel();
        control.session_cancel = CancellationToken::new();
        shared.close_source(&mut control);
        shared.transition(&mut control, PlayerState::Stopped);
        self.send(Command::Close)
    }

    /// Seek within the open source; the target is clamped to `[0, duration]`
    pub fn seek_to_position(&self, position_ms: i64) -> Result<()> {
        let control = self.shared.control.lock();
        if !control.state.has_source() {
            return Err(Self::invalid_state(control.state, "seek"));
        }
        let duration = self.duration().ok_or(Error::OutOfRange)?;
        let position_ms = position_ms.clamp(0, duration);
        debug!(position_ms, "Seek requested");
        self.send(Command::Seek {
            epoch: control.epoch,
            position_ms,
        })
    }

    // ---------------------------------------------------------------------
    // Parameters
    // ---------------------------------------------------------------------

    /// Playback speed in percent of normal, clamped to [30, 400]
    pub fn set_playback_speed(&self, speed: i32) {
        let speed = speed.clamp(SPEED_MIN, SPEED_MAX);
        self.shared.params.speed.store(speed, Ordering::Relaxed);
    }

    pub fn playback_speed(&self) -> i32 {
        self.shared.params.speed.load(Ordering::Relaxed)
    }

    /// Pitch in semitones, clamped to [-12, 12]
    ///
    /// The value is reported back by [`audio_pitch`](Self::audio_pitch);
    /// delivered frames are not pitch shifted.
    pub fn set_audio_pitch(&self, pitch: i32) {
        let pitch = pitch.clamp(PITCH_MIN, PITCH_MAX);
        self.shared.params.pitch.store(pitch, Ordering::Relaxed);
    }

    pub fn audio_pitch(&self) -> i32 {
        self.shared.params.pitch.load(Ordering::Relaxed)
    }

    /// Local playout volume, clamped to [0, 400] (100 = unity)
    pub fn adjust_playout_volume(&self, volume: i32) {
        let volume = volume.clamp(VOLUME_MIN, VOLUME_MAX);
        self.shared.params.volume.store(volume, Ordering::Relaxed);
    }

    pub fn playout_volume(&self) -> i32 {
        self.shared.params.volume.load(Ordering::Relaxed)
    }

    /// Volume of the published signal, clamped to [0, 400]
    ///
    /// The player publishes nothing itself; the value is kept for callers
    /// that forward the signal and does not change delivered frames.
    pub fn adjust_publish_signal_volume(&self, volume: i32) {
        let volume = volume.clamp(VOLUME_MIN, VOLUME_MAX);
        self.shared.params.publish_volume.store(volume, Ordering::Relaxed);
    }

    pub fn publish_signal_volume(&self) -> i32 {
        self.shared.params.publish_volume.load(Ordering::Relaxed)
    }

    pub fn mute(&self, muted: bool) {
        self.shared.params.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.params.muted.load(Ordering::Relaxed)
    }

    pub fn set_audio_dual_mono_mode(&self, mode: AudioDualMonoMode) {
        self.shared
            .params
            .dual_mono
            .store(dual_mono_to_u8(mode), Ordering::Relaxed);
    }

    pub fn audio_dual_mono_mode(&self) -> AudioDualMonoMode {
        self.shared.params.dual_mono()
    }

    /// 0 plays once, `n` plays `n + 1` times, -1 loops until stopped
    pub fn set_loop_count(&self, loop_count: i32) -> Result<()> {
        if loop_count < -1 {
            return Err(Error::InvalidArgument(format!("loop count {}", loop_count)));
        }
        self.shared.params.loop_count.store(loop_count, Ordering::Relaxed);
        Ok(())
    }

    pub fn loop_count(&self) -> i32 {
        self.shared.params.loop_count.load(Ordering::Relaxed)
    }

    /// Set a player option; only accepted before playback starts
    pub fn set_player_option(&self, key: &str, value: i64) -> Result<()> {
        let mut control = self.shared.control.lock();
        if matches!(control.state, PlayerState::Playing | PlayerState::Paused) {
            return Err(Self::invalid_state(control.state, "set_player_option"));
        }
        match key {
            OPTION_AUDIO_FRAME_MS if !(1..=1000).contains(&value) => {
                return Err(Error::InvalidArgument(format!("{} = {}", key, value)));
            }
            OPTION_POSITION_REPORT_INTERVAL_MS if value < 0 => {
                return Err(Error::InvalidArgument(format!("{} = {}", key, value)));
            }
            _ => {}
        }
        control.options.insert(key.to_string(), value);
        Ok(())
    }

    pub fn player_option(&self, key: &str) -> Option<i64> {
        self.shared.control.lock().options.get(key).copied()
    }

    // ---------------------------------------------------------------------
    // Tracks and subtitles
    // ---------------------------------------------------------------------

    fn check_stream(control: &Control, index: usize, kind: StreamKind, operation: &'static str) -> Result<()> {
        if !control.state.has_source() {
            return Err(Self::invalid_state(control.state, operation));
        }
        let stream = control.streams.get(index).ok_or(Error::IndexOutOfRange {
            index,
            count: control.streams.len(),
        })?;
        if stream.kind != kind {
            return Err(Error::InvalidArgument(format!(
                "stream {} is {}, not {}",
                index, stream.kind, kind
            )));
        }
        Ok(())
    }

    pub fn select_audio_track(&self, index: usize) -> Result<()> {
        let mut control = self.shared.control.lock();
        Self::check_stream(&control, index, StreamKind::Audio, "select_audio_track")?;
        control.selected_audio = Some(index);
        Ok(())
    }

    pub fn selected_audio_track(&self) -> Option<usize> {
        self.shared.control.lock().selected_audio
    }

    /// Select a subtitle stream; its cues are reported as playback crosses them
    pub fn select_internal_subtitle(&self, index: usize) -> Result<()> {
        let mut control = self.shared.control.lock();
        Self::check_stream(&control, index, StreamKind::Subtitle, "select_internal_subtitle")?;
        control.selected_subtitle = Some(index);
        self.send(Command::SelectSubtitle {
            epoch: control.epoch,
            index,
        })
    }

    pub fn selected_subtitle(&self) -> Option<usize> {
        self.shared.control.lock().selected_subtitle
    }

    /// Load an SRT or WebVTT file as an additional subtitle stream
    pub fn set_external_subtitle(&self, uri: &str) -> Result<()> {
        let control = self.shared.control.lock();
        if !control.state.has_source() {
            return Err(Self::invalid_state(control.state, "set_external_subtitle"));
        }
        self.send(Command::LoadSubtitle {
            epoch: control.epoch,
            uri: uri.to_string(),
        })
    }

    // ---------------------------------------------------------------------
    // Preloading and switching
    // ---------------------------------------------------------------------

    /// Resolve and buffer `uri` without playing it. Preloading an already
    /// preloaded uri is a no-op.
    pub fn preload_src(&self, uri: &str, start_position_ms: i64) -> Result<()> {
        let shared = &self.shared;
        let mut control = shared.control.lock();
        if control.preloads.contains_key(uri) {
            return Ok(());
        }

        let source = MediaSource::url(uri).with_start_position(start_position_ms);
        let lines = shared.new_lines(&source, control.auto_switch_cdn);
        let cancel = CancellationToken::new();
        control.preload_generation += 1;
        let generation = control.preload_generation;
        control.preloads.insert(
            uri.to_string(),
            PreloadSlot {
                generation,
                lines: lines.clone(),
                status: PreloadStatus::Pending(cancel.clone()),
            },
        );
        shared.settle_preload_state(&mut control);

        self.send(Command::Preload {
            uri: uri.to_string(),
            source,
            generation,
            lines,
            cancel,
        })
    }

    /// Drop a preloaded (or preloading) source; unknown uris are ignored
    pub fn unload_src(&self, uri: &str) -> Result<()> {
        let shared = &self.shared;
        let mut control = shared.control.lock();
        let Some(slot) = control.preloads.remove(uri) else {
            return Ok(());
        };
        if let PreloadStatus::Pending(cancel) = slot.status {
            cancel.cancel();
        }
        shared.settle_preload_state(&mut control);
        self.send(Command::Unload {
            uri: uri.to_string(),
        })
    }

    /// Whether `uri` has finished preloading
    pub fn is_preloaded(&self, uri: &str) -> bool {
        self.shared
            .control
            .lock()
            .preloads
            .get(uri)
            .is_some_and(|slot| !slot.is_pending())
    }

    /// Replace whatever is open with a preloaded source and play it
    pub fn play_preloaded_src(&self, uri: &str) -> Result<()> {
        let shared = &self.shared;
        let mut control = shared.control.lock();
        let ready = control.preloads.get(uri).is_some_and(|slot| !slot.is_pending());
        if !ready {
            return Err(Error::NotPreloaded(uri.to_string()));
        }
        let Some(slot) = control.preloads.remove(uri) else {
            return Err(Error::NotPreloaded(uri.to_string()));
        };

        let (epoch, cancel) = shared.begin_session(&mut control, uri, slot.lines, 0);
        shared.transition(&mut control, PlayerState::Opening);
        self.send(Command::PlayPreloaded {
            epoch,
            uri: uri.to_string(),
            cancel,
        })
    }

    /// Switch to another URL, tearing down the current playback
    pub fn switch_src(&self, uri: &str, sync_pts: bool) -> Result<()> {
        self.switch_to_source(MediaSource::url(uri), sync_pts)
    }

    /// Switch to another CDN source, tearing down the current playback
    pub fn switch_cdn_src(&self, src: CdnSource, sync_pts: bool) -> Result<()> {
        self.switch_to_source(MediaSource::cdn(src.lines), sync_pts)
    }

    /// With `sync_pts` the position is kept and the new source must have
    /// the same stream layout; otherwise playback restarts at 0. Live
    /// sources only allow `sync_pts == false`.
    #[instrument(skip(self), fields(player = %self.shared.id))]
    pub fn switch_to_source(&self, source: MediaSource, sync_pts: bool) -> Result<()> {
        let shared = &self.shared;
        let mut control = shared.control.lock();
        if sync_pts && control.live {
            return Err(Error::InvalidArgument(
                "sync_pts is not supported for live sources".into(),
            ));
        }

        let resume = control.state == PlayerState::Playing;
        let position_ms = if sync_pts {
            shared.position_ms.load(Ordering::SeqCst)
        } else {
            source.start_position_ms
        };
        let lines = shared.new_lines(&source, control.auto_switch_cdn);
        let (epoch, cancel) = shared.begin_session(&mut control, &source.uri, lines.clone(), position_ms);
        shared.transition(&mut control, PlayerState::Opening);
        self.send(Command::Switch {
            epoch,
            source,
            lines,
            cancel,
            sync_pts,
            resume,
            position_ms,
        })
    }

    // ---------------------------------------------------------------------
    // CDN lines
    // ---------------------------------------------------------------------

    pub fn cdn_line_count(&self) -> usize {
        self.shared.control.lock().lines.lock().line_count()
    }

    pub fn current_cdn_index(&self) -> Option<usize> {
        self.shared.control.lock().lines.lock().current_index()
    }

    /// Switch lines; reads already in flight finish on the old line
    pub fn switch_cdn_line_by_index(&self, index: usize) -> Result<()> {
        let control = self.shared.control.lock();
        let from = control.lines.lock().switch_to(index)?;
        self.shared.dispatcher.emit(
            control.epoch,
            PlayerEvent::CdnLineSwitched {
                from,
                to: index,
                reason: LineSwitchReason::Manual,
            },
        );
        Ok(())
    }

    /// Arm or disarm automatic failover for this and later sources
    pub fn enable_auto_switch_cdn(&self, enable: bool) {
        let mut control = self.shared.control.lock();
        control.auto_switch_cdn = enable;
        control.lines.lock().set_auto_switch(enable);
    }

    /// Replace the token of the current line
    pub fn renew_cdn_src_token(&self, token: &str, ts: i64) -> Result<()> {
        let control = self.shared.control.lock();
        let line = control.lines.lock().renew_token(token, ts)?;
        self.shared
            .dispatcher
            .emit(control.epoch, PlayerEvent::CdnTokenRenewed { line, ts });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Observers and rendering
    // ---------------------------------------------------------------------

    pub fn set_audio_frame_observer(&self, observer: Option<Arc<dyn AudioFrameObserver>>) {
        self.shared.dispatcher.set_audio_frame_observer(observer);
    }

    pub fn set_video_frame_observer(&self, observer: Option<Arc<dyn VideoFrameObserver>>) {
        self.shared.dispatcher.set_video_frame_observer(observer);
    }

    /// Deliver spectrum data at most once every `interval_ms` (>= 10)
    pub fn register_audio_spectrum_observer(
        &self,
        observer: Arc<dyn AudioSpectrumObserver>,
        interval_ms: u64,
    ) -> Result<()> {
        self.shared
            .dispatcher
            .register_audio_spectrum_observer(observer, interval_ms)
    }

    pub fn unregister_audio_spectrum_observer(&self) {
        self.shared.dispatcher.unregister_audio_spectrum_observer();
    }

    /// Attach a render surface; the player only keeps a weak reference
    pub fn set_view(&self, surface: Option<&Arc<dyn RenderSurface>>) {
        self.shared.dispatcher.set_view(surface);
    }

    pub fn set_render_mode(&self, mode: RenderMode) {
        self.shared.dispatcher.set_render_mode(mode);
    }

    pub fn render_mode(&self) -> RenderMode {
        self.shared.dispatcher.render_mode()
    }

    /// Write the last presented video frame to `path` as PNG
    pub fn take_screenshot(&self, path: impl Into<PathBuf>) -> Result<()> {
        let control = self.shared.control.lock();
        if !matches!(control.state, PlayerState::Playing | PlayerState::Paused) {
            return Err(Self::invalid_state(control.state, "take_screenshot"));
        }
        self.send(Command::Screenshot {
            epoch: control.epoch,
            path: path.into(),
        })
    }
}

impl Drop for MediaPlayer {
    fn drop(&mut self) {
        let control = self.shared.control.lock();
        control.session_cancel.cancel();
        for slot in control.preloads.values() {
            if let PreloadStatus::Pending(cancel) = &slot.status {
                cancel.cancel();
            }
        }
        debug!(player = %self.shared.id, "Media player dropped");
    }
}
