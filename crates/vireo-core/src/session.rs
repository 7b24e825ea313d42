//! Player worker - owns the playing session of one player
//!
//! Coordinates:
//! - Source resolution for open, switch and preload
//! - Pacing of delivery units at the playback speed
//! - Frame, subtitle and position dispatch
//! - Looping and end of media
//!
//! The worker is the only place a [`ResolvedSource`] is read from. Work that
//! may block (resolution, subtitle fetches, screenshots) runs in spawned
//! tasks that report back as completions tagged with their session epoch.

use crate::{
    cdn::{CdnLineManager, LineSwitchReason},
    events::PlayerEvent,
    media::{Decoded, MediaLayout},
    player::{Control, PreloadStatus, Shared, OPTION_AUDIO_FRAME_MS, OPTION_POSITION_REPORT_INTERVAL_MS},
    screenshot,
    source::{LineFailover, ResolvedSource},
    subtitle::{active_cue, parse_subtitle, subtitle_codec},
    transport::{parse_uri, Transport},
    types::*,
    Error, Result,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Requests from the player handle
pub(crate) enum Command {
    Open {
        epoch: u64,
        source: MediaSource,
        lines: Arc<Mutex<CdnLineManager>>,
        cancel: CancellationToken,
    },
    Switch {
        epoch: u64,
        source: MediaSource,
        lines: Arc<Mutex<CdnLineManager>>,
        cancel: CancellationToken,
        sync_pts: bool,
        resume: bool,
        position_ms: i64,
    },
    Preload {
        uri: String,
        source: MediaSource,
        generation: u64,
        lines: Arc<Mutex<CdnLineManager>>,
        cancel: CancellationToken,
    },
    Unload {
        uri: String,
    },
    PlayPreloaded {
        epoch: u64,
        uri: String,
        cancel: CancellationToken,
    },
    Play {
        epoch: u64,
    },
    Pause {
        epoch: u64,
    },
    Seek {
        epoch: u64,
        position_ms: i64,
    },
    Close,
    LoadSubtitle {
        epoch: u64,
        uri: String,
    },
    SelectSubtitle {
        epoch: u64,
        index: usize,
    },
    Screenshot {
        epoch: u64,
        path: PathBuf,
    },
}

/// Results of spawned work
enum Completion {
    Resolved {
        epoch: u64,
        purpose: Purpose,
        result: Box<Result<ResolvedSource>>,
        failovers: Vec<LineFailover>,
    },
    Preloaded {
        uri: String,
        generation: u64,
        result: Box<Result<ResolvedSource>>,
    },
    Subtitle {
        epoch: u64,
        uri: String,
        result: Result<(&'static str, Vec<TextCue>)>,
    },
    Screenshot {
        epoch: u64,
        path: PathBuf,
        result: Result<()>,
    },
}

enum Purpose {
    Open {
        uri: String,
    },
    Switch {
        uri: String,
        sync_pts: bool,
        resume: bool,
        position_ms: i64,
        previous: Option<MediaLayout>,
    },
}

enum Installed {
    Opened,
    Switched,
}

/// The source being played and its presentation state
struct Session {
    epoch: u64,
    source: ResolvedSource,
    cancel: CancellationToken,
    playing: bool,
    next_due: Option<Instant>,
    loops_done: u32,
    audio_frame_ms: u32,
    report_interval: Option<Duration>,
    last_report: Option<Instant>,
    subtitles: Vec<(usize, Vec<TextCue>)>,
    selected_subtitle: Option<usize>,
    active_cue: Option<usize>,
    last_video: Option<VideoFrame>,
}

impl Session {
    fn new(
        epoch: u64,
        source: ResolvedSource,
        cancel: CancellationToken,
        shared: &Shared,
        options: &HashMap<String, i64>,
    ) -> Self {
        let audio_frame_ms = options
            .get(OPTION_AUDIO_FRAME_MS)
            .map(|&ms| ms as u32)
            .unwrap_or(shared.config.audio_frame_ms);
        let report_ms = options
            .get(OPTION_POSITION_REPORT_INTERVAL_MS)
            .map(|&ms| ms as u64)
            .unwrap_or(shared.config.position_report_interval_ms);

        Self {
            epoch,
            source,
            cancel,
            playing: false,
            next_due: None,
            loops_done: 0,
            audio_frame_ms,
            report_interval: (report_ms > 0).then(|| Duration::from_millis(report_ms)),
            last_report: None,
            subtitles: Vec::new(),
            selected_subtitle: None,
            active_cue: None,
            last_video: None,
        }
    }

    fn start(&mut self) {
        self.playing = true;
        self.next_due = Some(Instant::now());
    }

    fn halt(&mut self) {
        self.playing = false;
        self.next_due = None;
    }

    fn due(&self) -> Option<Instant> {
        if self.playing {
            self.next_due
        } else {
            None
        }
    }
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    session: Option<Session>,
    preloaded: HashMap<String, ResolvedSource>,
}

impl Worker {
    pub fn new(shared: Arc<Shared>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        Self {
            shared,
            commands,
            completions_tx,
            completions,
            session: None,
            preloaded: HashMap::new(),
        }
    }

    /// Run until the player handle is dropped
    pub async fn run(mut self) {
        debug!(player = %self.shared.id, "Player worker started");

        loop {
            let due = self.session.as_ref().and_then(Session::due);
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(completion) = self.completions.recv() => self.handle_completion(completion),
                _ = sleep_until(due.unwrap_or_else(Instant::now)), if due.is_some() => self.tick().await,
            }
        }

        if let Some(session) = self.session.take() {
            session.cancel.cancel();
        }
        debug!(player = %self.shared.id, "Player worker stopped");
    }

    /// Emit `event` only if `epoch` is still the current session
    fn emit_current(&self, epoch: u64, event: PlayerEvent) {
        let control = self.shared.control.lock();
        if control.epoch == epoch {
            self.shared.dispatcher.emit(epoch, event);
        }
    }

    fn session_for(&mut self, epoch: u64) -> Option<&mut Session> {
        self.session.as_mut().filter(|s| s.epoch == epoch)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open {
                epoch,
                source,
                lines,
                cancel,
            } => {
                self.session = None;
                let purpose = Purpose::Open {
                    uri: source.uri.clone(),
                };
                self.spawn_resolve(epoch, purpose, source, lines, cancel);
            }
            Command::Switch {
                epoch,
                source,
                lines,
                cancel,
                sync_pts,
                resume,
                position_ms,
            } => {
                let previous = self.session.take().map(|s| s.source.layout().clone());
                let purpose = Purpose::Switch {
                    uri: source.uri.clone(),
                    sync_pts,
                    resume,
                    position_ms,
                    previous,
                };
                self.spawn_resolve(epoch, purpose, source, lines, cancel);
            }
            Command::Preload {
                uri,
                source,
                generation,
                lines,
                cancel,
            } => {
                let shared = self.shared.clone();
                let tx = self.completions_tx.clone();
                tokio::spawn(async move {
                    let work = tokio::spawn(async move { preload(&shared, source, lines, &cancel).await });
                    let result = work
                        .await
                        .unwrap_or_else(|e| Err(Error::Internal(format!("preload task failed: {}", e))));
                    let _ = tx.send(Completion::Preloaded {
                        uri,
                        generation,
                        result: Box::new(result),
                    });
                });
            }
            Command::Unload { uri } => {
                self.preloaded.remove(&uri);
            }
            Command::PlayPreloaded { epoch, uri, cancel } => {
                self.session = None;
                let shared = self.shared.clone();
                let mut control = shared.control.lock();
                if control.epoch != epoch {
                    return;
                }
                match self.preloaded.remove(&uri) {
                    Some(resolved) => {
                        let session =
                            self.install(&shared, &mut control, epoch, resolved, cancel, Installed::Opened, true);
                        self.session = Some(session);
                    }
                    None => {
                        let error = Error::NotPreloaded(uri.clone());
                        shared.transition(&mut control, PlayerState::Failed);
                        shared.dispatcher.emit(epoch, PlayerEvent::open_failed(&uri, &error));
                    }
                }
            }
            Command::Play { epoch } => {
                if let Some(session) = self.session_for(epoch) {
                    session.start();
                }
            }
            Command::Pause { epoch } => {
                if let Some(session) = self.session_for(epoch) {
                    session.halt();
                }
            }
            Command::Seek { epoch, position_ms } => {
                let Some(session) = self.session_for(epoch) else {
                    return;
                };
                let reached = session.source.seek(position_ms).round() as i64;
                session.active_cue = None;
                if session.playing {
                    session.next_due = Some(Instant::now());
                }
                self.shared.position_ms.store(reached, Ordering::SeqCst);
                self.shared.dispatcher.reset_spectrum();
                self.emit_current(epoch, PlayerEvent::SeekCompleted { position_ms: reached });
            }
            Command::Close => {
                if let Some(session) = self.session.take() {
                    session.cancel.cancel();
                }
            }
            Command::LoadSubtitle { epoch, uri } => {
                let transport = self.shared.resolver.transport().clone();
                let tx = self.completions_tx.clone();
                tokio::spawn(async move {
                    let result = fetch_subtitle(transport.as_ref(), &uri).await;
                    let _ = tx.send(Completion::Subtitle { epoch, uri, result });
                });
            }
            Command::SelectSubtitle { epoch, index } => {
                let Some(session) = self.session_for(epoch) else {
                    return;
                };
                session.selected_subtitle = Some(index);
                let previous = session.active_cue.take();
                if let Some(previous) = previous {
                    debug!(previous, "Clearing cue after subtitle change");
                    self.emit_current(
                        epoch,
                        PlayerEvent::SubtitleCue {
                            stream_index: index,
                            cue: None,
                        },
                    );
                }
            }
            Command::Screenshot { epoch, path } => {
                let frame = self
                    .session_for(epoch)
                    .and_then(|s| s.last_video.clone());
                let Some(frame) = frame else {
                    self.emit_current(
                        epoch,
                        PlayerEvent::ScreenshotFailed {
                            path: path.display().to_string(),
                            message: "no video frame has been presented".into(),
                        },
                    );
                    return;
                };

                let tx = self.completions_tx.clone();
                tokio::spawn(async move {
                    let target = path.clone();
                    let result = tokio::task::spawn_blocking(move || screenshot::write_png(&frame, &target))
                        .await
                        .unwrap_or_else(|e| Err(Error::Internal(e.to_string())));
                    let _ = tx.send(Completion::Screenshot { epoch, path, result });
                });
            }
        }
    }

    fn spawn_resolve(
        &self,
        epoch: u64,
        purpose: Purpose,
        source: MediaSource,
        lines: Arc<Mutex<CdnLineManager>>,
        cancel: CancellationToken,
    ) {
        let shared = self.shared.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            // A panicking resolution still completes, as an internal failure
            let work = tokio::spawn(async move {
                let mut failovers = Vec::new();
                let result = shared
                    .resolver
                    .resolve_tracked(source, lines, &cancel, &mut failovers)
                    .await;
                (result, failovers)
            });
            let (result, failovers) = work.await.unwrap_or_else(|e| {
                (Err(Error::Internal(format!("resolve task failed: {}", e))), Vec::new())
            });
            let _ = tx.send(Completion::Resolved {
                epoch,
                purpose,
                result: Box::new(result),
                failovers,
            });
        });
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Resolved {
                epoch,
                purpose,
                result,
                failovers,
            } => self.on_resolved(epoch, purpose, *result, failovers),
            Completion::Preloaded {
                uri,
                generation,
                result,
            } => self.on_preloaded(uri, generation, *result),
            Completion::Subtitle { epoch, uri, result } => self.on_subtitle(epoch, uri, result),
            Completion::Screenshot { epoch, path, result } => {
                let path = path.display().to_string();
                let event = match result {
                    Ok(()) => {
                        info!(path = %path, "Screenshot written");
                        PlayerEvent::ScreenshotTaken { path }
                    }
                    Err(e) => PlayerEvent::ScreenshotFailed {
                        path,
                        message: e.to_string(),
                    },
                };
                self.emit_current(epoch, event);
            }
        }
    }

    fn on_resolved(
        &mut self,
        epoch: u64,
        purpose: Purpose,
        result: Result<ResolvedSource>,
        failovers: Vec<LineFailover>,
    ) {
        let shared = self.shared.clone();
        let mut control = shared.control.lock();
        if control.epoch != epoch {
            debug!(epoch, current = control.epoch, "Dropping stale resolution");
            return;
        }
        let cancel = control.session_cancel.clone();
        // Line changes stand whether or not the resolution succeeded
        for failover in failovers {
            shared.dispatcher.emit(epoch, failover_event(failover));
        }

        match purpose {
            Purpose::Open { uri } => match result {
                Ok(resolved) => {
                    let session =
                        self.install(&shared, &mut control, epoch, resolved, cancel, Installed::Opened, false);
                    self.session = Some(session);
                }
                Err(e) => {
                    warn!(uri = %uri, error = %e, "Open failed");
                    shared.transition(&mut control, PlayerState::Failed);
                    shared.dispatcher.emit(epoch, PlayerEvent::open_failed(&uri, &e));
                }
            },
            Purpose::Switch {
                uri,
                sync_pts,
                resume,
                position_ms,
                previous,
            } => {
                let checked = result.and_then(|mut resolved| {
                    if sync_pts {
                        if resolved.is_live() {
                            return Err(Error::InvalidArgument(
                                "sync_pts is not supported for live sources".into(),
                            ));
                        }
                        if let Some(previous) = &previous {
                            if !previous.is_compatible_with(resolved.layout()) {
                                return Err(Error::IncompatibleLayout);
                            }
                        }
                        resolved.seek(position_ms);
                    }
                    Ok(resolved)
                });

                match checked {
                    Ok(resolved) => {
                        let session =
                            self.install(&shared, &mut control, epoch, resolved, cancel, Installed::Switched, resume);
                        self.session = Some(session);
                    }
                    Err(e) => {
                        warn!(uri = %uri, error = %e, "Switch failed");
                        shared.transition(&mut control, PlayerState::Failed);
                        shared.dispatcher.emit(epoch, PlayerEvent::switch_failed(&uri, &e));
                    }
                }
            }
        }
    }

    /// Make `resolved` the current source; the player becomes Ready
    fn install(
        &self,
        shared: &Shared,
        control: &mut Control,
        epoch: u64,
        mut resolved: ResolvedSource,
        cancel: CancellationToken,
        installed: Installed,
        autoplay: bool,
    ) -> Session {
        for failover in resolved.take_failovers() {
            shared.dispatcher.emit(epoch, failover_event(failover));
        }

        let position_ms = resolved.position_ms().round() as i64;
        let duration_ms = resolved.duration_ms();
        let stream_count = resolved.streams().len();
        shared.source_ready(
            control,
            resolved.streams().to_vec(),
            resolved.is_live(),
            duration_ms,
            position_ms,
        );
        shared.transition(control, PlayerState::Ready);

        let uri = resolved.uri().to_string();
        info!(uri = %uri, duration_ms = ?duration_ms, from_cache = resolved.from_cache(), "Source ready");
        let event = match installed {
            Installed::Opened => PlayerEvent::OpenCompleted {
                uri,
                duration_ms,
                stream_count,
            },
            Installed::Switched => PlayerEvent::SourceSwitched { uri, position_ms },
        };

        let mut session = Session::new(epoch, resolved, cancel, shared, &control.options);
        if autoplay {
            session.start();
            shared.transition(control, PlayerState::Playing);
        }
        shared.dispatcher.emit(epoch, event);
        session
    }

    fn on_preloaded(&mut self, uri: String, generation: u64, result: Result<ResolvedSource>) {
        let shared = self.shared.clone();
        let mut control = shared.control.lock();
        let current = control
            .preloads
            .get(&uri)
            .is_some_and(|slot| slot.generation == generation && slot.is_pending());
        if !current {
            debug!(uri = %uri, "Dropping stale preload");
            return;
        }

        let event = match result {
            Ok(resolved) => {
                self.preloaded.insert(uri.clone(), resolved);
                if let Some(slot) = control.preloads.get_mut(&uri) {
                    slot.status = PreloadStatus::Ready;
                }
                info!(uri = %uri, "Preload completed");
                PlayerEvent::PreloadCompleted { uri }
            }
            Err(e) => {
                warn!(uri = %uri, error = %e, "Preload failed");
                control.preloads.remove(&uri);
                PlayerEvent::preload_failed(&uri, &e)
            }
        };
        shared.settle_preload_state(&mut control);
        shared.dispatcher.emit(control.epoch, event);
    }

    fn on_subtitle(&mut self, epoch: u64, uri: String, result: Result<(&'static str, Vec<TextCue>)>) {
        let shared = self.shared.clone();
        let mut control = shared.control.lock();
        if control.epoch != epoch {
            return;
        }
        let Some(session) = self.session.as_mut().filter(|s| s.epoch == epoch) else {
            return;
        };

        match result {
            Ok((codec, cues)) => {
                let stream_index = control.streams.len();
                let cue_count = cues.len();
                control.streams.push(StreamInfo {
                    index: stream_index,
                    kind: StreamKind::Subtitle,
                    codec_name: codec.to_string(),
                    codec_params: Bytes::new(),
                    language: None,
                    duration_ms: cues.iter().map(|c| c.end_ms).max(),
                });
                session.subtitles.push((stream_index, cues));
                info!(uri = %uri, stream_index, cue_count, "External subtitle loaded");
                shared.dispatcher.emit(
                    epoch,
                    PlayerEvent::SubtitleLoaded {
                        stream_index,
                        cue_count,
                    },
                );
            }
            Err(e) => {
                warn!(uri = %uri, error = %e, "External subtitle failed");
                shared.dispatcher.emit(
                    epoch,
                    PlayerEvent::SubtitleFailed {
                        uri,
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    /// Present the next unit of the playing session
    async fn tick(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let epoch = session.epoch;
        let cancel = session.cancel.clone();
        let frame_ms = session.audio_frame_ms;

        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = session.source.next_unit(frame_ms) => read,
        };
        let failovers = session.source.take_failovers();

        for failover in failovers {
            self.emit_current(epoch, failover_event(failover));
        }

        match read {
            Ok(Some((pts_ms, unit))) => self.present(epoch, pts_ms, unit),
            Ok(None) => self.end_of_media(epoch),
            Err(Error::Cancelled) => {}
            Err(e) => self.fail_session(epoch, e),
        }
    }

    fn present(&mut self, epoch: u64, pts_ms: f64, unit: Bytes) {
        // A newer session was started while this unit was in flight
        if self.shared.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        let shared = self.shared.clone();
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let position_ms = pts_ms.round() as i64;
        let unit_ms = session.source.layout().unit_duration_ms(unit.len());
        let decoded = match session.source.layout().decode(&unit, position_ms) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.fail_session(epoch, e);
                return;
            }
        };

        match decoded {
            Some(Decoded::Audio(mut frame)) => {
                shared.params.apply(&mut frame);
                shared.dispatcher.dispatch_audio(&frame);
            }
            Some(Decoded::Video(frame)) => {
                shared.dispatcher.dispatch_video(&frame);
                session.last_video = Some(frame);
            }
            None => {}
        }
        shared.position_ms.store(position_ms, Ordering::SeqCst);

        let now = Instant::now();
        let next = session.next_due.unwrap_or(now) + shared.params.wall_time(unit_ms);
        session.next_due = Some(next.max(now));

        let mut events = Vec::new();
        if let Some(stream_index) = session.selected_subtitle {
            if let Some((_, cues)) = session.subtitles.iter().find(|(i, _)| *i == stream_index) {
                let active = active_cue(cues, position_ms);
                if active != session.active_cue {
                    session.active_cue = active;
                    events.push(PlayerEvent::SubtitleCue {
                        stream_index,
                        cue: active.map(|i| cues[i].clone()),
                    });
                }
            }
        }
        if let Some(interval) = session.report_interval {
            let due = session
                .last_report
                .map_or(true, |last| now.duration_since(last) >= interval);
            if due {
                session.last_report = Some(now);
                events.push(PlayerEvent::PositionChanged { position_ms });
            }
        }

        for event in events {
            self.emit_current(epoch, event);
        }
    }

    fn end_of_media(&mut self, epoch: u64) {
        let loop_count = self.shared.params.loop_count.load(Ordering::Relaxed);
        let Some(session) = self.session.as_mut().filter(|s| s.epoch == epoch) else {
            return;
        };

        if loop_count < 0 || i64::from(session.loops_done) < i64::from(loop_count) {
            session.loops_done += 1;
            session.source.seek(0);
            session.active_cue = None;
            session.next_due = Some(Instant::now());
            let loops_done = session.loops_done;
            self.shared.dispatcher.reset_spectrum();
            debug!(loops_done, "Looping to start");
            self.emit_current(epoch, PlayerEvent::LoopCompleted { loops_done });
            return;
        }

        let shared = self.shared.clone();
        let mut control = shared.control.lock();
        if control.epoch != epoch {
            return;
        }
        self.session = None;
        shared.close_source(&mut control);
        shared.transition(&mut control, PlayerState::Stopped);
        info!("Playback completed");
        shared.dispatcher.emit(epoch, PlayerEvent::PlaybackCompleted);
    }

    /// An unrecovered read or decode error ends the session
    fn fail_session(&mut self, epoch: u64, error: Error) {
        let shared = self.shared.clone();
        let mut control = shared.control.lock();
        if control.epoch != epoch {
            return;
        }
        warn!(error = %error, "Playback failed");
        self.session = None;
        shared.close_source(&mut control);
        shared.transition(&mut control, PlayerState::Failed);
        shared.dispatcher.emit(epoch, PlayerEvent::transport_error(&error));
    }
}

fn failover_event(failover: LineFailover) -> PlayerEvent {
    PlayerEvent::CdnLineSwitched {
        from: failover.from,
        to: failover.to,
        reason: LineSwitchReason::AutoFailover,
    }
}

async fn preload(
    shared: &Shared,
    source: MediaSource,
    lines: Arc<Mutex<CdnLineManager>>,
    cancel: &CancellationToken,
) -> Result<ResolvedSource> {
    let mut resolved = shared.resolver.resolve(source, lines, cancel).await?;
    tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        buffered = resolved.prefetch(shared.config.preload_bytes) => buffered?,
    }
    Ok(resolved)
}

async fn fetch_subtitle(transport: &dyn Transport, uri: &str) -> Result<(&'static str, Vec<TextCue>)> {
    let url = parse_uri(uri)?;
    let data = transport.fetch(&url).await?;
    let text = String::from_utf8_lossy(&data);
    let cues = parse_subtitle(&text)?;
    Ok((subtitle_codec(&text), cues))
}
