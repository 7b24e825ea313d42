//! Frame and event dispatch
//!
//! Each player owns one [`Dispatcher`]. It holds at most one observer per
//! frame kind (registering replaces, `None` unregisters), the weakly held
//! render surface, and the broadcast channel that carries player events.
//! Observers are invoked on the player's worker, in presentation order,
//! and never while a dispatcher lock is held.

use crate::{
    events::{PlayerEvent, PlayerEventRecord},
    spectrum::{SpectrumAnalyzer, DEFAULT_FFT_SIZE},
    types::{AudioFrame, AudioSpectrum, PlayerId, RenderMode, VideoFrame},
    Error, Result,
};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Smallest accepted spectrum interval (ms)
pub const MIN_SPECTRUM_INTERVAL_MS: u64 = 10;

/// Receives decoded PCM frames
pub trait AudioFrameObserver: Send + Sync {
    fn on_audio_frame(&self, frame: &AudioFrame);
}

/// Receives decoded video frames
pub trait VideoFrameObserver: Send + Sync {
    fn on_video_frame(&self, frame: &VideoFrame);
}

/// Receives spectrum snapshots at most once per registered interval
pub trait AudioSpectrumObserver: Send + Sync {
    fn on_audio_spectrum(&self, spectrum: &AudioSpectrum);
}

/// Host-owned view that presents video frames
pub trait RenderSurface: Send + Sync {
    fn present(&self, frame: &VideoFrame, mode: RenderMode);
}

struct SpectrumSlot {
    observer: Option<Arc<dyn AudioSpectrumObserver>>,
    interval: Duration,
    last_dispatch: Option<Instant>,
    analyzer: SpectrumAnalyzer,
}

/// Per-player observer slots and event channel
pub struct Dispatcher {
    player_id: PlayerId,
    audio: RwLock<Option<Arc<dyn AudioFrameObserver>>>,
    video: RwLock<Option<Arc<dyn VideoFrameObserver>>>,
    spectrum: Mutex<SpectrumSlot>,
    surface: RwLock<Option<Weak<dyn RenderSurface>>>,
    render_mode: RwLock<RenderMode>,
    events: broadcast::Sender<PlayerEventRecord>,
    sequence: AtomicU64,
}

impl Dispatcher {
    pub fn new(player_id: PlayerId, event_capacity: usize) -> Result<Self> {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Ok(Self {
            player_id,
            audio: RwLock::new(None),
            video: RwLock::new(None),
            spectrum: Mutex::new(SpectrumSlot {
                observer: None,
                interval: Duration::ZERO,
                last_dispatch: None,
                analyzer: SpectrumAnalyzer::new(DEFAULT_FFT_SIZE)?,
            }),
            surface: RwLock::new(None),
            render_mode: RwLock::new(RenderMode::default()),
            events,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn set_audio_frame_observer(&self, observer: Option<Arc<dyn AudioFrameObserver>>) {
        *self.audio.write() = observer;
    }

    pub fn set_video_frame_observer(&self, observer: Option<Arc<dyn VideoFrameObserver>>) {
        *self.video.write() = observer;
    }

    /// Register (replacing) the spectrum observer
    pub fn register_audio_spectrum_observer(
        &self,
        observer: Arc<dyn AudioSpectrumObserver>,
        interval_ms: u64,
    ) -> Result<()> {
        if interval_ms < MIN_SPECTRUM_INTERVAL_MS {
            return Err(Error::InvalidArgument(format!(
                "spectrum interval must be at least {} ms",
                MIN_SPECTRUM_INTERVAL_MS
            )));
        }
        let mut slot = self.spectrum.lock();
        slot.observer = Some(observer);
        slot.interval = Duration::from_millis(interval_ms);
        slot.last_dispatch = None;
        slot.analyzer.reset();
        Ok(())
    }

    pub fn unregister_audio_spectrum_observer(&self) {
        let mut slot = self.spectrum.lock();
        slot.observer = None;
        slot.analyzer.reset();
    }

    /// Hold `surface` weakly; `None` detaches the current one
    pub fn set_view(&self, surface: Option<&Arc<dyn RenderSurface>>) {
        *self.surface.write() = surface.map(Arc::downgrade);
    }

    pub fn set_render_mode(&self, mode: RenderMode) {
        *self.render_mode.write() = mode;
    }

    pub fn render_mode(&self) -> RenderMode {
        *self.render_mode.read()
    }

    /// Deliver an audio frame and, when due, a spectrum snapshot
    pub fn dispatch_audio(&self, frame: &AudioFrame) {
        let observer = self.audio.read().clone();
        if let Some(observer) = observer {
            observer.on_audio_frame(frame);
        }

        let due = {
            let mut slot = self.spectrum.lock();
            match slot.observer.clone() {
                Some(observer) => {
                    slot.analyzer.push(&frame.mono());
                    let now = Instant::now();
                    let ready = slot
                        .last_dispatch
                        .map_or(true, |last| now.duration_since(last) >= slot.interval);
                    if ready {
                        slot.last_dispatch = Some(now);
                        Some((observer, slot.analyzer.analyze()))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some((observer, magnitudes_db)) = due {
            trace!(pts_ms = frame.pts_ms, "Spectrum dispatched");
            observer.on_audio_spectrum(&AudioSpectrum {
                pts_ms: frame.pts_ms,
                magnitudes_db,
            });
        }
    }

    /// Deliver a video frame to the observer and the render surface
    pub fn dispatch_video(&self, frame: &VideoFrame) {
        let observer = self.video.read().clone();
        if let Some(observer) = observer {
            observer.on_video_frame(frame);
        }

        let surface = self.surface.read().as_ref().and_then(Weak::upgrade);
        if let Some(surface) = surface {
            surface.present(frame, self.render_mode());
        }
    }

    /// Forget buffered spectrum input, e.g. after a seek
    pub fn reset_spectrum(&self) {
        self.spectrum.lock().analyzer.reset();
    }

    /// Broadcast an event for session `epoch`
    pub fn emit(&self, epoch: u64, event: PlayerEvent) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(player = %self.player_id, epoch, sequence, event = ?event, "Player event");

        let record = PlayerEventRecord {
            player_id: self.player_id,
            epoch,
            sequence,
            timestamp: Utc::now(),
            event,
        };
        // No subscribers is fine
        let _ = self.events.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEventRecord> {
        self.events.subscribe()
    }
}
