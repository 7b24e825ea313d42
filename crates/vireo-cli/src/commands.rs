//! CLI command implementations

use crate::output::{self, OutputFormat};
use anyhow::{bail, Context};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep_until, Instant};
use vireo_core::{
    media::encode_wav_pcm16, CacheManager, EngineConfig, MediaPlayer, MediaSource, PlayerEvent,
    PlayerEventRecord, PlayerState, StreamInfo,
};

/// Settings shared by every command
pub struct Settings {
    pub config: EngineConfig,
    pub cache_dir: Option<PathBuf>,
    pub format: OutputFormat,
}

impl Settings {
    pub fn load(config: Option<&Path>, cache_dir: Option<PathBuf>, format: &str) -> anyhow::Result<Self> {
        let config = match config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => EngineConfig::default(),
        };
        Ok(Self {
            config,
            cache_dir,
            format: OutputFormat::from(format),
        })
    }

    async fn cache(&self) -> anyhow::Result<Option<Arc<CacheManager>>> {
        match &self.cache_dir {
            Some(dir) => {
                let cache = CacheManager::open(dir, self.config.cache.clone()).await?;
                Ok(Some(Arc::new(cache)))
            }
            None => Ok(None),
        }
    }

    async fn require_cache(&self) -> anyhow::Result<CacheManager> {
        let dir = self
            .cache_dir
            .as_ref()
            .context("--cache-dir is required for cache commands")?;
        Ok(CacheManager::open(dir, self.config.cache.clone()).await?)
    }

    async fn player(&self) -> anyhow::Result<MediaPlayer> {
        let cache = self.cache().await?;
        Ok(MediaPlayer::with_default_transport(self.config.player.clone(), cache)?)
    }
}

async fn next_event(events: &mut broadcast::Receiver<PlayerEventRecord>) -> anyhow::Result<PlayerEventRecord> {
    loop {
        match events.recv().await {
            Ok(record) => return Ok(record),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event stream lagged");
            }
            Err(RecvError::Closed) => bail!("player closed its event stream"),
        }
    }
}

#[derive(Serialize)]
struct ProbeReport {
    uri: String,
    duration_ms: Option<i64>,
    live: bool,
    streams: Vec<StreamInfo>,
}

/// Resolve a source and print its streams
pub async fn probe(settings: &Settings, uri: &str) -> anyhow::Result<()> {
    let player = settings.player().await?;
    let mut events = player.subscribe();
    player.open_url(uri, 0)?;

    loop {
        match next_event(&mut events).await?.event {
            PlayerEvent::OpenCompleted { .. } => break,
            PlayerEvent::OpenFailed { kind, message, .. } => bail!("{} ({})", message, kind),
            _ => {}
        }
    }

    let streams: Vec<StreamInfo> = (0..player.stream_count())
        .filter_map(|i| player.stream_by_index(i).ok())
        .collect();
    let report = ProbeReport {
        uri: uri.to_string(),
        duration_ms: player.duration(),
        live: player.duration().is_none(),
        streams,
    };

    match settings.format {
        OutputFormat::Json => output::print_json(&report)?,
        OutputFormat::Text => {
            println!("{}", style(&report.uri).bold());
            println!("  Duration: {}", output::format_duration(report.duration_ms));
            println!("{}", output::stream_table(&report.streams));
        }
    }
    Ok(())
}

/// Options of the `play` command
pub struct PlayOptions {
    pub seconds: Option<u64>,
    pub volume: i32,
    pub speed: i32,
    pub loop_count: i32,
    pub cdn_lines: Vec<String>,
    pub subtitle: Option<String>,
}

fn progress_bar(duration_ms: Option<i64>) -> anyhow::Result<ProgressBar> {
    let bar = match duration_ms {
        Some(ms) => {
            let bar = ProgressBar::new(ms.max(0) as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} ms {msg}")?
                    .progress_chars("=> "),
            );
            bar
        }
        None => {
            let bar = ProgressBar::new_spinner();
            bar.enable_steady_tick(Duration::from_millis(200));
            bar
        }
    };
    Ok(bar)
}

/// Play a source until it completes, fails, times out or Ctrl-C
pub async fn play(settings: &Settings, uri: &str, options: PlayOptions) -> anyhow::Result<()> {
    let player = settings.player().await?;
    let mut events = player.subscribe();

    player.adjust_playout_volume(options.volume);
    player.set_playback_speed(options.speed);
    player.set_loop_count(options.loop_count)?;

    let source = if options.cdn_lines.is_empty() {
        MediaSource::url(uri)
    } else {
        let mut lines = vec![uri.to_string()];
        lines.extend(options.cdn_lines.iter().cloned());
        player.enable_auto_switch_cdn(true);
        MediaSource::cdn(lines)
    };
    // Downloads are cached only when a cache directory is configured
    player.open_with_media_source(source.with_cacheable(settings.cache_dir.is_some()))?;

    let deadline = options
        .seconds
        .map(|s| Instant::now() + Duration::from_secs(s));
    let mut progress: Option<ProgressBar> = None;

    let result = loop {
        let record = tokio::select! {
            record = next_event(&mut events) => record?,
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                player.stop()?;
                break Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                player.stop()?;
                break Ok(());
            }
        };

        match settings.format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&record)?),
            OutputFormat::Text => {
                let line = output::format_event(&record);
                match &progress {
                    Some(bar) => bar.println(line),
                    None => println!("{}", line),
                }
            }
        }

        match &record.event {
            PlayerEvent::OpenCompleted { duration_ms, .. } => {
                if let Some(subtitle) = &options.subtitle {
                    player.set_external_subtitle(subtitle)?;
                }
                player.play()?;
                if settings.format == OutputFormat::Text {
                    progress = Some(progress_bar(*duration_ms)?);
                }
            }
            PlayerEvent::SubtitleLoaded { stream_index, .. } => {
                player.select_internal_subtitle(*stream_index)?;
            }
            PlayerEvent::PositionChanged { position_ms } => {
                if let Some(bar) = &progress {
                    bar.set_position(*position_ms as u64);
                }
            }
            PlayerEvent::PlaybackCompleted => break Ok(()),
            event if event.is_failure() && player.state() == PlayerState::Failed => {
                break Err(anyhow::anyhow!("playback failed: {:?}", event));
            }
            _ => {}
        }
    };

    if let Some(bar) = progress {
        bar.finish_and_clear();
    }
    result
}

/// List cached entries
pub async fn cache_list(settings: &Settings) -> anyhow::Result<()> {
    let cache = settings.require_cache().await?;
    let entries = cache.entries().await;

    match settings.format {
        OutputFormat::Json => output::print_json(&entries)?,
        OutputFormat::Text => {
            println!("{}", output::cache_table(&entries));
            println!(
                "{} files, {} bytes",
                cache.cache_file_count().await,
                cache.total_size().await
            );
        }
    }
    Ok(())
}

/// Remove the entry for `uri`
pub async fn cache_remove(settings: &Settings, uri: &str) -> anyhow::Result<()> {
    let cache = settings.require_cache().await?;
    if cache.remove_cache_by_uri(uri).await? {
        println!("Removed {}", uri);
    } else {
        println!("{} is not cached", uri);
    }
    Ok(())
}

/// Remove the least recently used entry
pub async fn cache_remove_old(settings: &Settings) -> anyhow::Result<()> {
    let cache = settings.require_cache().await?;
    match cache.remove_old_cache().await? {
        Some(entry) => println!("Removed {} ({} bytes)", entry.uri, entry.byte_size),
        None => println!("Cache is empty"),
    }
    Ok(())
}

/// Remove every entry
pub async fn cache_clear(settings: &Settings) -> anyhow::Result<()> {
    let cache = settings.require_cache().await?;
    let report = cache.remove_all_caches().await?;

    match settings.format {
        OutputFormat::Json => output::print_json(&report)?,
        OutputFormat::Text => {
            println!("Removed {} of {} entries", report.removed, report.attempted);
        }
    }
    if !report.is_complete() {
        bail!("{} entries could not be removed", report.attempted - report.removed);
    }
    Ok(())
}

#[derive(Serialize)]
struct CacheLimits {
    max_file_count: usize,
    max_total_size: u64,
    file_count: usize,
    total_size: u64,
    auto_remove: bool,
}

/// Show or change the cache limits; lowering a limit evicts immediately
pub async fn cache_limits(settings: &Settings, count: Option<usize>, size: Option<u64>) -> anyhow::Result<()> {
    let cache = settings.require_cache().await?;
    if let Some(count) = count {
        cache.set_max_cache_file_count(count).await?;
    }
    if let Some(size) = size {
        cache.set_max_cache_file_size(size).await?;
    }

    let limits = CacheLimits {
        max_file_count: cache.max_cache_file_count().await,
        max_total_size: cache.max_cache_file_size().await,
        file_count: cache.cache_file_count().await,
        total_size: cache.total_size().await,
        auto_remove: cache.auto_remove_enabled().await,
    };
    match settings.format {
        OutputFormat::Json => output::print_json(&limits)?,
        OutputFormat::Text => {
            println!("Max files: {} (holding {})", limits.max_file_count, limits.file_count);
            println!("Max size:  {} bytes (holding {})", limits.max_total_size, limits.total_size);
            println!("Auto remove: {}", limits.auto_remove);
        }
    }
    Ok(())
}

/// Write a mono 16-bit sine tone
pub async fn tone(path: &Path, freq: f32, seconds: u32, rate: u32) -> anyhow::Result<()> {
    if rate == 0 {
        bail!("sample rate must be positive");
    }
    let total = rate as usize * seconds as usize;
    let samples: Vec<i16> = (0..total)
        .map(|i| {
            let t = i as f32 / rate as f32;
            ((2.0 * std::f32::consts::PI * freq * t).sin() * i16::MAX as f32 * 0.5) as i16
        })
        .collect();

    let wav = encode_wav_pcm16(rate, 1, &samples);
    tokio::fs::write(path, &wav)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote {} ({} Hz, {} s, {} bytes)", path.display(), freq, seconds, wav.len());
    Ok(())
}
