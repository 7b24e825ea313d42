//! Integration tests for Vireo Core

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use vireo_core::{
    media::encode_wav_pcm16, AudioFrame, AudioFrameObserver, CacheConfig, CacheManager, CdnSource,
    CustomSource, Error, ErrorKind, LineSwitchReason, MediaPlayer, MediaSource, MemoryTransport,
    PlayerConfig, PlayerEvent, PlayerEventRecord, PlayerState, StreamKind, VideoFrame,
    VideoFrameObserver,
};

const TONE_URI: &str = "http://media.test/tone.wav";
const OTHER_URI: &str = "http://media.test/other.wav";

// =============================================================================
// Helpers
// =============================================================================

/// One second of 8 kHz mono PCM: 50 units of 20 ms
fn tone_wav() -> Vec<u8> {
    let samples: Vec<i16> = (0..8000)
        .map(|i| ((i as f32 * 0.785).sin() * 8000.0) as i16)
        .collect();
    encode_wav_pcm16(8000, 1, &samples)
}

/// `seconds` of 8 kHz mono PCM, long enough to outrun the bytes read while opening
fn long_tone_wav(seconds: usize) -> Vec<u8> {
    let samples: Vec<i16> = (0..8000 * seconds)
        .map(|i| ((i as f32 * 0.785).sin() * 8000.0) as i16)
        .collect();
    encode_wav_pcm16(8000, 1, &samples)
}

/// WAV header that declares no length, served without a content length
fn live_wav() -> Vec<u8> {
    let mut wav = tone_wav();
    wav[40..44].copy_from_slice(&u32::MAX.to_le_bytes());
    wav
}

fn y4m(width: u32, height: u32, frames: usize) -> Vec<u8> {
    let mut out = format!("YUV4MPEG2 W{} H{} F10:1 Ip A1:1 C420jpeg\n", width, height).into_bytes();
    let plane = (width * height) as usize;
    let chroma = (width.div_ceil(2) * height.div_ceil(2)) as usize;
    for i in 0..frames {
        out.extend_from_slice(b"FRAME\n");
        out.extend(std::iter::repeat(i as u8 * 10).take(plane));
        out.extend(std::iter::repeat(128u8).take(2 * chroma));
    }
    out
}

fn transport() -> Arc<MemoryTransport> {
    let transport = Arc::new(MemoryTransport::new());
    transport.insert(TONE_URI, tone_wav());
    transport.insert(OTHER_URI, tone_wav());
    transport
}

fn player(transport: &Arc<MemoryTransport>) -> MediaPlayer {
    player_with(transport, PlayerConfig::default(), None)
}

fn player_with(
    transport: &Arc<MemoryTransport>,
    config: PlayerConfig,
    cache: Option<Arc<CacheManager>>,
) -> MediaPlayer {
    MediaPlayer::new(config, transport.clone(), cache).unwrap()
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<PlayerEventRecord>, mut matches: F) -> PlayerEventRecord
where
    F: FnMut(&PlayerEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(record) if matches(&record.event) => return record,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn open_ready(player: &MediaPlayer, rx: &mut broadcast::Receiver<PlayerEventRecord>, uri: &str) {
    player.open_url(uri, 0).unwrap();
    wait_for(rx, |e| matches!(e, PlayerEvent::OpenCompleted { .. })).await;
    assert_eq!(player.state(), PlayerState::Ready);
}

#[derive(Default)]
struct FrameCounter(AtomicUsize);

impl AudioFrameObserver for FrameCounter {
    fn on_audio_frame(&self, _frame: &AudioFrame) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl VideoFrameObserver for FrameCounter {
    fn on_video_frame(&self, _frame: &VideoFrame) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_full_lifecycle() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();
    let frames = Arc::new(FrameCounter::default());
    player.set_audio_frame_observer(Some(frames.clone()));

    assert_eq!(player.state(), PlayerState::Idle);
    player.open_url(TONE_URI, 0).unwrap();
    assert_eq!(player.state(), PlayerState::Opening);

    let opened = wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenCompleted { .. })).await;
    assert_eq!(
        opened.event,
        PlayerEvent::OpenCompleted {
            uri: TONE_URI.to_string(),
            duration_ms: Some(1000),
            stream_count: 1,
        }
    );
    assert_eq!(player.duration(), Some(1000));
    assert_eq!(player.stream_by_index(0).unwrap().kind, StreamKind::Audio);
    assert_eq!(player.play_src().as_deref(), Some(TONE_URI));

    player.set_playback_speed(400);
    player.play().unwrap();
    assert_eq!(player.state(), PlayerState::Playing);

    wait_for(&mut rx, |e| *e == PlayerEvent::PlaybackCompleted).await;
    assert_eq!(player.state(), PlayerState::Stopped);
    assert_eq!(frames.0.load(Ordering::SeqCst), 50);

    // Stopped accepts a new open
    open_ready(&player, &mut rx, OTHER_URI).await;
}

#[tokio::test]
async fn test_pause_resume_stop() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();
    open_ready(&player, &mut rx, TONE_URI).await;

    assert!(matches!(player.pause(), Err(Error::InvalidState { .. })));
    assert!(matches!(player.resume(), Err(Error::InvalidState { .. })));

    player.play().unwrap();
    player.pause().unwrap();
    assert_eq!(player.state(), PlayerState::Paused);
    player.resume().unwrap();
    assert_eq!(player.state(), PlayerState::Playing);

    player.stop().unwrap();
    assert_eq!(player.state(), PlayerState::Stopped);
    assert_eq!(player.stream_count(), 0);
    // Stopping twice is harmless
    player.stop().unwrap();
}

#[tokio::test]
async fn test_open_rejected_while_open() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();
    open_ready(&player, &mut rx, TONE_URI).await;

    assert!(matches!(
        player.open_url(OTHER_URI, 0),
        Err(Error::AlreadyOpen { .. })
    ));
}

#[tokio::test]
async fn test_open_failure_reports_kind() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();

    player.open_url("ftp://media.test/tone.wav", 0).unwrap();
    let failed = wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenFailed { .. })).await;
    match failed.event {
        PlayerEvent::OpenFailed { kind, .. } => assert_eq!(kind, ErrorKind::InvalidUri),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(player.state(), PlayerState::Failed);

    player.open_url("http://media.test/missing.wav", 0).unwrap();
    let failed = wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenFailed { .. })).await;
    match failed.event {
        PlayerEvent::OpenFailed { kind, .. } => assert_eq!(kind, ErrorKind::SourceUnreachable),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_no_stale_completion_after_new_open() {
    let transport = transport();
    transport.insert("http://slow.test/tone.wav", tone_wav());
    let player = player(&transport);
    let mut rx = player.subscribe();

    transport.set_latency(Duration::from_millis(300));
    player.open_url("http://slow.test/tone.wav", 0).unwrap();
    player.stop().unwrap();
    transport.set_latency(Duration::ZERO);
    player.open_url(TONE_URI, 0).unwrap();
    let current_epoch = player.epoch();

    let opened = wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenCompleted { .. })).await;
    assert_eq!(opened.epoch, current_epoch);
    match opened.event {
        PlayerEvent::OpenCompleted { uri, .. } => assert_eq!(uri, TONE_URI),
        other => panic!("unexpected {:?}", other),
    }

    // Give the superseded resolution time to finish
    tokio::time::sleep(Duration::from_millis(500)).await;
    while let Ok(record) = rx.try_recv() {
        assert!(
            !matches!(
                record.event,
                PlayerEvent::OpenCompleted { .. } | PlayerEvent::OpenFailed { .. }
            ),
            "stale completion delivered: {:?}",
            record.event
        );
    }
    assert_eq!(player.state(), PlayerState::Ready);
}

#[tokio::test]
async fn test_far_start_position_clamps_to_end() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();

    player.open_url(TONE_URI, i64::MAX).unwrap();
    let opened = wait_for(&mut rx, |e| {
        matches!(e, PlayerEvent::OpenCompleted { .. } | PlayerEvent::OpenFailed { .. })
    })
    .await;
    assert!(matches!(opened.event, PlayerEvent::OpenCompleted { .. }), "{:?}", opened.event);
    assert_eq!(player.state(), PlayerState::Ready);
    assert_eq!(player.position(), 1000);
}

#[tokio::test]
async fn test_oversized_video_is_unsupported() {
    let transport = transport();
    let mut huge = b"YUV4MPEG2 W65536 H65536 F25:1 C420\n".to_vec();
    huge.extend_from_slice(b"FRAME\n");
    transport.insert("http://media.test/huge.y4m", huge);
    let player = player(&transport);
    let mut rx = player.subscribe();

    player.open_url("http://media.test/huge.y4m", 0).unwrap();
    let failed = wait_for(&mut rx, |e| {
        matches!(e, PlayerEvent::OpenCompleted { .. } | PlayerEvent::OpenFailed { .. })
    })
    .await;
    match failed.event {
        PlayerEvent::OpenFailed { kind, .. } => assert_eq!(kind, ErrorKind::UnsupportedFormat),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(player.state(), PlayerState::Failed);
}

/// Custom source whose length query panics
struct PanickingSource;

impl CustomSource for PanickingSource {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(0)
    }

    fn seek(&mut self, offset: u64) -> std::io::Result<u64> {
        Ok(offset)
    }

    fn total_len(&self) -> Option<u64> {
        panic!("length unavailable")
    }
}

#[tokio::test]
async fn test_panicking_resolution_fails_open() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();

    player.open_with_custom_source(Box::new(PanickingSource), 0).unwrap();
    let failed = wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenFailed { .. })).await;
    match failed.event {
        PlayerEvent::OpenFailed { kind, .. } => assert_eq!(kind, ErrorKind::Internal),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(player.state(), PlayerState::Failed);

    // The player is still usable afterwards
    open_ready(&player, &mut rx, TONE_URI).await;
}

#[tokio::test]
async fn test_custom_source() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();

    player
        .open_with_custom_source(Box::new(Cursor::new(tone_wav())), 500)
        .unwrap();
    let opened = wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenCompleted { .. })).await;
    match opened.event {
        PlayerEvent::OpenCompleted { uri, duration_ms, .. } => {
            assert_eq!(uri, "custom://stream");
            assert_eq!(duration_ms, Some(1000));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(player.position(), 500);
}

// =============================================================================
// Parameter Tests
// =============================================================================

#[tokio::test]
async fn test_volume_clamp() {
    let transport = transport();
    let player = player(&transport);

    player.adjust_playout_volume(-5);
    assert_eq!(player.playout_volume(), 0);
    player.adjust_playout_volume(999);
    assert_eq!(player.playout_volume(), 400);
    player.adjust_publish_signal_volume(-1);
    assert_eq!(player.publish_signal_volume(), 0);

    player.set_playback_speed(10);
    assert_eq!(player.playback_speed(), 30);
    player.set_audio_pitch(20);
    assert_eq!(player.audio_pitch(), 12);
    assert!(player.set_loop_count(-2).is_err());
}

#[tokio::test]
async fn test_player_option_rejected_while_playing() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();

    player.set_player_option("audio_frame_ms", 40).unwrap();
    assert!(player.set_player_option("audio_frame_ms", 0).is_err());
    open_ready(&player, &mut rx, TONE_URI).await;

    player.play().unwrap();
    assert!(matches!(
        player.set_player_option("custom", 1),
        Err(Error::InvalidState { .. })
    ));
    assert_eq!(player.player_option("audio_frame_ms"), Some(40));
}

#[tokio::test]
async fn test_loop_count() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();
    open_ready(&player, &mut rx, TONE_URI).await;

    player.set_loop_count(1).unwrap();
    player.set_playback_speed(400);
    player.play().unwrap();

    let looped = wait_for(&mut rx, |e| matches!(e, PlayerEvent::LoopCompleted { .. })).await;
    assert_eq!(looped.event, PlayerEvent::LoopCompleted { loops_done: 1 });
    wait_for(&mut rx, |e| *e == PlayerEvent::PlaybackCompleted).await;
    assert_eq!(player.state(), PlayerState::Stopped);
}

// =============================================================================
// Seek Tests
// =============================================================================

#[tokio::test]
async fn test_seek_clamps_to_duration() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();

    assert!(matches!(
        player.seek_to_position(100),
        Err(Error::InvalidState { .. })
    ));
    open_ready(&player, &mut rx, TONE_URI).await;

    player.seek_to_position(99_999).unwrap();
    let seeked = wait_for(&mut rx, |e| matches!(e, PlayerEvent::SeekCompleted { .. })).await;
    assert_eq!(seeked.event, PlayerEvent::SeekCompleted { position_ms: 1000 });

    player.seek_to_position(-50).unwrap();
    let seeked = wait_for(&mut rx, |e| matches!(e, PlayerEvent::SeekCompleted { .. })).await;
    assert_eq!(seeked.event, PlayerEvent::SeekCompleted { position_ms: 0 });
}

#[tokio::test]
async fn test_live_source_limits() {
    let transport = transport();
    transport.insert_unbounded("http://live.test/radio.wav", live_wav());
    let player = player(&transport);
    let mut rx = player.subscribe();
    open_ready(&player, &mut rx, "http://live.test/radio.wav").await;

    assert_eq!(player.duration(), None);
    assert!(matches!(player.seek_to_position(100), Err(Error::OutOfRange)));
    assert!(matches!(
        player.switch_src(TONE_URI, true),
        Err(Error::InvalidArgument(_))
    ));
    player.switch_src(TONE_URI, false).unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::SourceSwitched { .. })).await;
}

// =============================================================================
// Preload and Switch Tests
// =============================================================================

#[tokio::test]
async fn test_preload_and_unload() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();

    player.preload_src(TONE_URI, 0).unwrap();
    assert_eq!(player.state(), PlayerState::PreloadPending);
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::PreloadCompleted { .. })).await;
    assert_eq!(player.state(), PlayerState::Preloaded);
    assert!(player.is_preloaded(TONE_URI));

    player.unload_src(TONE_URI).unwrap();
    player.unload_src(TONE_URI).unwrap();
    player.unload_src("http://media.test/never.wav").unwrap();
    assert_eq!(player.state(), PlayerState::Idle);
    assert!(matches!(
        player.play_preloaded_src(TONE_URI),
        Err(Error::NotPreloaded(_))
    ));
}

#[tokio::test]
async fn test_play_preloaded_src() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();

    player.preload_src(OTHER_URI, 0).unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::PreloadCompleted { .. })).await;

    player.play_preloaded_src(OTHER_URI).unwrap();
    wait_for(&mut rx, |e| {
        *e == PlayerEvent::StateChanged {
            from: PlayerState::Ready,
            to: PlayerState::Playing,
        }
    })
    .await;
    assert_eq!(player.play_src().as_deref(), Some(OTHER_URI));
    assert!(!player.is_preloaded(OTHER_URI));
    player.stop().unwrap();
}

#[tokio::test]
async fn test_preload_failure_returns_to_idle() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();

    player.preload_src("http://media.test/missing.wav", 0).unwrap();
    let failed = wait_for(&mut rx, |e| matches!(e, PlayerEvent::PreloadFailed { .. })).await;
    assert!(failed.event.is_failure());
    assert_eq!(player.state(), PlayerState::Idle);
}

#[tokio::test]
async fn test_switch_keeps_position() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();
    open_ready(&player, &mut rx, TONE_URI).await;

    player.seek_to_position(500).unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::SeekCompleted { .. })).await;

    player.switch_src(OTHER_URI, true).unwrap();
    assert_eq!(player.state(), PlayerState::Opening);
    let switched = wait_for(&mut rx, |e| matches!(e, PlayerEvent::SourceSwitched { .. })).await;
    assert_eq!(
        switched.event,
        PlayerEvent::SourceSwitched {
            uri: OTHER_URI.to_string(),
            position_ms: 500,
        }
    );
    assert_eq!(player.state(), PlayerState::Ready);
}

#[tokio::test]
async fn test_switch_to_incompatible_layout_fails() {
    let transport = transport();
    transport.insert("http://media.test/clip.y4m", y4m(4, 4, 5));
    let player = player(&transport);
    let mut rx = player.subscribe();
    open_ready(&player, &mut rx, TONE_URI).await;

    player.switch_src("http://media.test/clip.y4m", true).unwrap();
    let failed = wait_for(&mut rx, |e| matches!(e, PlayerEvent::SwitchFailed { .. })).await;
    match failed.event {
        PlayerEvent::SwitchFailed { kind, .. } => assert_eq!(kind, ErrorKind::IncompatibleLayout),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(player.state(), PlayerState::Failed);
}

#[tokio::test]
async fn test_switch_mid_resolution_drops_stale() {
    let transport = transport();
    transport.insert("http://slow.test/tone.wav", tone_wav());
    let player = player(&transport);
    let mut rx = player.subscribe();
    open_ready(&player, &mut rx, TONE_URI).await;

    transport.set_latency(Duration::from_millis(300));
    player.switch_src("http://slow.test/tone.wav", false).unwrap();
    let stale_epoch = player.epoch();
    transport.set_latency(Duration::ZERO);
    player.switch_src(OTHER_URI, false).unwrap();
    let current_epoch = player.epoch();
    assert!(current_epoch > stale_epoch);

    let switched = wait_for(&mut rx, |e| matches!(e, PlayerEvent::SourceSwitched { .. })).await;
    assert_eq!(switched.epoch, current_epoch);
    assert_eq!(
        switched.event,
        PlayerEvent::SourceSwitched {
            uri: OTHER_URI.to_string(),
            position_ms: 0,
        }
    );

    // Give the superseded resolution time to finish
    tokio::time::sleep(Duration::from_millis(500)).await;
    while let Ok(record) = rx.try_recv() {
        assert!(
            !matches!(
                record.event,
                PlayerEvent::SourceSwitched { .. } | PlayerEvent::SwitchFailed { .. }
            ),
            "stale switch delivered: {:?}",
            record.event
        );
    }
    assert_eq!(player.state(), PlayerState::Ready);
    assert_eq!(player.play_src().as_deref(), Some(OTHER_URI));
}

#[tokio::test]
async fn test_switch_resumes_playback() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();
    open_ready(&player, &mut rx, TONE_URI).await;

    player.play().unwrap();
    player.switch_src(OTHER_URI, false).unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::SourceSwitched { .. })).await;
    assert_eq!(player.state(), PlayerState::Playing);
    player.stop().unwrap();
}

// =============================================================================
// CDN Tests
// =============================================================================

fn cdn_lines(transport: &MemoryTransport) -> CdnSource {
    let lines: Vec<String> = ["a", "b", "c"]
        .iter()
        .map(|host| format!("http://{}.cdn.test/tone.wav", host))
        .collect();
    for line in &lines {
        transport.insert(line, tone_wav());
    }
    CdnSource::from(lines)
}

#[tokio::test]
async fn test_cdn_auto_failover() {
    let transport = transport();
    let source = cdn_lines(&transport);
    transport.fail_host("a.cdn.test");
    let config = PlayerConfig {
        auto_switch_cdn: true,
        ..Default::default()
    };
    let player = player_with(&transport, config, None);
    let mut rx = player.subscribe();

    player.open_with_cdn_src(source, 0).unwrap();
    let switched = wait_for(&mut rx, |e| matches!(e, PlayerEvent::CdnLineSwitched { .. })).await;
    assert_eq!(
        switched.event,
        PlayerEvent::CdnLineSwitched {
            from: 0,
            to: 1,
            reason: LineSwitchReason::AutoFailover,
        }
    );
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenCompleted { .. })).await;
    assert_eq!(player.cdn_line_count(), 3);
    assert_eq!(player.current_cdn_index(), Some(1));
}

#[tokio::test]
async fn test_cdn_failover_wraps_after_all_lines_fail() {
    let transport = transport();
    let source = cdn_lines(&transport);
    for host in ["a.cdn.test", "b.cdn.test", "c.cdn.test"] {
        transport.fail_host(host);
    }
    let config = PlayerConfig {
        auto_switch_cdn: true,
        ..Default::default()
    };
    let player = player_with(&transport, config, None);
    let mut rx = player.subscribe();

    player.open_with_cdn_src(source, 0).unwrap();
    let mut switches = Vec::new();
    let failed = loop {
        let record = wait_for(&mut rx, |e| {
            matches!(e, PlayerEvent::CdnLineSwitched { .. } | PlayerEvent::OpenFailed { .. })
        })
        .await;
        match record.event {
            PlayerEvent::CdnLineSwitched { from, to, reason } => {
                assert_eq!(reason, LineSwitchReason::AutoFailover);
                switches.push((from, to));
            }
            other => break other,
        }
    };

    assert_eq!(switches, vec![(0, 1), (1, 2), (2, 0)]);
    match failed {
        PlayerEvent::OpenFailed { kind, .. } => assert_eq!(kind, ErrorKind::SourceUnreachable),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(player.state(), PlayerState::Failed);
    assert_eq!(player.current_cdn_index(), Some(0));
}

#[tokio::test]
async fn test_failover_during_playback() {
    let transport = transport();
    let lines: Vec<String> = ["a", "b"]
        .iter()
        .map(|host| format!("http://{}.cdn.test/long.wav", host))
        .collect();
    for line in &lines {
        transport.insert(line, long_tone_wav(10));
    }
    let config = PlayerConfig {
        auto_switch_cdn: true,
        ..Default::default()
    };
    let player = player_with(&transport, config, None);
    let mut rx = player.subscribe();

    player.open_with_cdn_src(CdnSource::from(lines), 0).unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenCompleted { .. })).await;
    assert_eq!(player.current_cdn_index(), Some(0));

    // Past the bytes fetched while opening, so the next unit goes to the network
    player.seek_to_position(5000).unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::SeekCompleted { .. })).await;
    transport.fail_host("a.cdn.test");
    player.play().unwrap();

    let switched = wait_for(&mut rx, |e| matches!(e, PlayerEvent::CdnLineSwitched { .. })).await;
    assert_eq!(
        switched.event,
        PlayerEvent::CdnLineSwitched {
            from: 0,
            to: 1,
            reason: LineSwitchReason::AutoFailover,
        }
    );
    let moved = wait_for(&mut rx, |e| matches!(e, PlayerEvent::PositionChanged { .. })).await;
    match moved.event {
        PlayerEvent::PositionChanged { position_ms } => assert!(position_ms >= 5000),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(player.state(), PlayerState::Playing);
    assert_eq!(player.current_cdn_index(), Some(1));
    player.stop().unwrap();
}

#[tokio::test]
async fn test_cdn_without_auto_switch_fails() {
    let transport = transport();
    let source = cdn_lines(&transport);
    transport.fail_host("a.cdn.test");
    let player = player(&transport);
    let mut rx = player.subscribe();

    player.open_with_cdn_src(source, 0).unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenFailed { .. })).await;
    assert_eq!(player.current_cdn_index(), Some(0));
}

#[tokio::test]
async fn test_cdn_manual_switch_and_token() {
    let transport = transport();
    let source = cdn_lines(&transport);
    let player = player(&transport);
    let mut rx = player.subscribe();

    player.open_with_cdn_src(source, 0).unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenCompleted { .. })).await;

    player.switch_cdn_line_by_index(2).unwrap();
    let switched = wait_for(&mut rx, |e| matches!(e, PlayerEvent::CdnLineSwitched { .. })).await;
    assert_eq!(
        switched.event,
        PlayerEvent::CdnLineSwitched {
            from: 0,
            to: 2,
            reason: LineSwitchReason::Manual,
        }
    );
    assert!(matches!(
        player.switch_cdn_line_by_index(3),
        Err(Error::IndexOutOfRange { index: 3, count: 3 })
    ));

    player.renew_cdn_src_token("fresh", 42).unwrap();
    let renewed = wait_for(&mut rx, |e| matches!(e, PlayerEvent::CdnTokenRenewed { .. })).await;
    assert_eq!(renewed.event, PlayerEvent::CdnTokenRenewed { line: 2, ts: 42 });
}

// =============================================================================
// Cache Tests
// =============================================================================

#[tokio::test]
async fn test_cache_lru_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        max_file_count: 2,
        ..Default::default()
    };
    let cache = CacheManager::open(dir.path(), config).await.unwrap();

    cache.store("http://media.test/a", b"aaaa").await.unwrap();
    cache.store("http://media.test/b", b"bbbb").await.unwrap();
    cache.store("http://media.test/c", b"cccc").await.unwrap();

    assert_eq!(cache.cache_file_count().await, 2);
    assert!(!cache.contains("http://media.test/a").await);
    assert!(cache.contains("http://media.test/b").await);
    assert!(cache.contains("http://media.test/c").await);
}

#[tokio::test]
async fn test_played_source_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(
        CacheManager::open(dir.path(), CacheConfig::default())
            .await
            .unwrap(),
    );
    let transport = transport();
    let player = player_with(&transport, PlayerConfig::default(), Some(cache.clone()));
    let mut rx = player.subscribe();

    let source = MediaSource::url(TONE_URI).with_cacheable(true);
    player.open_with_media_source(source.clone()).unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenCompleted { .. })).await;
    player.set_playback_speed(400);
    player.play().unwrap();
    wait_for(&mut rx, |e| *e == PlayerEvent::PlaybackCompleted).await;
    assert!(cache.contains(TONE_URI).await);

    let requests = transport.request_count();
    player.open_with_media_source(source).unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::OpenCompleted { .. })).await;
    assert_eq!(transport.request_count(), requests);
}

// =============================================================================
// Subtitle and Screenshot Tests
// =============================================================================

#[tokio::test]
async fn test_external_subtitle_cues() {
    let transport = transport();
    transport.insert(
        "http://media.test/tone.srt",
        "1\n00:00:00,100 --> 00:00:00,400\nHello\n\n2\n00:00:00,600 --> 00:00:00,900\nWorld\n",
    );
    let player = player(&transport);
    let mut rx = player.subscribe();
    open_ready(&player, &mut rx, TONE_URI).await;

    player.set_external_subtitle("http://media.test/tone.srt").unwrap();
    let loaded = wait_for(&mut rx, |e| matches!(e, PlayerEvent::SubtitleLoaded { .. })).await;
    assert_eq!(
        loaded.event,
        PlayerEvent::SubtitleLoaded {
            stream_index: 1,
            cue_count: 2,
        }
    );
    assert_eq!(player.stream_count(), 2);
    assert_eq!(player.stream_by_index(1).unwrap().codec_name, "srt");

    assert!(matches!(
        player.select_internal_subtitle(0),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        player.select_internal_subtitle(7),
        Err(Error::IndexOutOfRange { index: 7, count: 2 })
    ));
    player.select_audio_track(0).unwrap();
    player.select_internal_subtitle(1).unwrap();

    player.set_playback_speed(400);
    player.play().unwrap();
    let cue = wait_for(&mut rx, |e| {
        matches!(e, PlayerEvent::SubtitleCue { cue: Some(_), .. })
    })
    .await;
    match cue.event {
        PlayerEvent::SubtitleCue { stream_index, cue: Some(cue) } => {
            assert_eq!(stream_index, 1);
            assert_eq!(cue.text, "Hello");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_subtitle_failure_is_reported() {
    let transport = transport();
    let player = player(&transport);
    let mut rx = player.subscribe();
    open_ready(&player, &mut rx, TONE_URI).await;

    player.set_external_subtitle("http://media.test/none.vtt").unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::SubtitleFailed { .. })).await;
    assert_eq!(player.stream_count(), 1);
}

#[cfg(feature = "screenshot")]
#[tokio::test]
async fn test_screenshot_of_video() {
    let transport = transport();
    transport.insert("http://media.test/clip.y4m", y4m(4, 4, 10));
    let player = player(&transport);
    let mut rx = player.subscribe();
    let frames = Arc::new(FrameCounter::default());
    player.set_video_frame_observer(Some(frames.clone()));
    open_ready(&player, &mut rx, "http://media.test/clip.y4m").await;

    player.play().unwrap();
    timeout(Duration::from_secs(5), async {
        while frames.0.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    player.pause().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.png");
    player.take_screenshot(&path).unwrap();
    wait_for(&mut rx, |e| matches!(e, PlayerEvent::ScreenshotTaken { .. })).await;
    assert!(path.exists());
}
