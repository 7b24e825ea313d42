//! Output formatting for CLI

use console::style;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};
use vireo_core::{CacheEntry, PlayerEvent, PlayerEventRecord, StreamInfo};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

/// Print `data` as pretty JSON
pub fn print_json<T: Serialize>(data: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(data)?);
    Ok(())
}

#[derive(Tabled)]
struct StreamRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Codec")]
    codec: String,
    #[tabled(rename = "Language")]
    language: String,
    #[tabled(rename = "Duration")]
    duration: String,
}

pub fn stream_table(streams: &[StreamInfo]) -> String {
    let rows = streams.iter().map(|s| StreamRow {
        index: s.index,
        kind: s.kind.to_string(),
        codec: s.codec_name.clone(),
        language: s.language.clone().unwrap_or_else(|| "-".into()),
        duration: format_duration(s.duration_ms),
    });
    Table::new(rows).with(Style::rounded()).to_string()
}

#[derive(Tabled)]
struct CacheRow {
    #[tabled(rename = "Uri")]
    uri: String,
    #[tabled(rename = "Size")]
    size: u64,
    #[tabled(rename = "Last access")]
    last_access: String,
}

pub fn cache_table(entries: &[CacheEntry]) -> String {
    let rows = entries.iter().map(|e| CacheRow {
        uri: e.uri.clone(),
        size: e.byte_size,
        last_access: e.last_access_time.format("%Y-%m-%d %H:%M:%S").to_string(),
    });
    Table::new(rows).with(Style::rounded()).to_string()
}

pub fn format_duration(duration_ms: Option<i64>) -> String {
    match duration_ms {
        Some(ms) => format!("{}:{:02}.{:03}", ms / 60_000, (ms / 1000) % 60, ms % 1000),
        None => "live".to_string(),
    }
}

/// One human readable line per event
pub fn format_event(record: &PlayerEventRecord) -> String {
    let text = match &record.event {
        PlayerEvent::StateChanged { from, to } => format!("state {} -> {}", from, to),
        PlayerEvent::OpenCompleted { uri, duration_ms, stream_count } => format!(
            "opened {} ({}, {} streams)",
            uri,
            format_duration(*duration_ms),
            stream_count
        ),
        PlayerEvent::SourceSwitched { uri, position_ms } => {
            format!("switched to {} at {} ms", uri, position_ms)
        }
        PlayerEvent::CdnLineSwitched { from, to, reason } => {
            format!("cdn line {} -> {} ({:?})", from, to, reason)
        }
        PlayerEvent::SubtitleCue { cue: Some(cue), .. } => format!("cue: {}", cue.text),
        PlayerEvent::PositionChanged { position_ms } => format!("position {} ms", position_ms),
        PlayerEvent::LoopCompleted { loops_done } => format!("loop {} completed", loops_done),
        PlayerEvent::PlaybackCompleted => "playback completed".to_string(),
        other => format!("{:?}", other),
    };

    if record.event.is_failure() {
        style(text).red().to_string()
    } else {
        text
    }
}
