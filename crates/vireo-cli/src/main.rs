//! Vireo CLI - Headless Media Player and Cache Tool
//!
//! Features:
//! - Source probing (container, streams, duration)
//! - Headless playback with live event output
//! - Disk cache inspection and maintenance
//! - Test tone generation

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

/// Vireo CLI - Media playback toolkit
#[derive(Parser)]
#[command(name = "vireo-cli")]
#[command(version)]
#[command(about = "Headless media player and cache tool", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disk cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a source and show its streams
    Probe {
        /// URL or path of the media
        uri: String,
    },

    /// Play a source headlessly, printing events
    Play {
        /// URL or path of the media
        uri: String,

        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Playout volume (0-400, 100 = unity)
        #[arg(long, default_value = "100")]
        volume: i32,

        /// Playback speed in percent (30-400)
        #[arg(long, default_value = "100")]
        speed: i32,

        /// Extra plays after the first (-1 = forever)
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        loop_count: i32,

        /// Alternate CDN line for the same media (repeatable)
        #[arg(long = "cdn-line")]
        cdn_lines: Vec<String>,

        /// External SRT or WebVTT subtitle
        #[arg(long)]
        subtitle: Option<String>,
    },

    /// Inspect or maintain the disk cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Write a sine tone WAV file
    Tone {
        /// Output path
        path: PathBuf,

        /// Tone frequency in Hz
        #[arg(long, default_value = "440")]
        freq: f32,

        /// Length in seconds
        #[arg(short, long, default_value = "5")]
        seconds: u32,

        /// Sample rate in Hz
        #[arg(short, long, default_value = "44100")]
        rate: u32,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// List cached entries, least recently used first
    List,

    /// Remove the entry for one uri
    Remove {
        uri: String,
    },

    /// Remove the least recently used entry
    RemoveOld,

    /// Remove every entry
    Clear,

    /// Show or change the cache limits
    Limits {
        /// Maximum number of cached files
        #[arg(long)]
        count: Option<usize>,

        /// Maximum total size in bytes
        #[arg(long)]
        size: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; stdout is reserved for command output
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .init();
    vireo_core::init();

    let settings = commands::Settings::load(cli.config.as_deref(), cli.cache_dir, &cli.format)?;

    match cli.command {
        Commands::Probe { uri } => {
            commands::probe(&settings, &uri).await?;
        }
        Commands::Play { uri, seconds, volume, speed, loop_count, cdn_lines, subtitle } => {
            let options = commands::PlayOptions {
                seconds,
                volume,
                speed,
                loop_count,
                cdn_lines,
                subtitle,
            };
            commands::play(&settings, &uri, options).await?;
        }
        Commands::Cache { action } => match action {
            CacheCommand::List => commands::cache_list(&settings).await?,
            CacheCommand::Remove { uri } => commands::cache_remove(&settings, &uri).await?,
            CacheCommand::RemoveOld => commands::cache_remove_old(&settings).await?,
            CacheCommand::Clear => commands::cache_clear(&settings).await?,
            CacheCommand::Limits { count, size } => {
                commands::cache_limits(&settings, count, size).await?
            }
        },
        Commands::Tone { path, freq, seconds, rate } => {
            commands::tone(&path, freq, seconds, rate).await?;
        }
    }

    Ok(())
}
