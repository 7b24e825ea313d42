//! Vireo Core - Media playback and cache engine
//!
//! This crate provides the core functionality for media playback:
//! - Source resolution for URLs, files, CDN line sets and custom streams
//! - A per-player state machine driven by a background worker
//! - CDN line failover and token renewal
//! - An LRU disk cache shared between players
//! - Frame, spectrum and event dispatch to registered observers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Vireo Core                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │  Transport   │  │   CDN Line   │  │  Disk Cache  │           │
//! │  │ (http/file)  │  │   Manager    │  │   Manager    │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │   Source    │                              │
//! │                    │  Resolver   │                              │
//! │                    └──────┬──────┘                              │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐            │
//! │  │ MediaPlayer  │──│   Player    │──│  Dispatcher  │            │
//! │  │   (handle)   │  │   Worker    │  │ (obs/events) │            │
//! │  └──────────────┘  └─────────────┘  └──────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod types;
pub mod config;
pub mod transport;
pub mod media;
pub mod cdn;
pub mod cache;
pub mod source;
pub mod spectrum;
pub mod subtitle;
pub mod screenshot;
pub mod events;
pub mod dispatch;
pub mod player;
mod session;

pub use error::{Error, ErrorKind, Result};
pub use types::*;
pub use config::{CacheConfig, EngineConfig, PlayerConfig};
pub use transport::{DefaultTransport, FileTransport, HttpTransport, MemoryTransport, Transport};
pub use media::MediaLayout;
pub use cdn::{CdnLine, CdnLineManager, CdnSource, LineSwitchReason};
pub use cache::{CacheEntry, CacheManager, RemovalReport};
pub use source::{CustomSource, LineFailover, ResolvedSource, SourceResolver};
pub use events::{PlayerEvent, PlayerEventRecord};
pub use dispatch::{AudioFrameObserver, AudioSpectrumObserver, RenderSurface, VideoFrameObserver};
pub use player::MediaPlayer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library with default configuration
pub fn init() {
    tracing::info!(version = VERSION, "Vireo Core initialized");
}
