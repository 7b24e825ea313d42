//! Error types for Vireo Core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error types
#[derive(Error, Debug)]
pub enum Error {
    // Source errors
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Source unreachable: {0}")]
    SourceUnreachable(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Subtitle parse error: {0}")]
    SubtitleParse(String),

    #[error("Transport failure on {endpoint}: {reason}")]
    TransportFailure { endpoint: String, reason: String },

    // Player errors
    #[error("A source is already open (state: {state})")]
    AlreadyOpen { state: String },

    #[error("Source was not preloaded: {0}")]
    NotPreloaded(String),

    #[error("Index {index} out of range (count: {count})")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("Position out of range: duration unknown")]
    OutOfRange,

    #[error("Operation {operation} not allowed in state {state}")]
    InvalidState {
        state: String,
        operation: &'static str,
    },

    #[error("Stream layout of the new source does not match the current one")]
    IncompatibleLayout,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Cache errors
    #[error("Cache directory unwritable: {path}")]
    CacheDirUnwritable { path: String, source: std::io::Error },

    #[error("Cache full: entry of {size} bytes does not fit and auto-remove is disabled")]
    CacheFull { size: u64 },

    #[error("Cache directory not configured")]
    CacheNotConfigured,

    // Network errors
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Serializable error discriminant carried by failure notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidUri,
    SourceUnreachable,
    UnsupportedFormat,
    TransportFailure,
    AlreadyOpen,
    NotPreloaded,
    IndexOutOfRange,
    OutOfRange,
    InvalidState,
    IncompatibleLayout,
    InvalidArgument,
    CacheDirUnwritable,
    CacheFull,
    Cancelled,
    Internal,
}

impl Error {
    /// Create a transport failure for an endpoint
    pub fn transport(endpoint: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::TransportFailure {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if this error should trigger CDN line failover
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::TransportFailure { .. } | Error::SourceUnreachable(_) | Error::Network(_)
        )
    }

    /// Taxonomy kind reported through the event channel
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidUri(_) => ErrorKind::InvalidUri,
            Error::SourceUnreachable(_) => ErrorKind::SourceUnreachable,
            Error::UnsupportedFormat(_) | Error::SubtitleParse(_) => ErrorKind::UnsupportedFormat,
            Error::TransportFailure { .. } | Error::Network(_) => ErrorKind::TransportFailure,
            Error::AlreadyOpen { .. } => ErrorKind::AlreadyOpen,
            Error::NotPreloaded(_) => ErrorKind::NotPreloaded,
            Error::IndexOutOfRange { .. } => ErrorKind::IndexOutOfRange,
            Error::OutOfRange => ErrorKind::OutOfRange,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::IncompatibleLayout => ErrorKind::IncompatibleLayout,
            Error::InvalidArgument(_) | Error::InvalidConfig(_) => ErrorKind::InvalidArgument,
            Error::CacheDirUnwritable { .. } | Error::CacheNotConfigured => {
                ErrorKind::CacheDirUnwritable
            }
            Error::CacheFull { .. } => ErrorKind::CacheFull,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal(_) | Error::Io(_) | Error::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Returns the error code for logs and CLI output
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::InvalidUri(_) => "INVALID_URI",
            Error::SourceUnreachable(_) => "SOURCE_UNREACHABLE",
            Error::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            Error::SubtitleParse(_) => "SUBTITLE_PARSE",
            Error::TransportFailure { .. } => "TRANSPORT_FAILURE",
            Error::AlreadyOpen { .. } => "ALREADY_OPEN",
            Error::NotPreloaded(_) => "NOT_PRELOADED",
            Error::IndexOutOfRange { .. } => "INDEX_OUT_OF_RANGE",
            Error::OutOfRange => "OUT_OF_RANGE",
            Error::InvalidState { .. } => "INVALID_STATE",
            Error::IncompatibleLayout => "INCOMPATIBLE_LAYOUT",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::CacheDirUnwritable { .. } => "CACHE_DIR_UNWRITABLE",
            Error::CacheFull { .. } => "CACHE_FULL",
            Error::CacheNotConfigured => "CACHE_NOT_CONFIGURED",
            Error::Network(_) => "NETWORK",
            Error::Cancelled => "CANCELLED",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Internal(_) => "INTERNAL",
            Error::Io(_) => "IO",
            Error::Serialization(_) => "SERIALIZATION",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidUri => "invalid_uri",
            ErrorKind::SourceUnreachable => "source_unreachable",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::TransportFailure => "transport_failure",
            ErrorKind::AlreadyOpen => "already_open",
            ErrorKind::NotPreloaded => "not_preloaded",
            ErrorKind::IndexOutOfRange => "index_out_of_range",
            ErrorKind::OutOfRange => "out_of_range",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::IncompatibleLayout => "incompatible_layout",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::CacheDirUnwritable => "cache_dir_unwritable",
            ErrorKind::CacheFull => "cache_full",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}
