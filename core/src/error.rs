//! Error taxonomy for the download engine core.
//!
//! Each component defines the error it can fail with; [`DownloadError`] is the
//! taxonomy tag consumers actually branch on (retryable vs. fatal vs. user intent).
//! Constructors carry context (url/path/id) rather than blanket `From` conversions
//! from third-party error types, so a bare `sqlx::Error` or `reqwest::Error` never
//! crosses a component boundary without saying what it was trying to do.

use std::path::PathBuf;

use thiserror::Error;

/// Stable error tag per SPEC_FULL.md §7. Retry policy and UI surfaces branch on this,
/// not on the `Display` text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    NetworkTransient,
    StallTimeout,
    HttpClientStatus,
    HttpServerStatus,
    HttpRangeNotSupported,
    DiskFull,
    Permission,
    FsIo,
    SizeMismatch,
    ChecksumMismatch,
    Cancelled,
    NotFound,
    Internal,
}

impl ErrorTag {
    /// Whether the retry policy should attempt another pass for this tag alone,
    /// independent of HTTP status-code classification (see [`crate::retry`]).
    #[must_use]
    pub fn is_retryable_by_default(self) -> bool {
        matches!(
            self,
            Self::NetworkTransient | Self::StallTimeout | Self::HttpServerStatus
        )
    }
}

/// Top-level error for download operations, carrying a stable [`ErrorTag`] plus context.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("stall timeout: no data received on {url} for {idle_secs}s")]
    StallTimeout { url: String, idle_secs: u64 },

    #[error("{url} returned client error {status}")]
    HttpClientStatus {
        url: String,
        status: u16,
        retry_after: Option<String>,
    },

    #[error("{url} returned server error {status}")]
    HttpServerStatus {
        url: String,
        status: u16,
        retry_after: Option<String>,
    },

    #[error("server at {url} does not support byte ranges but multiple segments were planned")]
    HttpRangeNotSupported { url: String },

    #[error("not enough free space to write {path} ({needed} bytes needed)")]
    DiskFull { path: PathBuf, needed: u64 },

    #[error("permission denied accessing {path}")]
    Permission {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("filesystem error on {path}: {source}")]
    FsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("size mismatch for {path}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("cancelled by user")]
    Cancelled,

    #[error("download {id} not found")]
    NotFound { id: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl DownloadError {
    #[must_use]
    pub fn tag(&self) -> ErrorTag {
        match self {
            Self::Network { .. } => ErrorTag::NetworkTransient,
            Self::StallTimeout { .. } => ErrorTag::StallTimeout,
            Self::HttpClientStatus { .. } => ErrorTag::HttpClientStatus,
            Self::HttpServerStatus { .. } => ErrorTag::HttpServerStatus,
            Self::HttpRangeNotSupported { .. } => ErrorTag::HttpRangeNotSupported,
            Self::DiskFull { .. } => ErrorTag::DiskFull,
            Self::Permission { .. } => ErrorTag::Permission,
            Self::FsIo { .. } => ErrorTag::FsIo,
            Self::SizeMismatch { .. } => ErrorTag::SizeMismatch,
            Self::ChecksumMismatch { .. } => ErrorTag::ChecksumMismatch,
            Self::Cancelled => ErrorTag::Cancelled,
            Self::NotFound { .. } => ErrorTag::NotFound,
            Self::Internal { .. } => ErrorTag::Internal,
        }
    }

    #[must_use]
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    #[must_use]
    pub fn fs_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return Self::Permission { path, source };
        }
        Self::FsIo { path, source }
    }

    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}
