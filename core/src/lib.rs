//! Download accelerator core library.
//!
//! This library provides the core engine for a desktop download accelerator: probing
//! a URL, splitting it into byte-range segments, fetching them concurrently into a
//! pre-allocated file, persisting durable state, and coordinating queueing,
//! scheduling, and progress reporting around that engine.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`storage`] - Durable SQLite-backed state for downloads, segments, and schedules
//! - [`engine`] - Probing, segment planning, concurrent fetching, and the download command surface
//! - [`queue_manager`] - Priority admission control on top of the engine's concurrency cap
//! - [`scheduler`] - Durable schedule loading, fire-delay computation, and auto-shutdown
//! - [`progress_pump`] - Activity-gated adaptive-cadence progress broadcast
//! - [`ingress_bridge`] - Local IPC endpoint for externally-submitted download requests
//! - [`segment_fetcher`] - A single byte-range fetch with retry and rate-limit pacing
//! - [`file_arena`] - Pre-allocated, offset-addressed file writes
//! - [`probe`] - `HEAD`-based URL metadata discovery
//! - [`retry`] - Error classification and backoff policy
//! - [`token_bucket`] - Per-download byte-rate pacing
//! - [`filename`] - Filename sanitization and collision-safe path resolution
//! - [`user_agent`] - Browser-like `User-Agent` string
//! - [`error`] - The unified `DownloadError` type

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod engine;
pub mod error;
pub mod file_arena;
pub mod filename;
pub mod ingress_bridge;
pub mod probe;
pub mod progress_pump;
pub mod queue_manager;
pub mod retry;
pub mod scheduler;
pub mod segment_fetcher;
pub mod storage;
#[cfg(test)]
pub mod test_support;
pub mod token_bucket;
pub(crate) mod user_agent;

pub use engine::{AddRequest, DownloadEngine, EngineEvent, SpeedTracker, plan_segments};
pub use error::{DownloadError, ErrorTag};
pub use file_arena::FileArena;
pub use filename::{
    extension_from_content_type, fallback_filename_from_url, parse_content_disposition, resolve_unique_path,
    sanitize_filename,
};
pub use ingress_bridge::IngressBridge;
pub use probe::{Probe, ProbeResult};
pub use progress_pump::{ProgressPump, ProgressSnapshot};
pub use queue_manager::{QueueManager, QueueStats};
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error, classify_http_status, parse_retry_after};
pub use scheduler::Scheduler;
pub use segment_fetcher::{SegmentEvent, SegmentFetcher};
pub use storage::{
    ChecksumType, Download, DownloadPatch, Priority, Repeat, Schedule, Segment, SegmentStatus, Status, Storage,
    StorageError, StorageErrorKind,
};
pub use token_bucket::TokenBucket;
