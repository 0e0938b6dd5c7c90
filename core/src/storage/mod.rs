//! Durable persistence of downloads, segments and schedules.
//!
//! See SPEC_FULL.md §4.1. Backed by `SQLite` in WAL mode via `sqlx`, grounded on the
//! teacher's `db.rs` connection-pool setup and `queue/mod.rs`'s atomic-update idioms
//! (see DESIGN.md).

mod error;
mod models;
mod repository;

pub use error::{StorageError, StorageErrorKind};
pub use models::{
    ChecksumType, Download, DownloadPatch, Priority, Repeat, Schedule, Segment, SegmentStatus,
    Status,
};
pub use repository::{Result, Storage};
