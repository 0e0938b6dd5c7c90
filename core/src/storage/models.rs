//! Durable record types: [`Download`], [`Segment`], [`Schedule`].

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Download lifecycle status. `Cancelled` is distinct from `Error` (see DESIGN.md Open
/// Question 2: the teacher lineage folded user cancellation into `status='error'` with a
/// magic error string; consumers couldn't tell cancel from failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Queued,
    Downloading,
    Paused,
    Verifying,
    Completed,
    Error,
    Cancelled,
}

impl Status {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Status-reachability per SPEC_FULL.md §8 property 4, extended with `Cancelled` as a
    /// terminal sibling of `Error` rather than a reuse of it.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use Status::{Cancelled, Completed, Downloading, Error, Paused, Pending, Queued, Verifying};
        matches!(
            (self, next),
            (Pending, Queued)
                | (Queued, Downloading)
                | (Downloading, Paused)
                | (Downloading, Verifying)
                | (Downloading, Error)
                | (Downloading, Completed)
                | (Downloading, Cancelled)
                | (Verifying, Completed)
                | (Verifying, Error)
                | (Paused, Queued)
                | (Error, Queued)
                | (Pending, Cancelled)
                | (Queued, Cancelled)
                | (Paused, Cancelled)
                | (Error, Cancelled)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "verifying" => Ok(Self::Verifying),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid download status: {other}")),
        }
    }
}

/// Priority bucket; `as_i64` gives the ordering weight used in `ORDER BY priority DESC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    #[must_use]
    pub fn from_i64(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Self::Low,
            2..=i64::MAX => Self::High,
            _ => Self::Normal,
        }
    }
}

/// Supported whole-file checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl std::str::FromStr for ChecksumType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(format!("unsupported checksum type: {other}")),
        }
    }
}

/// A durable download row. Column names are `snake_case` per SPEC_FULL.md §6.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Download {
    pub id: String,
    pub url: String,
    pub referrer: Option<String>,
    pub mime: Option<String>,
    pub filename: String,
    pub save_path: String,
    pub total_size: i64,
    pub downloaded_bytes: i64,
    pub resumable: bool,
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub threads: i64,
    pub priority: i64,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub error: Option<String>,
}

impl Download {
    #[must_use]
    pub fn status(&self) -> Status {
        self.status_str.parse().unwrap_or(Status::Error)
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        Priority::from_i64(self.priority)
    }

    #[must_use]
    pub fn checksum_type(&self) -> Option<ChecksumType> {
        self.checksum_type.as_deref().and_then(|s| s.parse().ok())
    }
}

/// Fields accepted by a partial `updateDownload`. `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct DownloadPatch {
    pub url: Option<String>,
    pub filename: Option<String>,
    pub total_size: Option<i64>,
    pub downloaded_bytes: Option<i64>,
    pub resumable: Option<bool>,
    pub status: Option<Status>,
    pub threads: Option<i64>,
    pub priority: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<Option<String>>,
}

/// A durable segment row. `(download_id, idx)` is unique.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub download_id: String,
    pub idx: i64,
    pub start_byte: i64,
    pub end_byte: i64,
    pub downloaded_bytes: i64,
    #[sqlx(rename = "status")]
    pub status_str: String,
}

/// Segment-specific lifecycle, separate from [`Status`] (a download has many segments).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Error,
}

impl SegmentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for SegmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("invalid segment status: {other}")),
        }
    }
}

impl Segment {
    #[must_use]
    pub fn status(&self) -> SegmentStatus {
        self.status_str.parse().unwrap_or(SegmentStatus::Error)
    }

    #[must_use]
    pub fn len(&self) -> i64 {
        self.end_byte - self.start_byte + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }
}

/// Repeat interval for a [`Schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Repeat {
    None,
    Daily,
    Weekly,
}

impl Repeat {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }
}

impl std::str::FromStr for Repeat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => Err(format!("invalid repeat value: {other}")),
        }
    }
}

/// A durable schedule row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub download_id: String,
    pub scheduled_time: i64,
    #[sqlx(rename = "repeat")]
    pub repeat_str: String,
    pub auto_shutdown: bool,
    pub enabled: bool,
}

impl Schedule {
    #[must_use]
    pub fn repeat(&self) -> Repeat {
        self.repeat_str.parse().unwrap_or(Repeat::None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip_all_variants() {
        for s in [
            Status::Pending,
            Status::Queued,
            Status::Downloading,
            Status::Paused,
            Status::Verifying,
            Status::Completed,
            Status::Error,
            Status::Cancelled,
        ] {
            let parsed: Status = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn test_status_reachability_matches_property_4() {
        assert!(Status::Pending.can_transition_to(Status::Queued));
        assert!(Status::Queued.can_transition_to(Status::Downloading));
        assert!(Status::Downloading.can_transition_to(Status::Paused));
        assert!(Status::Paused.can_transition_to(Status::Queued));
        assert!(Status::Error.can_transition_to(Status::Queued));
        assert!(!Status::Completed.can_transition_to(Status::Downloading));
        assert!(!Status::Pending.can_transition_to(Status::Completed));
    }

    #[test]
    fn test_cancelled_is_distinct_from_error() {
        assert_ne!(Status::Cancelled, Status::Error);
        assert!(Status::Downloading.can_transition_to(Status::Cancelled));
        // Cancelled is terminal: no transition out of it is defined.
        assert!(!Status::Cancelled.can_transition_to(Status::Queued));
    }

    #[test]
    fn test_any_non_terminal_status_can_be_cancelled() {
        assert!(Status::Pending.can_transition_to(Status::Cancelled));
        assert!(Status::Queued.can_transition_to(Status::Cancelled));
        assert!(Status::Paused.can_transition_to(Status::Cancelled));
        assert!(Status::Error.can_transition_to(Status::Cancelled));
        // Completed and Verifying are excluded: a finished or in-flight integrity
        // check is not cancellable, matching `cancel_inline`'s guard.
        assert!(!Status::Completed.can_transition_to(Status::Cancelled));
        assert!(!Status::Verifying.can_transition_to(Status::Cancelled));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::from_i64(2), Priority::High);
        assert_eq!(Priority::from_i64(0), Priority::Low);
        assert_eq!(Priority::from_i64(1), Priority::Normal);
    }

    #[test]
    fn test_segment_len() {
        let seg = Segment {
            id: 1,
            download_id: "abc".into(),
            idx: 0,
            start_byte: 0,
            end_byte: 2_499_999,
            downloaded_bytes: 0,
            status_str: "pending".into(),
        };
        assert_eq!(seg.len(), 2_500_000);
    }

    #[test]
    fn test_checksum_type_parse_invalid() {
        let result: Result<ChecksumType, _> = "crc32".parse();
        assert!(result.is_err());
    }
}
