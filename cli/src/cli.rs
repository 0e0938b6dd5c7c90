//! Command-line argument definitions. See SPEC_FULL.md §6 "CLI surface".

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "dlaccel", version, about = "Multi-threaded download accelerator")]
pub struct Cli {
    /// Increase logging verbosity; repeat for more (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all but error-level logging.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable ANSI color in output.
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Path to the SQLite database (default: `$XDG_DATA_HOME/dlaccel/dlaccel.db`).
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the long-lived composition root: queue, scheduler, progress pump, and
    /// ingress bridge all stay alive until interrupted.
    Serve(ServeArgs),

    /// Submit a new download.
    Add(AddArgs),

    /// Pause an in-progress download. Only has effect against the `serve` process
    /// currently running that download; a no-op otherwise (see DESIGN.md).
    Pause { id: String },

    /// Resume a paused or errored download.
    Resume { id: String },

    /// Cancel a download.
    Cancel { id: String },

    /// Retry a failed download from scratch.
    Retry { id: String },

    /// Remove a download's record and partial file.
    Remove { id: String },

    /// List downloads, optionally filtered by status.
    List(ListArgs),

    /// Manage scheduled downloads.
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Unix domain socket path for the ingress bridge (default:
    /// `$XDG_RUNTIME_DIR/dlaccel/dlaccel.sock`).
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Directory new downloads are saved to by default.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Maximum number of downloads admitted to run concurrently.
    #[arg(long)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Args)]
pub struct AddArgs {
    pub url: String,

    /// Directory to save into (default: config file's `output_dir`, or the current directory).
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Override the filename derived from the URL / `Content-Disposition`.
    #[arg(long)]
    pub filename: Option<String>,

    /// `Referer` header to send with every request for this download.
    #[arg(long)]
    pub referrer: Option<String>,

    #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
    pub priority: PriorityArg,

    /// Number of concurrent segments, 1..=32.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=32))]
    pub threads: Option<u32>,

    /// Expected checksum to verify after completion.
    #[arg(long, requires = "checksum_type")]
    pub checksum: Option<String>,

    #[arg(long, value_enum)]
    pub checksum_type: Option<ChecksumTypeArg>,

    /// Aggregate byte-rate cap across this download's segments, 0 = unlimited.
    #[arg(long, default_value_t = 0)]
    pub speed_limit_bps: u64,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long, value_enum)]
    pub status: Option<StatusArg>,
}

#[derive(Debug, Subcommand)]
pub enum ScheduleCommand {
    /// Schedule an existing download to start at a given Unix timestamp.
    Add {
        download_id: String,
        scheduled_time: i64,
        #[arg(long, value_enum, default_value_t = RepeatArg::None)]
        repeat: RepeatArg,
        /// Shut the machine down once this download completes.
        #[arg(long)]
        auto_shutdown: bool,
    },
    Remove {
        schedule_id: i64,
    },
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PriorityArg {
    Low,
    Normal,
    High,
}

impl PriorityArg {
    #[must_use]
    pub fn to_core(self) -> dlaccel_core::Priority {
        match self {
            Self::Low => dlaccel_core::Priority::Low,
            Self::Normal => dlaccel_core::Priority::Normal,
            Self::High => dlaccel_core::Priority::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ChecksumTypeArg {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl ChecksumTypeArg {
    #[must_use]
    pub fn to_core(self) -> dlaccel_core::ChecksumType {
        match self {
            Self::Md5 => dlaccel_core::ChecksumType::Md5,
            Self::Sha1 => dlaccel_core::ChecksumType::Sha1,
            Self::Sha256 => dlaccel_core::ChecksumType::Sha256,
            Self::Sha512 => dlaccel_core::ChecksumType::Sha512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Pending,
    Queued,
    Downloading,
    Paused,
    Verifying,
    Completed,
    Error,
    Cancelled,
}

impl StatusArg {
    #[must_use]
    pub fn to_core(self) -> dlaccel_core::Status {
        match self {
            Self::Pending => dlaccel_core::Status::Pending,
            Self::Queued => dlaccel_core::Status::Queued,
            Self::Downloading => dlaccel_core::Status::Downloading,
            Self::Paused => dlaccel_core::Status::Paused,
            Self::Verifying => dlaccel_core::Status::Verifying,
            Self::Completed => dlaccel_core::Status::Completed,
            Self::Error => dlaccel_core::Status::Error,
            Self::Cancelled => dlaccel_core::Status::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RepeatArg {
    None,
    Daily,
    Weekly,
}

impl RepeatArg {
    #[must_use]
    pub fn to_core(self) -> dlaccel_core::Repeat {
        match self {
            Self::None => dlaccel_core::Repeat::None,
            Self::Daily => dlaccel_core::Repeat::Daily,
            Self::Weekly => dlaccel_core::Repeat::Weekly,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_verifies_clap_invariants() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_add_with_defaults() {
        let cli = Cli::parse_from(["dlaccel", "add", "https://example.com/file.bin"]);
        match cli.command {
            Command::Add(args) => {
                assert_eq!(args.url, "https://example.com/file.bin");
                assert_eq!(args.priority, PriorityArg::Normal);
                assert_eq!(args.speed_limit_bps, 0);
            }
            other => panic!("expected Add, got {other:?}"),
        }
    }

    #[test]
    fn test_parses_add_with_flags() {
        let cli = Cli::parse_from([
            "dlaccel",
            "add",
            "https://example.com/file.bin",
            "--threads",
            "8",
            "--priority",
            "high",
            "--checksum",
            "deadbeef",
            "--checksum-type",
            "sha256",
        ]);
        match cli.command {
            Command::Add(args) => {
                assert_eq!(args.threads, Some(8));
                assert_eq!(args.priority, PriorityArg::High);
                assert_eq!(args.checksum.as_deref(), Some("deadbeef"));
                assert_eq!(args.checksum_type, Some(ChecksumTypeArg::Sha256));
            }
            other => panic!("expected Add, got {other:?}"),
        }
    }

    #[test]
    fn test_checksum_requires_checksum_type() {
        let result = Cli::try_parse_from(["dlaccel", "add", "https://example.com/f", "--checksum", "abc"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_threads_out_of_range_is_rejected() {
        let result = Cli::try_parse_from(["dlaccel", "add", "https://example.com/f", "--threads", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parses_pause_id() {
        let cli = Cli::parse_from(["dlaccel", "pause", "dl_abc123"]);
        match cli.command {
            Command::Pause { id } => assert_eq!(id, "dl_abc123"),
            other => panic!("expected Pause, got {other:?}"),
        }
    }

    #[test]
    fn test_parses_schedule_add() {
        let cli = Cli::parse_from(["dlaccel", "schedule", "add", "dl_abc123", "1700000000", "--repeat", "daily"]);
        match cli.command {
            Command::Schedule { command: ScheduleCommand::Add { download_id, scheduled_time, repeat, auto_shutdown } } => {
                assert_eq!(download_id, "dl_abc123");
                assert_eq!(scheduled_time, 1_700_000_000);
                assert_eq!(repeat, RepeatArg::Daily);
                assert!(!auto_shutdown);
            }
            other => panic!("expected Schedule::Add, got {other:?}"),
        }
    }

    #[test]
    fn test_global_verbosity_flags_work_after_subcommand() {
        let cli = Cli::parse_from(["dlaccel", "-vv", "list"]);
        assert_eq!(cli.verbose, 2);
    }
}
