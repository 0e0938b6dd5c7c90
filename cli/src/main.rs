//! Command-line front end for the download accelerator engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dlaccel_core::{
    AddRequest, Download, DownloadEngine, IngressBridge, ProgressPump, QueueManager, RetryPolicy, Scheduler, Status,
    Storage,
};
use reqwest::Client;
use tracing::{debug, info};

mod app_config;
mod cli;
mod terminal;

use cli::{Cli, Command, ScheduleCommand};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let no_color = terminal::should_disable_color(cli.no_color, terminal::no_color_env_requested(), terminal::is_dumb_terminal());
    terminal::init_tracing(terminal::level_for(cli.verbose, cli.quiet), no_color);

    let file_config = app_config::load_default_file_config().context("loading config file")?;
    let db_path = cli.db_path.clone().or(file_config.db_path.clone()).unwrap_or_else(default_db_path);

    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| format!("creating {}", parent.display()))?;
    }
    let storage = Storage::open(&db_path).await.with_context(|| format!("opening database at {}", db_path.display()))?;

    let exit = run_command(cli, storage, &file_config).await?;
    std::process::exit(exit);
}

async fn run_command(cli: Cli, storage: Storage, file_config: &app_config::FileConfig) -> Result<i32> {
    let client = Client::new();
    let engine = Arc::new(DownloadEngine::new(storage, client, RetryPolicy::default()));

    match cli.command {
        Command::Serve(args) => run_serve(engine, args, file_config).await,
        Command::Add(args) => run_add(&engine, args, file_config).await,
        Command::Pause { id } => {
            engine.pause(&id).await.with_context(|| format!("pausing {id}"))?;
            println!("paused {id} (no effect if not running in a `dlaccel serve` process)");
            Ok(0)
        }
        Command::Resume { id } => {
            engine.resume(&id).await.with_context(|| format!("resuming {id}"))?;
            let queue = fresh_queue(&engine, file_config);
            let priority = engine.get(&id).await?.map_or(dlaccel_core::Priority::Normal, |d| d.priority());
            queue.enqueue(&id, priority).await?;
            println!("resumed {id}");
            Ok(0)
        }
        Command::Cancel { id } => {
            engine.cancel(&id).await.with_context(|| format!("cancelling {id}"))?;
            println!("cancelled {id}");
            Ok(0)
        }
        Command::Retry { id } => {
            engine.retry(&id).await.with_context(|| format!("retrying {id}"))?;
            let queue = fresh_queue(&engine, file_config);
            let priority = engine.get(&id).await?.map_or(dlaccel_core::Priority::Normal, |d| d.priority());
            queue.enqueue(&id, priority).await?;
            println!("retrying {id}");
            Ok(0)
        }
        Command::Remove { id } => {
            engine.remove(&id).await.with_context(|| format!("removing {id}"))?;
            println!("removed {id}");
            Ok(0)
        }
        Command::List(args) => run_list(&engine, args).await,
        Command::Schedule { command } => run_schedule(&engine, command, file_config).await,
    }
}

fn default_db_path() -> PathBuf {
    if let Some(xdg_data_home) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg_data_home).join("dlaccel").join("dlaccel.db");
    }
    let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
    PathBuf::from(home).join(".local").join("share").join("dlaccel").join("dlaccel.db")
}

fn default_socket_path() -> PathBuf {
    if let Some(xdg_runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg_runtime_dir).join("dlaccel").join("dlaccel.sock");
    }
    std::env::temp_dir().join("dlaccel").join("dlaccel.sock")
}

fn fresh_queue(engine: &Arc<DownloadEngine>, file_config: &app_config::FileConfig) -> Arc<QueueManager> {
    let concurrency = file_config.concurrency.unwrap_or(4);
    let auto_retry = file_config.auto_retry.unwrap_or(true);
    let max_retries = file_config.max_retries.unwrap_or(5);
    Arc::new(QueueManager::new(Arc::clone(engine), concurrency, auto_retry, max_retries))
}

/// The only mode in which `pause` has real, durable effect on a running download: the
/// queue, scheduler, and progress pump all live for the process lifetime here, unlike
/// the one-shot subcommands which reconstruct fresh state per invocation.
async fn run_serve(engine: Arc<DownloadEngine>, args: cli::ServeArgs, file_config: &app_config::FileConfig) -> Result<i32> {
    let reset = engine.reset_in_flight().await.context("resetting in-flight downloads")?;
    if reset > 0 {
        info!(count = reset, "reset in-flight downloads to queued after restart");
    }

    let concurrency = args.concurrency.or(file_config.concurrency).unwrap_or(4);
    let auto_retry = file_config.auto_retry.unwrap_or(true);
    let max_retries = file_config.max_retries.unwrap_or(5);
    let queue = Arc::new(QueueManager::new(Arc::clone(&engine), concurrency, auto_retry, max_retries));

    for download in engine.storage().list_by_status(Status::Queued).await.context("listing queued downloads")? {
        queue.enqueue(&download.id, download.priority()).await.ok();
    }

    let scheduler = Scheduler::new(engine.storage().clone(), Arc::clone(&queue));
    scheduler.load().await.context("loading schedules")?;

    let pump = ProgressPump::new(Arc::clone(&engine));

    let output_dir = args.output_dir.or_else(|| file_config.output_dir.clone()).unwrap_or_else(|| PathBuf::from("."));
    let socket_path = args.socket.or_else(|| file_config.socket_path.clone()).unwrap_or_else(default_socket_path);
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    let bridge = IngressBridge::bind(socket_path.clone(), Arc::clone(&engine), Arc::clone(&queue), output_dir)
        .await
        .with_context(|| format!("binding ingress socket {}", socket_path.display()))?;

    info!(socket = %socket_path.display(), concurrency, "serving");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested");

    bridge.shutdown().await;
    pump.shutdown().await;
    scheduler.shutdown().await;
    queue.shutdown().await;

    Ok(0)
}

async fn run_add(engine: &Arc<DownloadEngine>, args: cli::AddArgs, file_config: &app_config::FileConfig) -> Result<i32> {
    let output_dir = args.output_dir.or_else(|| file_config.output_dir.clone()).unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&output_dir).await.with_context(|| format!("creating {}", output_dir.display()))?;

    let request = AddRequest {
        url: args.url,
        referrer: args.referrer,
        filename: args.filename,
        output_dir,
        threads: args.threads.or(file_config.threads).unwrap_or(4),
        priority: args.priority.to_core(),
        checksum: args.checksum,
        checksum_type: args.checksum_type.map(cli::ChecksumTypeArg::to_core),
        speed_limit_bps: args.speed_limit_bps,
    };

    let id = engine.add(request).await.context("adding download")?;
    let queue = fresh_queue(engine, file_config);
    let priority = engine.get(&id).await?.map_or(dlaccel_core::Priority::Normal, |d| d.priority());
    queue.enqueue(&id, priority).await.context("enqueueing download")?;
    println!("{id}");
    debug!(id = %id, "queued (run `dlaccel serve` for it to actually transfer)");
    Ok(0)
}

async fn run_list(engine: &Arc<DownloadEngine>, args: cli::ListArgs) -> Result<i32> {
    let downloads = engine.list().await.context("listing downloads")?;
    let filtered: Vec<Download> = match args.status {
        Some(status) => downloads.into_iter().filter(|d| d.status() == status.to_core()).collect(),
        None => downloads,
    };

    if filtered.is_empty() {
        println!("no downloads");
        return Ok(0);
    }
    for download in &filtered {
        let percent = if download.total_size > 0 {
            (download.downloaded_bytes as f64 / download.total_size as f64) * 100.0
        } else {
            0.0
        };
        println!(
            "{}\t{}\t{:>6.1}%\t{}",
            download.id,
            download.status(),
            percent,
            download.filename
        );
    }
    Ok(0)
}

async fn run_schedule(engine: &Arc<DownloadEngine>, command: ScheduleCommand, file_config: &app_config::FileConfig) -> Result<i32> {
    let queue = fresh_queue(engine, file_config);
    let scheduler = Scheduler::new(engine.storage().clone(), queue);

    match command {
        ScheduleCommand::Add { download_id, scheduled_time, repeat, auto_shutdown } => {
            if engine.get(&download_id).await?.is_none() {
                bail!("no such download: {download_id}");
            }
            let id = scheduler.add(&download_id, scheduled_time, repeat.to_core(), auto_shutdown).await?;
            println!("{id}");
        }
        ScheduleCommand::Remove { schedule_id } => {
            scheduler.remove(schedule_id).await?;
            println!("removed schedule {schedule_id}");
        }
        ScheduleCommand::List => {
            let schedules = scheduler.list().await?;
            if schedules.is_empty() {
                println!("no schedules");
            }
            for schedule in schedules {
                println!(
                    "{}\t{}\t{}\t{}",
                    schedule.id,
                    schedule.download_id,
                    schedule.scheduled_time,
                    schedule.repeat_str
                );
            }
        }
    }
    scheduler.shutdown().await;
    Ok(0)
}
