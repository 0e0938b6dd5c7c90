//! Durable schedule loading, fire-delay computation, and the auto-shutdown watcher.
//! See SPEC_FULL.md §4.8.
//!
//! No direct teacher analogue exists — the teacher has no scheduling concept — so this
//! is enriched from the general timer/watcher idiom `downloader-core/src/download/engine.rs`
//! already uses for its interrupt-poll loop (`tokio::select!` racing a sleep against a
//! cancellation signal), applied here to per-schedule `tokio::time::sleep` tasks plus a
//! polling watcher for auto-shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::DownloadError;
use crate::queue_manager::QueueManager;
use crate::storage::{Repeat, Schedule, Status, Storage};

/// A schedule fired at most 5 minutes after its nominal time is still considered on
/// time; further out than that it's either skipped (non-recurring) or rolled forward to
/// its next recurrence (daily/weekly).
const LATE_GRACE_SECS: i64 = 5 * 60;
const DAY_SECS: i64 = 24 * 60 * 60;
const WEEK_SECS: i64 = 7 * DAY_SECS;

/// How long after a `completed` status is observed to wait before actually shutting
/// down, to give the user a window to notice and cancel.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);
const SHUTDOWN_POLL: Duration = Duration::from_secs(5);

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[derive(Debug, PartialEq, Eq)]
enum FireDecision {
    Skip,
    FireAt { delay_secs: i64, persist_time: Option<i64> },
}

/// Pure delay-computation rule from SPEC_FULL.md §4.8: "if in the past by <= 5 minutes,
/// delay = 0; else if too old and repeat = none, skip; else if repeat in {daily,
/// weekly}, advance `scheduledTime` by the interval until it is in the future."
fn compute_fire(scheduled_time: i64, repeat: Repeat, now: i64) -> FireDecision {
    if scheduled_time > now {
        return FireDecision::FireAt { delay_secs: scheduled_time - now, persist_time: None };
    }
    let overdue = now - scheduled_time;
    if overdue <= LATE_GRACE_SECS {
        return FireDecision::FireAt { delay_secs: 0, persist_time: None };
    }
    let interval = match repeat {
        Repeat::None => return FireDecision::Skip,
        Repeat::Daily => DAY_SECS,
        Repeat::Weekly => WEEK_SECS,
    };
    let mut next = scheduled_time;
    while next <= now {
        next += interval;
    }
    FireDecision::FireAt { delay_secs: next - now, persist_time: Some(next) }
}

struct Inner {
    storage: Storage,
    queue: Arc<QueueManager>,
    armed: DashMap<i64, JoinHandle<()>>,
    shutdown_task: AsyncMutex<Option<JoinHandle<()>>>,
    shutdown_pending: AtomicBool,
}

/// Owns every armed per-schedule timer task and the (at most one) armed shutdown
/// watcher. See SPEC_FULL.md §4.8.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    #[must_use]
    pub fn new(storage: Storage, queue: Arc<QueueManager>) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                queue,
                armed: DashMap::new(),
                shutdown_task: AsyncMutex::new(None),
                shutdown_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Loads every durable schedule and arms the enabled ones. Call once at process
    /// startup.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<(), DownloadError> {
        let schedules = self.inner.storage.list_schedules().await.map_err(|e| DownloadError::internal(e.to_string()))?;
        for schedule in schedules {
            if schedule.enabled {
                arm(Arc::clone(&self.inner), schedule);
            }
        }
        Ok(())
    }

    /// Persists a new schedule and arms it immediately.
    pub async fn add(
        &self,
        download_id: &str,
        scheduled_time: i64,
        repeat: Repeat,
        auto_shutdown: bool,
    ) -> Result<i64, DownloadError> {
        let schedule = Schedule {
            id: 0,
            download_id: download_id.to_string(),
            scheduled_time,
            repeat_str: repeat.as_str().to_string(),
            auto_shutdown,
            enabled: true,
        };
        let id = self
            .inner
            .storage
            .insert_schedule(&schedule)
            .await
            .map_err(|e| DownloadError::internal(e.to_string()))?;
        arm(Arc::clone(&self.inner), Schedule { id, ..schedule });
        Ok(id)
    }

    /// Deletes a schedule and aborts its armed timer, if any.
    pub async fn remove(&self, schedule_id: i64) -> Result<(), DownloadError> {
        if let Some((_, handle)) = self.inner.armed.remove(&schedule_id) {
            handle.abort();
        }
        self.inner.storage.delete_schedule(schedule_id).await.map_err(|e| DownloadError::internal(e.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Schedule>, DownloadError> {
        self.inner.storage.list_schedules().await.map_err(|e| DownloadError::internal(e.to_string()))
    }

    /// Aborts any pending auto-shutdown watcher and, defensively, issues the
    /// OS-specific abort command in case the real shutdown had already been invoked.
    pub async fn cancel_shutdown(&self) {
        self.inner.shutdown_pending.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.shutdown_task.lock().await.take() {
            handle.abort();
        }
        issue_os_shutdown_abort().await;
    }

    /// Stops every armed timer task. Does not touch already-issued OS shutdowns.
    pub async fn shutdown(&self) {
        for entry in self.inner.armed.iter() {
            entry.value().abort();
        }
        self.inner.armed.clear();
        if let Some(handle) = self.inner.shutdown_task.lock().await.take() {
            handle.abort();
        }
    }
}

fn arm(inner: Arc<Inner>, mut schedule: Schedule) {
    let handle = tokio::spawn(async move {
        loop {
            let now = now_unix();
            match compute_fire(schedule.scheduled_time, schedule.repeat(), now) {
                FireDecision::Skip => {
                    debug!(schedule_id = schedule.id, "schedule too far overdue to fire, leaving disarmed");
                    return;
                }
                FireDecision::FireAt { delay_secs, persist_time } => {
                    if let Some(new_time) = persist_time {
                        let _ = inner.storage.update_schedule_time(schedule.id, new_time).await;
                        schedule.scheduled_time = new_time;
                    }
                    tokio::time::sleep(Duration::from_secs(delay_secs.max(0) as u64)).await;

                    match inner.storage.get_download(&schedule.download_id).await {
                        Ok(Some(download)) => {
                            if let Err(err) = inner.queue.enqueue(&schedule.download_id, download.priority()).await {
                                warn!(schedule_id = schedule.id, %err, "scheduled enqueue failed");
                            } else {
                                info!(schedule_id = schedule.id, download_id = %schedule.download_id, "schedule fired");
                            }
                        }
                        Ok(None) => {
                            warn!(schedule_id = schedule.id, "scheduled download no longer exists, disarming");
                            inner.armed.remove(&schedule.id);
                            return;
                        }
                        Err(err) => {
                            warn!(schedule_id = schedule.id, %err, "failed to look up scheduled download");
                        }
                    }

                    if schedule.auto_shutdown {
                        arm_shutdown_watcher(Arc::clone(&inner), schedule.download_id.clone()).await;
                    }

                    if schedule.repeat() == Repeat::None {
                        inner.armed.remove(&schedule.id);
                        return;
                    }
                    // Recurring: loop back around and compute the next occurrence.
                }
            }
        }
    });
    inner.armed.insert(schedule.id, handle);
}

async fn arm_shutdown_watcher(inner: Arc<Inner>, download_id: String) {
    inner.shutdown_pending.store(true, Ordering::SeqCst);
    let watcher = tokio::spawn(async move {
        loop {
            tokio::time::sleep(SHUTDOWN_POLL).await;
            match inner.storage.get_download(&download_id).await {
                Ok(Some(download)) => match download.status() {
                    Status::Completed => break,
                    Status::Error | Status::Cancelled => {
                        info!(download_id = %download_id, "auto-shutdown cancelled: download did not complete");
                        inner.shutdown_pending.store(false, Ordering::SeqCst);
                        return;
                    }
                    _ => continue,
                },
                Ok(None) => return,
                Err(_) => continue,
            }
        }
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        if inner.shutdown_pending.swap(false, Ordering::SeqCst) {
            issue_os_shutdown_now().await;
        }
    });
    let previous = inner.shutdown_task.lock().await.replace(watcher);
    if let Some(previous) = previous {
        previous.abort();
    }
}

#[cfg(unix)]
async fn issue_os_shutdown_now() {
    warn!("auto-shutdown grace period elapsed, issuing OS shutdown");
    let _ = tokio::process::Command::new("shutdown").arg("-h").arg("now").status().await;
}

#[cfg(unix)]
async fn issue_os_shutdown_abort() {
    let _ = tokio::process::Command::new("shutdown").arg("-c").status().await;
}

#[cfg(windows)]
async fn issue_os_shutdown_now() {
    warn!("auto-shutdown grace period elapsed, issuing OS shutdown");
    let _ = tokio::process::Command::new("shutdown").args(["/s", "/t", "0"]).status().await;
}

#[cfg(windows)]
async fn issue_os_shutdown_abort() {
    let _ = tokio::process::Command::new("shutdown").arg("/a").status().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_future_schedule_fires_at_exact_delay() {
        let decision = compute_fire(1_000, Repeat::None, 900);
        assert_eq!(decision, FireDecision::FireAt { delay_secs: 100, persist_time: None });
    }

    #[test]
    fn test_slightly_late_schedule_fires_immediately() {
        let decision = compute_fire(1_000, Repeat::None, 1_000 + 60);
        assert_eq!(decision, FireDecision::FireAt { delay_secs: 0, persist_time: None });
    }

    #[test]
    fn test_very_late_non_recurring_schedule_is_skipped() {
        let decision = compute_fire(1_000, Repeat::None, 1_000 + LATE_GRACE_SECS + 1);
        assert_eq!(decision, FireDecision::Skip);
    }

    #[test]
    fn test_very_late_daily_schedule_rolls_forward_to_next_day() {
        let scheduled = 0;
        let now = DAY_SECS + DAY_SECS / 2; // 1.5 days after the original time
        let decision = compute_fire(scheduled, Repeat::Daily, now);
        match decision {
            FireDecision::FireAt { persist_time: Some(next), .. } => {
                assert_eq!(next, 2 * DAY_SECS);
            }
            other => panic!("expected a rolled-forward fire, got {other:?}"),
        }
    }

    #[test]
    fn test_very_late_weekly_schedule_rolls_forward_to_next_week() {
        let now = WEEK_SECS + 1;
        let decision = compute_fire(0, Repeat::Weekly, now);
        match decision {
            FireDecision::FireAt { persist_time: Some(next), .. } => {
                assert_eq!(next, WEEK_SECS * 2);
            }
            other => panic!("expected a rolled-forward fire, got {other:?}"),
        }
    }
}
