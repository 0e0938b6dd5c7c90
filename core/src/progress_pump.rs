//! Activity-gated progress broadcasting. See SPEC_FULL.md §4.9.
//!
//! No timer runs while there are zero active downloads; the engine's own broadcast
//! stream (the same `tokio::sync::broadcast<EngineEvent>` `queue_manager.rs` listens
//! on) drives the activity gate, reusing the subscribe-and-react pattern from that
//! module rather than polling `DownloadEngine::active_ids` on a clock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::engine::{DownloadEngine, EngineEvent};
use crate::storage::Status;

const VISIBLE_PERIOD: Duration = Duration::from_millis(100);
const BACKGROUND_PERIOD: Duration = Duration::from_millis(500);

/// One download's live progress, as sampled from the engine's in-memory EMA state.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub id: String,
    pub downloaded_bytes: u64,
    pub total_size: u64,
    pub speed_bps: f64,
    pub eta_secs: u64,
}

struct Shared {
    engine: Arc<DownloadEngine>,
    tx: broadcast::Sender<Arc<[ProgressSnapshot]>>,
    visible: AtomicBool,
    tick_task: AsyncMutex<Option<JoinHandle<()>>>,
}

/// Pulls progress from the engine on an adaptive cadence and fans it out to
/// subscribers. A single instance is shared process-wide (§5 "the ProgressPump timer
/// is at-most-one-instance").
pub struct ProgressPump {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

impl ProgressPump {
    #[must_use]
    pub fn new(engine: Arc<DownloadEngine>) -> Self {
        let (tx, _rx) = broadcast::channel(32);
        let shared = Arc::new(Shared {
            engine: Arc::clone(&engine),
            tx,
            visible: AtomicBool::new(true),
            tick_task: AsyncMutex::new(None),
        });
        let supervisor = spawn_supervisor(engine, Arc::clone(&shared));
        Self { shared, supervisor }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<[ProgressSnapshot]>> {
        self.shared.tx.subscribe()
    }

    /// Toggles the tick cadence between the 100ms "UI visible" and 500ms "backgrounded"
    /// rates. Takes effect on the next tick.
    pub fn set_visible(&self, visible: bool) {
        self.shared.visible.store(visible, Ordering::Relaxed);
    }

    pub async fn shutdown(&self) {
        self.supervisor.abort();
        if let Some(handle) = self.shared.tick_task.lock().await.take() {
            handle.abort();
        }
    }
}

fn spawn_supervisor(engine: Arc<DownloadEngine>, shared: Arc<Shared>) -> JoinHandle<()> {
    let mut rx = engine.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "progress pump missed engine events, activity gate may lag briefly");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };
            match event {
                EngineEvent::Added { .. } => ensure_running(&shared).await,
                EngineEvent::StatusChanged { status: Status::Downloading, .. } => ensure_running(&shared).await,
                EngineEvent::Completed { .. }
                | EngineEvent::Paused { .. }
                | EngineEvent::Cancelled { .. }
                | EngineEvent::Error { .. } => stop_if_idle(&shared).await,
                EngineEvent::StatusChanged { .. } => {}
            }
        }
    })
}

async fn ensure_running(shared: &Arc<Shared>) {
    let mut guard = shared.tick_task.lock().await;
    if guard.is_none() {
        *guard = Some(tokio::spawn(run_tick_loop(Arc::clone(shared))));
    }
}

async fn stop_if_idle(shared: &Arc<Shared>) {
    if shared.engine.active_ids().is_empty() {
        if let Some(handle) = shared.tick_task.lock().await.take() {
            handle.abort();
        }
    }
}

async fn run_tick_loop(shared: Arc<Shared>) {
    loop {
        let period = if shared.visible.load(Ordering::Relaxed) { VISIBLE_PERIOD } else { BACKGROUND_PERIOD };
        tokio::time::sleep(period).await;

        let ids = shared.engine.active_ids();
        if ids.is_empty() {
            // The triggering terminal event's stop_if_idle should already have aborted
            // us; this is just a safety net against a missed wakeup.
            return;
        }

        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            let total_size = match shared.engine.get(&id).await {
                Ok(Some(download)) => download.total_size.max(0) as u64,
                _ => 0,
            };
            if let Some((downloaded_bytes, speed_bps, eta_secs)) = shared.engine.sample_progress(&id, total_size).await {
                snapshots.push(ProgressSnapshot { id, downloaded_bytes, total_size, speed_bps, eta_secs });
            }
        }
        // No subscribers is a normal, silent no-op (§4.9).
        let _ = shared.tx.send(snapshots.into());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::storage::Storage;
    use reqwest::Client;

    async fn test_engine() -> Arc<DownloadEngine> {
        Arc::new(DownloadEngine::new(Storage::open_in_memory().await.unwrap(), Client::new(), RetryPolicy::default()))
    }

    #[tokio::test]
    async fn test_pump_starts_idle_with_no_tick_task() {
        let engine = test_engine().await;
        let pump = ProgressPump::new(engine);
        assert!(pump.shared.tick_task.lock().await.is_none());
        pump.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_visible_updates_the_flag() {
        let engine = test_engine().await;
        let pump = ProgressPump::new(engine);
        pump.set_visible(false);
        assert!(!pump.shared.visible.load(Ordering::Relaxed));
        pump.shutdown().await;
    }

    #[tokio::test]
    async fn test_ensure_running_then_stop_if_idle_manages_tick_task() {
        let engine = test_engine().await;
        let pump = ProgressPump::new(engine);

        ensure_running(&pump.shared).await;
        assert!(pump.shared.tick_task.lock().await.is_some());

        // No active downloads, so the idle check tears the tick task back down.
        stop_if_idle(&pump.shared).await;
        assert!(pump.shared.tick_task.lock().await.is_none());

        pump.shutdown().await;
    }
}
