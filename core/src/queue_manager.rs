//! Priority-ordered admission control on top of [`DownloadEngine`]. See SPEC_FULL.md
//! §4.7.
//!
//! Grounded on `src/queue/mod.rs`'s `dequeue` (`ORDER BY priority DESC, created_at ASC`,
//! atomic claim-on-read) generalized from a SQL row claim into an in-memory priority
//! heap, and on `downloader-core/src/download/engine.rs`'s
//! `process_queue_interruptible_with_options` — the `tokio::select!{biased; ...}` race
//! between an interrupt signal and `Semaphore::acquire_owned` is reused verbatim for the
//! admission loop's shutdown path.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{DownloadEngine, EngineEvent};
use crate::error::DownloadError;
use crate::storage::{DownloadPatch, Priority, Status};

/// `min(5000 * 2^attempt, 60000)` ms, per SPEC_FULL.md §4.7 auto-retry backoff.
const RETRY_BASE_MS: u64 = 5_000;
const RETRY_MAX_MS: u64 = 60_000;

#[derive(Debug)]
struct QueueEntry {
    priority: Priority,
    seq: u64,
    id: String,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// `BinaryHeap` is a max-heap: higher priority pops first; within a priority, the
    /// lower `seq` (earlier enqueue) must pop first, so `seq` compares in reverse.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Allows [`QueueManager::set_concurrency`] to shrink the cap without forcibly
/// preempting downloads already holding a permit: shrinking just marks permits to be
/// forgotten (not returned to the pool) the next time they're released.
#[derive(Debug)]
struct DynSemaphore {
    inner: Arc<Semaphore>,
    pending_forget: AtomicI64,
}

impl DynSemaphore {
    fn new(n: usize) -> Self {
        Self { inner: Arc::new(Semaphore::new(n)), pending_forget: AtomicI64::new(0) }
    }

    async fn acquire(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.inner)
            .acquire_owned()
            .await
            .expect("semaphore never closed for the lifetime of QueueManager")
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        loop {
            let pending = self.pending_forget.load(Ordering::SeqCst);
            if pending <= 0 {
                drop(permit);
                return;
            }
            if self
                .pending_forget
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                permit.forget();
                return;
            }
        }
    }

    fn resize(&self, new_target: usize, current_target: usize) {
        match new_target.cmp(&current_target) {
            CmpOrdering::Greater => {
                let mut grow = new_target - current_target;
                loop {
                    let pending = self.pending_forget.load(Ordering::SeqCst);
                    if pending <= 0 || grow == 0 {
                        break;
                    }
                    let reclaim = pending.min(grow as i64);
                    if self
                        .pending_forget
                        .compare_exchange(pending, pending - reclaim, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        grow -= reclaim as usize;
                        break;
                    }
                }
                if grow > 0 {
                    self.inner.add_permits(grow);
                }
            }
            CmpOrdering::Less => {
                self.pending_forget.fetch_add((current_target - new_target) as i64, Ordering::SeqCst);
            }
            CmpOrdering::Equal => {}
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub size: usize,
}

struct Shared {
    heap: AsyncMutex<BinaryHeap<QueueEntry>>,
    seq: AtomicU64,
    semaphore: DynSemaphore,
    target_concurrency: AtomicU64,
    permits: DashMap<String, OwnedSemaphorePermit>,
    retry_counts: DashMap<String, u32>,
    auto_retry_failed: AtomicBool,
    max_retries: AtomicU32,
    paused: AtomicBool,
    notify: Notify,
    shutdown: AtomicBool,
}

/// Admits queued downloads to the engine under a global concurrency cap, in
/// priority-then-FIFO order, with auto-retry on failure. See SPEC_FULL.md §4.7.
pub struct QueueManager {
    engine: Arc<DownloadEngine>,
    shared: Arc<Shared>,
    admission_task: AsyncMutex<Option<JoinHandle<()>>>,
    event_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    #[must_use]
    pub fn new(engine: Arc<DownloadEngine>, concurrency: usize, auto_retry_failed: bool, max_retries: u32) -> Self {
        let concurrency = concurrency.max(1);
        let shared = Arc::new(Shared {
            heap: AsyncMutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            semaphore: DynSemaphore::new(concurrency),
            target_concurrency: AtomicU64::new(concurrency as u64),
            permits: DashMap::new(),
            retry_counts: DashMap::new(),
            auto_retry_failed: AtomicBool::new(auto_retry_failed),
            max_retries: AtomicU32::new(max_retries),
            paused: AtomicBool::new(false),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        });

        let admission_task = spawn_admission_loop(Arc::clone(&engine), Arc::clone(&shared));
        let event_task = spawn_event_listener(Arc::clone(&engine), Arc::clone(&shared));

        Self {
            engine,
            shared,
            admission_task: AsyncMutex::new(Some(admission_task)),
            event_task: AsyncMutex::new(Some(event_task)),
        }
    }

    /// Enqueues `id` for admission. A no-op if `id` is already active or already
    /// holds a slot. Transitions the persisted status `pending → queued`.
    pub async fn enqueue(&self, id: &str, priority: Priority) -> Result<(), DownloadError> {
        if self.shared.permits.contains_key(id) {
            return Ok(());
        }
        {
            let heap = self.shared.heap.lock().await;
            if heap.iter().any(|e| e.id == id) {
                return Ok(());
            }
        }

        self.engine
            .storage()
            .update_download(id, &DownloadPatch { status: Some(Status::Queued), ..Default::default() })
            .await
            .map_err(|e| DownloadError::internal(e.to_string()))?;

        let seq = self.shared.seq.fetch_add(1, Ordering::SeqCst);
        self.shared.heap.lock().await.push(QueueEntry { priority, seq, id: id.to_string() });
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Reorders a still-pending entry's priority. No-op if `id` isn't currently
    /// waiting in the heap (already admitted, or unknown).
    pub async fn set_priority(&self, id: &str, priority: Priority) {
        let mut heap = self.shared.heap.lock().await;
        let rebuilt: BinaryHeap<QueueEntry> = std::mem::take(&mut *heap)
            .into_iter()
            .map(|mut e| {
                if e.id == id {
                    e.priority = priority;
                }
                e
            })
            .collect();
        *heap = rebuilt;
    }

    /// Adjusts the global concurrency cap. Growing admits more waiting downloads
    /// immediately; shrinking lets in-flight downloads finish before the cap tightens.
    pub fn set_concurrency(&self, n: usize) {
        let n = n.max(1) as u64;
        let previous = self.shared.target_concurrency.swap(n, Ordering::SeqCst);
        self.shared.semaphore.resize(n as usize, previous as usize);
        self.shared.notify.notify_waiters();
    }

    /// Stops admitting new downloads without disturbing ones already running.
    pub fn pause_all(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Re-enqueues every persisted `paused` download and resumes admission.
    pub async fn resume_all(&self) -> Result<(), DownloadError> {
        self.shared.paused.store(false, Ordering::SeqCst);
        let downloads = self.engine.storage().list_by_status(Status::Paused).await.map_err(|e| DownloadError::internal(e.to_string()))?;
        for download in downloads {
            self.enqueue(&download.id, download.priority()).await?;
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    /// Drops every waiting entry without touching already-admitted downloads.
    pub async fn clear(&self) {
        self.shared.heap.lock().await.clear();
    }

    pub async fn stats(&self) -> QueueStats {
        let pending = self.shared.heap.lock().await.len();
        let active = self.shared.permits.len();
        QueueStats { pending, active, size: pending + active }
    }

    /// Stops the admission and event-listener background tasks. Downloads already
    /// admitted keep running; they're just no longer tracked for auto-retry.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        if let Some(handle) = self.admission_task.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.event_task.lock().await.take() {
            handle.abort();
        }
    }
}

fn spawn_admission_loop(engine: Arc<DownloadEngine>, shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let next = if shared.paused.load(Ordering::SeqCst) {
                None
            } else {
                shared.heap.lock().await.pop()
            };

            let Some(entry) = next else {
                // Race the shutdown flag against "something changed" so a set_concurrency,
                // enqueue, or shutdown call wakes this loop promptly (mirrors the
                // teacher's select!{biased; interrupted-poll, permit-acquire}).
                tokio::select! {
                    biased;
                    () = async {
                        while !shared.shutdown.load(Ordering::SeqCst) {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    } => {}
                    () = shared.notify.notified() => {}
                }
                continue;
            };

            let permit = shared.semaphore.acquire().await;
            if shared.shutdown.load(Ordering::SeqCst) {
                shared.semaphore.release(permit);
                return;
            }

            debug!(id = %entry.id, "admitting queued download");
            shared.permits.insert(entry.id.clone(), permit);
            if let Err(err) = engine.start(&entry.id).await {
                warn!(id = %entry.id, %err, "engine.start failed at admission");
                if let Some((_, permit)) = shared.permits.remove(&entry.id) {
                    shared.semaphore.release(permit);
                }
                schedule_retry_if_enabled(Arc::clone(&engine), Arc::clone(&shared), entry.id.clone());
            }
        }
    })
}

fn spawn_event_listener(engine: Arc<DownloadEngine>, shared: Arc<Shared>) -> JoinHandle<()> {
    let mut rx = engine.subscribe();
    tokio::spawn(async move {
        run_event_listener(&mut rx, &engine, &shared).await;
    })
}

async fn run_event_listener(
    rx: &mut broadcast::Receiver<EngineEvent>,
    engine: &Arc<DownloadEngine>,
    shared: &Arc<Shared>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "queue manager event listener lagged behind engine broadcast");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let (id, is_error) = match event {
            EngineEvent::Completed { id } => (id, false),
            EngineEvent::Cancelled { id } => (id, false),
            EngineEvent::Paused { id } => (id, false),
            EngineEvent::Error { id, .. } => (id, true),
            EngineEvent::Added { .. } | EngineEvent::StatusChanged { .. } => continue,
        };

        if let Some((_, permit)) = shared.permits.remove(&id) {
            shared.semaphore.release(permit);
        }
        if is_error {
            schedule_retry_if_enabled(Arc::clone(engine), Arc::clone(shared), id);
        } else {
            shared.retry_counts.remove(&id);
        }
        shared.notify.notify_waiters();
    }
}

fn schedule_retry_if_enabled(engine: Arc<DownloadEngine>, shared: Arc<Shared>, id: String) {
    if !shared.auto_retry_failed.load(Ordering::SeqCst) {
        return;
    }
    let max_retries = shared.max_retries.load(Ordering::SeqCst);
    let attempt = {
        let mut entry = shared.retry_counts.entry(id.clone()).or_insert(0);
        let attempt = *entry;
        *entry += 1;
        attempt
    };
    if attempt >= max_retries {
        shared.retry_counts.remove(&id);
        return;
    }

    let delay_ms = RETRY_BASE_MS.saturating_mul(1u64 << attempt.min(16)).min(RETRY_MAX_MS);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = engine.retry(&id).await {
            if !matches!(err, DownloadError::NotFound { .. }) {
                info!(id = %id, %err, "auto-retry re-attempt failed");
            }
            return;
        }
        info!(id = %id, attempt, "auto-retry scheduled download for re-attempt");
    });
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

    #[test]
    fn test_queue_entry_ordering_is_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        heap.push(QueueEntry { priority: Priority::Low, seq: 0, id: "a".into() });
        heap.push(QueueEntry { priority: Priority::High, seq: 1, id: "b".into() });
        heap.push(QueueEntry { priority: Priority::High, seq: 2, id: "c".into() });
        heap.push(QueueEntry { priority: Priority::Normal, seq: 3, id: "d".into() });

        assert_eq!(heap.pop().unwrap().id, "b");
        assert_eq!(heap.pop().unwrap().id, "c");
        assert_eq!(heap.pop().unwrap().id, "d");
        assert_eq!(heap.pop().unwrap().id, "a");
    }

    #[tokio::test]
    async fn test_dyn_semaphore_shrink_then_grow_converges_on_target() {
        let sem = DynSemaphore::new(2);
        let a = sem.acquire().await;
        let b = sem.acquire().await;
        sem.resize(1, 2);
        sem.release(a);
        assert_eq!(sem.inner.available_permits(), 0, "shrink should have forgotten the released permit");
        sem.resize(3, 1);
        sem.release(b);
        assert_eq!(sem.inner.available_permits(), 3);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_for_already_queued_id() {
        let engine = test_engine().await;
        let manager = QueueManager::new(engine, 2, false, 3);
        manager.shared.heap.lock().await.push(QueueEntry { priority: Priority::Normal, seq: 0, id: "x".into() });

        // enqueue() short-circuits on heap membership before touching storage, so this
        // must not error even though "x" was never persisted.
        manager.enqueue("x", Priority::High).await.unwrap();
        assert_eq!(manager.stats().await.pending, 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_priority_reorders_pending_entry() {
        let engine = test_engine().await;
        let manager = QueueManager::new(engine, 1, false, 3);
        {
            let mut heap = manager.shared.heap.lock().await;
            heap.push(QueueEntry { priority: Priority::Low, seq: 0, id: "a".into() });
            heap.push(QueueEntry { priority: Priority::Low, seq: 1, id: "b".into() });
        }
        manager.set_priority("b", Priority::High).await;
        let popped = manager.shared.heap.lock().await.pop().unwrap();
        assert_eq!(popped.id, "b");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stats_reports_pending_and_active() {
        let engine = test_engine().await;
        let manager = QueueManager::new(engine, 4, false, 3);
        manager.shared.heap.lock().await.push(QueueEntry { priority: Priority::Normal, seq: 0, id: "a".into() });
        let stats = manager.stats().await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.size, 1);
        manager.shutdown().await;
    }
}
