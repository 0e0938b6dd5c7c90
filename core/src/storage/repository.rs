//! SQLite-backed durable store for downloads, segments and schedules.
//!
//! Connection pool management, WAL mode and migration execution mirror the teacher's
//! `db.rs` closely; the query surface is new (downloads/segments/schedules instead of
//! a single queue table) but keeps its idioms: atomic `UPDATE ... RETURNING`, a
//! `check_affected` helper for not-found detection, `#[instrument]` on every method.

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::instrument;

use super::error::StorageError;
use super::models::{Download, DownloadPatch, Schedule, Segment, Status};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT_MS: u32 = 5000;

pub type Result<T> = std::result::Result<T, StorageError>;

fn check_affected(rows_affected: u64, id: &str) -> Result<()> {
    if rows_affected == 0 {
        Err(StorageError::DownloadNotFound(id.to_string()))
    } else {
        Ok(())
    }
}

/// Durable store handle. Cheap to clone (wraps a pooled connection handle).
#[derive(Debug, Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Opens (creating if absent) the SQLite database at `db_path`, enables WAL mode and
    /// foreign keys, and runs pending migrations.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;
        Self::init_pool(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests.
    #[instrument]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_pool(pool: &SqlitePool) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(pool).await?;
        sqlx::migrate!("./migrations").run(pool).await?;
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- downloads ----

    #[instrument(skip(self, download))]
    pub async fn insert_download(&self, download: &Download) -> Result<()> {
        sqlx::query(
            r"INSERT INTO downloads (
                id, url, referrer, mime, filename, save_path, total_size,
                downloaded_bytes, resumable, status, threads, priority,
                created_at, completed_at, checksum, checksum_type, error
              ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&download.id)
        .bind(&download.url)
        .bind(&download.referrer)
        .bind(&download.mime)
        .bind(&download.filename)
        .bind(&download.save_path)
        .bind(download.total_size)
        .bind(download.downloaded_bytes)
        .bind(download.resumable)
        .bind(&download.status_str)
        .bind(download.threads)
        .bind(download.priority)
        .bind(download.created_at)
        .bind(download.completed_at)
        .bind(&download.checksum)
        .bind(&download.checksum_type)
        .bind(&download.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, patch))]
    pub async fn update_download(&self, id: &str, patch: &DownloadPatch) -> Result<()> {
        // Teacher style: a handful of narrow, single-column UPDATE statements rather than
        // one giant dynamic query builder, since the patch surface here is small and fixed.
        if let Some(url) = &patch.url {
            self.exec_single_column_update("url", url, id).await?;
        }
        if let Some(filename) = &patch.filename {
            self.exec_single_column_update("filename", filename, id).await?;
        }
        if let Some(total_size) = patch.total_size {
            self.exec_single_column_update_i64("total_size", total_size, id).await?;
        }
        if let Some(downloaded_bytes) = patch.downloaded_bytes {
            self.exec_single_column_update_i64("downloaded_bytes", downloaded_bytes, id)
                .await?;
        }
        if let Some(resumable) = patch.resumable {
            let result = sqlx::query("UPDATE downloads SET resumable = ? WHERE id = ?")
                .bind(resumable)
                .bind(id)
                .execute(&self.pool)
                .await?;
            check_affected(result.rows_affected(), id)?;
        }
        if let Some(status) = patch.status {
            let result = sqlx::query("UPDATE downloads SET status = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(id)
                .execute(&self.pool)
                .await?;
            check_affected(result.rows_affected(), id)?;
        }
        if let Some(threads) = patch.threads {
            self.exec_single_column_update_i64("threads", threads, id).await?;
        }
        if let Some(priority) = patch.priority {
            self.exec_single_column_update_i64("priority", priority, id).await?;
        }
        if let Some(completed_at) = patch.completed_at {
            let result = sqlx::query("UPDATE downloads SET completed_at = ? WHERE id = ?")
                .bind(completed_at)
                .bind(id)
                .execute(&self.pool)
                .await?;
            check_affected(result.rows_affected(), id)?;
        }
        if let Some(error) = &patch.error {
            let result = sqlx::query("UPDATE downloads SET error = ? WHERE id = ?")
                .bind(error)
                .bind(id)
                .execute(&self.pool)
                .await?;
            check_affected(result.rows_affected(), id)?;
        }
        Ok(())
    }

    async fn exec_single_column_update(&self, column: &str, value: &str, id: &str) -> Result<()> {
        let sql = format!("UPDATE downloads SET {column} = ? WHERE id = ?");
        let result = sqlx::query(&sql).bind(value).bind(id).execute(&self.pool).await?;
        check_affected(result.rows_affected(), id)
    }

    async fn exec_single_column_update_i64(&self, column: &str, value: i64, id: &str) -> Result<()> {
        let sql = format!("UPDATE downloads SET {column} = ? WHERE id = ?");
        let result = sqlx::query(&sql).bind(value).bind(id).execute(&self.pool).await?;
        check_affected(result.rows_affected(), id)
    }

    #[instrument(skip(self))]
    pub async fn get_download(&self, id: &str) -> Result<Option<Download>> {
        let row = sqlx::query_as::<_, Download>("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    #[instrument(skip(self))]
    pub async fn list_downloads(&self) -> Result<Vec<Download>> {
        let rows = sqlx::query_as::<_, Download>("SELECT * FROM downloads ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub async fn list_by_status(&self, status: Status) -> Result<Vec<Download>> {
        let rows = sqlx::query_as::<_, Download>(
            "SELECT * FROM downloads WHERE status = ? ORDER BY created_at DESC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub async fn delete_download(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        check_affected(result.rows_affected(), id)
    }

    #[instrument(skip(self))]
    pub async fn clear_completed(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM downloads WHERE status = 'completed'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Demotes any row left `downloading` (process died mid-transfer) back to `queued`.
    /// Segment `downloaded_bytes` are untouched so the next `start` resumes cleanly.
    #[instrument(skip(self))]
    pub async fn reset_in_flight(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE downloads SET status = 'queued' WHERE status = 'downloading'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ---- segments ----

    #[instrument(skip(self, segments))]
    pub async fn insert_segments(&self, download_id: &str, segments: &[Segment]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for seg in segments {
            sqlx::query(
                "INSERT INTO segments (download_id, idx, start_byte, end_byte, downloaded_bytes, status)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(download_id)
            .bind(seg.idx)
            .bind(seg.start_byte)
            .bind(seg.end_byte)
            .bind(seg.downloaded_bytes)
            .bind(&seg.status_str)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn update_segment(
        &self,
        download_id: &str,
        idx: i64,
        downloaded_bytes: i64,
        status: super::models::SegmentStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE segments SET downloaded_bytes = ?, status = ? WHERE download_id = ? AND idx = ?",
        )
        .bind(downloaded_bytes)
        .bind(status.as_str())
        .bind(download_id)
        .bind(idx)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bulk-persists all segment states in one transaction (used on `pause`).
    #[instrument(skip(self, segments))]
    pub async fn bulk_update_segments(&self, download_id: &str, segments: &[Segment]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for seg in segments {
            sqlx::query(
                "UPDATE segments SET downloaded_bytes = ?, status = ? WHERE download_id = ? AND idx = ?",
            )
            .bind(seg.downloaded_bytes)
            .bind(&seg.status_str)
            .bind(download_id)
            .bind(seg.idx)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_segments(&self, download_id: &str) -> Result<Vec<Segment>> {
        let rows = sqlx::query_as::<_, Segment>(
            "SELECT * FROM segments WHERE download_id = ? ORDER BY idx ASC",
        )
        .bind(download_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub async fn delete_segments(&self, download_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM segments WHERE download_id = ?")
            .bind(download_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- schedules ----

    #[instrument(skip(self, schedule))]
    pub async fn insert_schedule(&self, schedule: &Schedule) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO schedules (download_id, scheduled_time, repeat, auto_shutdown, enabled)
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(&schedule.download_id)
        .bind(schedule.scheduled_time)
        .bind(&schedule.repeat_str)
        .bind(schedule.auto_shutdown)
        .bind(schedule.enabled)
        .fetch_one(&self.pool)
        .await?;
        Ok(result.get("id"))
    }

    #[instrument(skip(self))]
    pub async fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules ORDER BY scheduled_time ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub async fn update_schedule_time(&self, id: i64, scheduled_time: i64) -> Result<()> {
        sqlx::query("UPDATE schedules SET scheduled_time = ? WHERE id = ?")
            .bind(scheduled_time)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn delete_schedule(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}
