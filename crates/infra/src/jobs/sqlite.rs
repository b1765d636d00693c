//! SQLite-backed job queue and status store.
//!
//! Both live in the same database file but in separate tables, so the status
//! store never depends on queue internals. Instants used in comparisons are
//! stored as epoch milliseconds; structured values as JSON text.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use civic_core::{JobId, OwnerId};
use civic_pipeline::{Job, JobOutcome, JobStatus};

use super::queue::{
    Delivery, JobQueue, Lease, QueueEntry, QueueError, QueueState, QueueStats, available_after,
    lease_expiry,
};
use super::store::{JobMutation, JobStatusStore, StoreError};

/// Open a pool for `url` (`sqlite://path/to/db` or `sqlite::memory:`).
///
/// In-memory databases live as long as their connection, so they get a single
/// connection that is never recycled.
pub async fn connect(url: &str) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = url.contains(":memory:") || url.contains("mode=memory");

    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?
    };

    Ok(pool)
}

/// Create the queue and status tables if they do not exist.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_queue (
            seq               INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id            TEXT NOT NULL UNIQUE,
            owner_id          TEXT NOT NULL,
            payload           TEXT NOT NULL,
            options           TEXT NOT NULL,
            priority          INTEGER NOT NULL,
            status            TEXT NOT NULL,
            available_at      INTEGER NOT NULL,
            lease_token       TEXT NULL,
            lease_owner       TEXT NULL,
            lease_expires_at  INTEGER NULL,
            attempts          INTEGER NOT NULL DEFAULT 0,
            error             TEXT NULL,
            result            TEXT NULL,
            finished_at       INTEGER NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS job_queue_eligible ON job_queue (status, priority DESC, seq)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_status (
            job_id            TEXT PRIMARY KEY,
            owner_id          TEXT NOT NULL,
            status            TEXT NOT NULL,
            progress          INTEGER NOT NULL,
            progress_message  TEXT NOT NULL,
            result_ref        TEXT NULL,
            error             TEXT NULL,
            created_at        INTEGER NOT NULL,
            completed_at      INTEGER NULL,
            updated_at        INTEGER NOT NULL,
            record            TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS job_status_owner ON job_status (owner_id, created_at)")
        .execute(pool)
        .await?;

    info!("job tables migrated");
    Ok(())
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

const UNFINISHED: &str = "('waiting', 'active', 'delayed')";
const FINISHED: &str = "('completed', 'failed', 'cancelled')";

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// SQLite job queue.
///
/// `dequeue` is a single `UPDATE ... RETURNING` statement, so two workers (in
/// this process or another one sharing the file) can never lease the same job.
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
    notify: Arc<Notify>,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    async fn exists(&self, id: JobId) -> Result<bool, QueueError> {
        let row = sqlx::query("SELECT 1 FROM job_queue WHERE job_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Error for an acknowledgement that matched no row.
    async fn lease_miss(&self, id: JobId) -> QueueError {
        match self.exists(id).await {
            Ok(true) => QueueError::LeaseLost(id),
            Ok(false) => QueueError::NotFound(id),
            Err(err) => err,
        }
    }

    async fn finish_leased(
        &self,
        lease: &Lease,
        status: JobStatus,
        error: Option<&str>,
        result: Option<String>,
    ) -> Result<(), QueueError> {
        let done = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = ?, error = ?, result = ?, finished_at = ?,
                lease_token = NULL, lease_owner = NULL, lease_expires_at = NULL
            WHERE job_id = ? AND status = 'active' AND lease_token = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(result)
        .bind(millis(Utc::now()))
        .bind(lease.job_id.to_string())
        .bind(lease.token.to_string())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.lease_miss(lease.job_id).await);
        }
        Ok(())
    }
}

fn corrupt_entry(id: &str, reason: impl ToString) -> QueueError {
    QueueError::Corrupt {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

fn decode_delivery(
    row: &SqliteRow,
    token: Uuid,
    expires_at: DateTime<Utc>,
) -> Result<Delivery, QueueError> {
    let job_id: String = row.try_get("job_id")?;
    let owner_id: String = row.try_get("owner_id")?;
    let payload: String = row.try_get("payload")?;
    let options: String = row.try_get("options")?;
    let available_at: i64 = row.try_get("available_at")?;
    let attempts: i64 = row.try_get("attempts")?;

    let id = JobId::from_str(&job_id).map_err(|e| corrupt_entry(&job_id, e))?;
    let entry = QueueEntry {
        job_id: id,
        owner_id: OwnerId::from_str(&owner_id).map_err(|e| corrupt_entry(&job_id, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| corrupt_entry(&job_id, e))?,
        options: serde_json::from_str(&options).map_err(|e| corrupt_entry(&job_id, e))?,
        available_at: from_millis(available_at)
            .ok_or_else(|| corrupt_entry(&job_id, "available_at out of range"))?,
    };

    Ok(Delivery {
        entry,
        lease: Lease {
            job_id: id,
            token,
            expires_at,
        },
        attempt: u32::try_from(attempts).unwrap_or(u32::MAX),
    })
}

fn decode_status(id: &str, raw: &str) -> Result<JobStatus, QueueError> {
    JobStatus::parse(raw).ok_or_else(|| corrupt_entry(id, format!("unknown status '{raw}'")))
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn submit(&self, entry: QueueEntry) -> Result<JobId, QueueError> {
        let id = entry.job_id;
        let payload =
            serde_json::to_string(&entry.payload).map_err(|e| QueueError::Storage(e.to_string()))?;
        let options =
            serde_json::to_string(&entry.options).map_err(|e| QueueError::Storage(e.to_string()))?;
        let status = if entry.available_at > Utc::now() {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };

        let inserted = sqlx::query(
            r#"
            INSERT INTO job_queue (job_id, owner_id, payload, options, priority, status, available_at, attempts)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(id.to_string())
        .bind(entry.owner_id.to_string())
        .bind(payload)
        .bind(options)
        .bind(entry.options.priority)
        .bind(status.as_str())
        .bind(millis(entry.available_at))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(QueueError::AlreadyExists(id));
            }
            Err(err) => return Err(err.into()),
        }

        debug!(job_id = %id, status = %status, "job queued");
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let now = Utc::now();
        let token = Uuid::now_v7();
        let expires_at = lease_expiry(now, lease_ttl);

        let row = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'active', attempts = attempts + 1,
                lease_token = ?, lease_owner = ?, lease_expires_at = ?
            WHERE seq = (
                SELECT seq FROM job_queue
                WHERE (status IN ('waiting', 'delayed') AND available_at <= ?)
                   OR (status = 'active' AND lease_expires_at <= ?)
                ORDER BY priority DESC, seq ASC
                LIMIT 1
            )
            RETURNING job_id, owner_id, payload, options, available_at, attempts
            "#,
        )
        .bind(token.to_string())
        .bind(worker_id)
        .bind(millis(expires_at))
        .bind(millis(now))
        .bind(millis(now))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let delivery = decode_delivery(&row, token, expires_at)?;
        if delivery.attempt > 1 {
            info!(job_id = %delivery.entry.job_id, attempt = delivery.attempt, "job redelivered");
        }
        Ok(Some(delivery))
    }

    async fn wait_for_work(&self, max: Duration) {
        let _ = tokio::time::timeout(max, self.notify.notified()).await;
    }

    async fn extend_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease, QueueError> {
        let expires_at = lease_expiry(Utc::now(), ttl);
        let done = sqlx::query(
            "UPDATE job_queue SET lease_expires_at = ? WHERE job_id = ? AND status = 'active' AND lease_token = ?",
        )
        .bind(millis(expires_at))
        .bind(lease.job_id.to_string())
        .bind(lease.token.to_string())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.lease_miss(lease.job_id).await);
        }
        Ok(Lease {
            expires_at,
            ..lease.clone()
        })
    }

    async fn complete(&self, lease: &Lease, outcome: &JobOutcome) -> Result<(), QueueError> {
        let result =
            serde_json::to_string(outcome).map_err(|e| QueueError::Storage(e.to_string()))?;
        self.finish_leased(lease, JobStatus::Completed, None, Some(result))
            .await
    }

    async fn fail(&self, lease: &Lease, error: &str) -> Result<(), QueueError> {
        self.finish_leased(lease, JobStatus::Failed, Some(error), None)
            .await
    }

    async fn retry_later(&self, lease: &Lease, delay: Duration) -> Result<(), QueueError> {
        let done = sqlx::query(
            r#"
            UPDATE job_queue
            SET status = 'delayed', available_at = ?,
                lease_token = NULL, lease_owner = NULL, lease_expires_at = NULL
            WHERE job_id = ? AND status = 'active' AND lease_token = ?
            "#,
        )
        .bind(millis(available_after(Utc::now(), delay)))
        .bind(lease.job_id.to_string())
        .bind(lease.token.to_string())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(self.lease_miss(lease.job_id).await);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn cancel(&self, id: JobId) -> Result<bool, QueueError> {
        let done = sqlx::query(
            "UPDATE job_queue SET status = 'cancelled', finished_at = ? WHERE job_id = ? AND status IN ('waiting', 'delayed')",
        )
        .bind(millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() > 0 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(QueueError::NotFound(id))
        }
    }

    async fn force_fail(&self, id: JobId, error: &str) -> Result<bool, QueueError> {
        let done = sqlx::query(&format!(
            r#"
            UPDATE job_queue
            SET status = 'failed', error = ?, finished_at = ?,
                lease_token = NULL, lease_owner = NULL, lease_expires_at = NULL
            WHERE job_id = ? AND status IN {UNFINISHED}
            "#
        ))
        .bind(error)
        .bind(millis(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() > 0)
    }

    async fn state(&self, id: JobId) -> Result<Option<QueueState>, QueueError> {
        let key = id.to_string();
        let row = sqlx::query(
            "SELECT status, attempts, error, result, lease_expires_at, finished_at FROM job_queue WHERE job_id = ?",
        )
        .bind(&key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.try_get("status")?;
        let attempts: i64 = row.try_get("attempts")?;
        let result: Option<String> = row.try_get("result")?;
        let lease_expires_at: Option<i64> = row.try_get("lease_expires_at")?;
        let finished_at: Option<i64> = row.try_get("finished_at")?;

        let result = result
            .map(|raw| serde_json::from_str::<JobOutcome>(&raw))
            .transpose()
            .map_err(|e| corrupt_entry(&key, e))?;

        Ok(Some(QueueState {
            status: decode_status(&key, &status)?,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            error: row.try_get("error")?,
            result,
            lease_expires_at: lease_expires_at.and_then(from_millis),
            finished_at: finished_at.and_then(from_millis),
        }))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM job_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            stats.add(decode_status("-", &status)?, usize::try_from(n).unwrap_or(0));
        }
        Ok(stats)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
        let done = sqlx::query(&format!(
            "DELETE FROM job_queue WHERE status IN {FINISHED} AND finished_at < ?"
        ))
        .bind(millis(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() as usize)
    }
}

// ---------------------------------------------------------------------------
// Status store
// ---------------------------------------------------------------------------

/// SQLite status store.
///
/// The full [`Job`] is kept as JSON in `record`; the flat columns mirror the
/// fields external readers and the recovery queries filter on.
#[derive(Debug, Clone)]
pub struct SqliteJobStatusStore {
    pool: SqlitePool,
}

impl SqliteJobStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn apply(
        conn: &mut SqliteConnection,
        id: JobId,
        mutation: JobMutation<'_>,
    ) -> Result<Option<Job>, StoreError> {
        let key = id.to_string();
        let row = sqlx::query("SELECT record FROM job_status WHERE job_id = ?")
            .bind(&key)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        let mut job = decode_job(&key, &row)?;
        if !mutation(&mut job) {
            return Ok(None);
        }

        let record = encode_job(&job)?;
        sqlx::query(
            r#"
            UPDATE job_status
            SET status = ?, progress = ?, progress_message = ?, result_ref = ?, error = ?,
                completed_at = ?, updated_at = ?, record = ?
            WHERE job_id = ?
            "#,
        )
        .bind(job.status.as_str())
        .bind(i64::from(job.progress))
        .bind(&job.progress_message)
        .bind(job.result.as_ref().map(|r| r.record_id.clone()))
        .bind(job.error.as_deref())
        .bind(job.completed_at.map(millis))
        .bind(millis(job.updated_at))
        .bind(record)
        .bind(&key)
        .execute(&mut *conn)
        .await?;

        Ok(Some(job))
    }
}

fn encode_job(job: &Job) -> Result<String, StoreError> {
    serde_json::to_string(job).map_err(|e| StoreError::Storage(e.to_string()))
}

fn decode_job(id: &str, row: &SqliteRow) -> Result<Job, StoreError> {
    let raw: String = row.try_get("record")?;
    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

fn decode_jobs(rows: &[SqliteRow]) -> Result<Vec<Job>, StoreError> {
    rows.iter().map(|row| decode_job("-", row)).collect()
}

#[async_trait]
impl JobStatusStore for SqliteJobStatusStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_status
                (job_id, owner_id, status, progress, progress_message, result_ref, error,
                 created_at, completed_at, updated_at, record)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.owner_id.to_string())
        .bind(job.status.as_str())
        .bind(i64::from(job.progress))
        .bind(&job.progress_message)
        .bind(job.result.as_ref().map(|r| r.record_id.clone()))
        .bind(job.error.as_deref())
        .bind(millis(job.created_at))
        .bind(job.completed_at.map(millis))
        .bind(millis(job.updated_at))
        .bind(encode_job(job)?)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(job.id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let key = id.to_string();
        let row = sqlx::query("SELECT record FROM job_status WHERE job_id = ?")
            .bind(&key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_job(&key, &row)).transpose()
    }

    async fn list_by_owner(&self, owner_id: OwnerId) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT record FROM job_status WHERE owner_id = ? ORDER BY created_at DESC, job_id DESC",
        )
        .bind(owner_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        decode_jobs(&rows)
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT record FROM job_status WHERE status IN {UNFINISHED} ORDER BY created_at ASC, job_id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        decode_jobs(&rows)
    }

    async fn update_with(
        &self,
        id: JobId,
        mutation: JobMutation<'_>,
    ) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock before it reads.
        let locked = sqlx::query("UPDATE job_status SET updated_at = updated_at WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        if locked.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        let updated = Self::apply(&mut tx, id, mutation).await?;
        tx.commit().await?;
        Ok(updated)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let done = sqlx::query(&format!(
            "DELETE FROM job_status WHERE status IN {FINISHED} AND completed_at < ?"
        ))
        .bind(millis(cutoff))
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() as usize)
    }
}
