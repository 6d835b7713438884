//! SQLite storage implementation.
//!
//! Holds every persisted entity of a harvest: plans, tasks, claims, content
//! blobs, the request log, page results and the completion ledger. Several
//! worker processes may share one database file; the claim path relies on a
//! single atomic `UPDATE ... RETURNING` so two workers never lease the same task.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{HarvestError, Result};
use crate::traits::ledger::CompletionLedger;
use crate::types::{
    claim::{Claim, ClaimStatus},
    content::{content_hash, ContentBlob, PageResult, RequestRecord},
    gap::{DateRange, MonthBucket},
    page::PageResponse,
    plan::Plan,
    task::{Task, TaskId, TaskStatus},
};

const TASK_COLUMNS: &str = "task_id, endpoint, data_date, window_end, category_code, status, \
     total_pages, total_records, missing_pages, plan_fingerprint, attempts, last_error, \
     created_at, updated_at";

/// SQLite-backed harvest store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

/// What one committed writer batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub records: usize,
    pub pages: usize,
    pub blobs_created: usize,
    pub blobs_reused: usize,
    pub failures: usize,
}

/// Who must hold a task's lease for a guarded status write to land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder<'a> {
    /// The named worker holds the active claim.
    Worker(&'a str),
    /// No worker holds an active claim.
    Nobody,
}

impl<'a> Holder<'a> {
    fn condition(&self) -> &'static str {
        match self {
            Holder::Worker(_) => {
                "AND EXISTS (SELECT 1 FROM claims c WHERE c.task_id = tasks.task_id \
                 AND c.worker_id = ? AND c.status = 'active')"
            }
            Holder::Nobody => {
                "AND NOT EXISTS (SELECT 1 FROM claims c WHERE c.task_id = tasks.task_id \
                 AND c.status = 'active')"
            }
        }
    }

    fn bind<'q>(
        &self,
        query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>
    where
        'a: 'q,
    {
        match *self {
            Holder::Worker(worker_id) => query.bind(worker_id),
            Holder::Nobody => query,
        }
    }
}

impl SqliteStore {
    /// Open (creating if needed) a database in WAL mode.
    ///
    /// # Example URLs
    /// - `sqlite://harvest.db` - File-based database
    /// - `sqlite:///var/lib/harvest/mirror.db` - Absolute path
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    ///
    /// An in-memory database lives and dies with its connection, so the pool
    /// is pinned to exactly one connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plans (
                fingerprint TEXT PRIMARY KEY,
                range_start TEXT NOT NULL,
                range_end TEXT NOT NULL,
                catalog_version TEXT NOT NULL,
                environment TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        // The empty string stands for "no category" so the unique key holds.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                endpoint TEXT NOT NULL,
                data_date TEXT NOT NULL,
                window_end TEXT NOT NULL,
                category_code TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                total_pages INTEGER,
                total_records INTEGER,
                missing_pages TEXT NOT NULL DEFAULT '[]',
                plan_fingerprint TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (endpoint, data_date, category_code)
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_endpoint_date ON tasks(endpoint, data_date);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS claims (
                claim_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL REFERENCES tasks(task_id),
                worker_id TEXT NOT NULL,
                claimed_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_one_active
                ON claims(task_id) WHERE status = 'active';
            CREATE INDEX IF NOT EXISTS idx_claims_expiry ON claims(status, expires_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS content_blobs (
                content_hash TEXT PRIMARY KEY,
                body BLOB NOT NULL,
                size INTEGER NOT NULL,
                reference_count INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS request_records (
                request_id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT '{}',
                http_status INTEGER,
                content_hash TEXT REFERENCES content_blobs(content_hash),
                data_date TEXT NOT NULL,
                page_number INTEGER NOT NULL,
                error TEXT,
                fetched_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_request_records_task ON request_records(task_id);

            CREATE TABLE IF NOT EXISTS page_results (
                task_id TEXT NOT NULL,
                page_number INTEGER NOT NULL,
                record_count INTEGER NOT NULL,
                content_hash TEXT NOT NULL REFERENCES content_blobs(content_hash),
                PRIMARY KEY (task_id, page_number)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger (
                endpoint TEXT NOT NULL,
                bucket TEXT NOT NULL,
                completed_at INTEGER NOT NULL,
                PRIMARY KEY (endpoint, bucket)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // Plans
    // =========================================================================

    pub async fn insert_plan(&self, plan: &Plan) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plans (fingerprint, range_start, range_end, catalog_version, environment, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (fingerprint) DO NOTHING
            "#,
        )
        .bind(&plan.fingerprint)
        .bind(plan.range.start)
        .bind(plan.range.end)
        .bind(&plan.catalog_version)
        .bind(&plan.environment)
        .bind(to_millis(plan.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_plan(&self, fingerprint: &str) -> Result<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>(
            "SELECT fingerprint, range_start, range_end, catalog_version, environment, created_at \
             FROM plans WHERE fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(PlanRow::into_plan))
    }

    /// Distinct fingerprints of tasks that are not yet terminal.
    pub async fn open_fingerprints(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT plan_fingerprint FROM tasks \
             WHERE status NOT IN ('completed', 'failed') ORDER BY plan_fingerprint",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(fp,)| fp).collect())
    }

    /// Move open tasks of a stale plan onto the current one.
    pub async fn restamp_open_tasks(&self, stale: &str, current: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET plan_fingerprint = ?, updated_at = ? \
             WHERE plan_fingerprint = ? AND status NOT IN ('completed', 'failed')",
        )
        .bind(current)
        .bind(to_millis(Utc::now()))
        .bind(stale)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Create-if-absent insert. Returns how many tasks were new.
    pub async fn insert_tasks(&self, tasks: &[Task]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for task in tasks {
            let result = sqlx::query(
                r#"
                INSERT INTO tasks (
                    task_id, endpoint, data_date, window_end, category_code, status,
                    total_pages, total_records, missing_pages, plan_fingerprint, attempts,
                    last_error, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(task.task_id.as_str())
            .bind(&task.endpoint)
            .bind(task.data_date)
            .bind(task.window_end)
            .bind(task.category_code.as_deref().unwrap_or(""))
            .bind(task.status.as_str())
            .bind(task.total_pages.map(i64::from))
            .bind(task.total_records.map(|n| n as i64))
            .bind(serde_json::to_string(&task.missing_pages)?)
            .bind(&task.plan_fingerprint)
            .bind(i64::from(task.attempts))
            .bind(&task.last_error)
            .bind(to_millis(task.created_at))
            .bind(to_millis(task.updated_at))
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"
        ))
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TaskRow::into_task).transpose()
    }

    /// Like [`get_task`](Self::get_task) but a missing task is an error.
    pub async fn require_task(&self, task_id: &TaskId) -> Result<Task> {
        self.get_task(task_id)
            .await?
            .ok_or_else(|| HarvestError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Tasks whose window overlaps `range`, optionally for one endpoint.
    pub async fn tasks_in_range(
        &self,
        endpoint: Option<&str>,
        range: &DateRange,
    ) -> Result<Vec<Task>> {
        let rows = match endpoint {
            Some(endpoint) => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE endpoint = ? AND data_date <= ? AND window_end >= ? \
                     ORDER BY endpoint, data_date, category_code"
                ))
                .bind(endpoint)
                .bind(range.end)
                .bind(range.start)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE data_date <= ? AND window_end >= ? \
                     ORDER BY endpoint, data_date, category_code"
                ))
                .bind(range.end)
                .bind(range.start)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    pub async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ? ORDER BY endpoint, data_date"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    /// Compare-and-set status change. Returns false when the task was not in
    /// `expected` or `holder` does not describe its current lease.
    pub async fn compare_and_set_status(
        &self,
        task_id: &TaskId,
        expected: TaskStatus,
        next: TaskStatus,
        holder: Holder<'_>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE tasks SET status = ?, updated_at = ? WHERE task_id = ? AND status = ? {}",
            holder.condition()
        );
        let query = sqlx::query(&sql)
            .bind(next.as_str())
            .bind(to_millis(Utc::now()))
            .bind(task_id.as_str())
            .bind(expected.as_str());
        let result = holder.bind(query).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Persist the mutable fields of `task`, guarded on the status it had when
    /// read and on who holds its lease.
    pub async fn save_task(
        &self,
        task: &Task,
        expected: TaskStatus,
        holder: Holder<'_>,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            UPDATE tasks SET
                status = ?, total_pages = ?, total_records = ?, missing_pages = ?,
                plan_fingerprint = ?, attempts = ?, last_error = ?, updated_at = ?
            WHERE task_id = ? AND status = ? {}
            "#,
            holder.condition()
        );
        let query = sqlx::query(&sql)
            .bind(task.status.as_str())
            .bind(task.total_pages.map(i64::from))
            .bind(task.total_records.map(|n| n as i64))
            .bind(serde_json::to_string(&task.missing_pages)?)
            .bind(&task.plan_fingerprint)
            .bind(i64::from(task.attempts))
            .bind(&task.last_error)
            .bind(to_millis(Utc::now()))
            .bind(task.task_id.as_str())
            .bind(expected.as_str());
        let result = holder.bind(query).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Operator reset: put tasks back to pending and forget what was fetched for them.
    ///
    /// Tasks currently leased are left alone.
    pub async fn reset_tasks(&self, endpoint: Option<&str>, range: &DateRange) -> Result<Vec<Task>> {
        let resettable: Vec<Task> = self
            .tasks_in_range(endpoint, range)
            .await?
            .into_iter()
            .filter(|t| t.status.can_reset())
            .collect();

        let mut tx = self.pool.begin().await?;
        let mut reset = Vec::with_capacity(resettable.len());
        for task in resettable {
            let result = sqlx::query(
                r#"
                UPDATE tasks SET
                    status = 'pending', total_pages = NULL, total_records = NULL,
                    missing_pages = '[]', attempts = 0, last_error = NULL, updated_at = ?
                WHERE task_id = ? AND status = ?
                "#,
            )
            .bind(to_millis(Utc::now()))
            .bind(task.task_id.as_str())
            .bind(task.status.as_str())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                continue;
            }
            sqlx::query("DELETE FROM page_results WHERE task_id = ?")
                .bind(task.task_id.as_str())
                .execute(&mut *tx)
                .await?;
            reset.push(task);
        }
        tx.commit().await?;
        Ok(reset)
    }

    pub async fn status_counts(
        &self,
        range: Option<&DateRange>,
    ) -> Result<BTreeMap<TaskStatus, u64>> {
        let rows: Vec<(String, i64)> = match range {
            Some(range) => {
                sqlx::query_as(
                    "SELECT status, COUNT(*) FROM tasks \
                     WHERE data_date <= ? AND window_end >= ? GROUP BY status",
                )
                .bind(range.end)
                .bind(range.start)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut counts = BTreeMap::new();
        for (status, count) in rows {
            counts.insert(status.parse::<TaskStatus>()?, count as u64);
        }
        Ok(counts)
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Atomically lease up to `limit` pending tasks to `worker_id`.
    ///
    /// The status flip and the claim rows commit together; a task whose status
    /// already left `pending` is never returned to a second caller.
    pub async fn claim_pending(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| HarvestError::Config(format!("lease duration out of range: {e}")))?;
        let expires_at = now + lease;

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            UPDATE tasks SET status = 'claimed', updated_at = ?
            WHERE status = 'pending' AND task_id IN (
                SELECT task_id FROM tasks
                WHERE status = 'pending'
                ORDER BY endpoint, data_date, category_code
                LIMIT ?
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let task = row.into_task()?;
            insert_claim(&mut tx, &task.task_id, worker_id, now, expires_at).await?;
            tasks.push(task);
        }

        tx.commit().await?;

        debug!(worker_id = %worker_id, claimed = tasks.len(), "Claimed pending tasks");
        Ok(tasks)
    }

    /// Expire leases past `now` and return their tasks to the pool.
    pub async fn release_expired(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<(String,)> = sqlx::query_as(
            "UPDATE claims SET status = 'failed' \
             WHERE status = 'active' AND expires_at <= ? RETURNING task_id",
        )
        .bind(to_millis(now))
        .fetch_all(&mut *tx)
        .await?;

        let mut released = Vec::with_capacity(expired.len());
        for (task_id,) in expired {
            let result = sqlx::query(
                "UPDATE tasks SET status = 'pending', updated_at = ? \
                 WHERE task_id = ? AND status IN ('claimed', 'executing')",
            )
            .bind(to_millis(now))
            .bind(&task_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 1 {
                released.push(TaskId::from_raw(task_id));
            }
        }

        tx.commit().await?;
        Ok(released)
    }

    /// Close `worker_id`'s active claim on a task. Returns false if it held none.
    pub async fn release_claim(
        &self,
        task_id: &TaskId,
        worker_id: &str,
        status: ClaimStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE claims SET status = ? \
             WHERE task_id = ? AND worker_id = ? AND status = 'active'",
        )
        .bind(status.as_str())
        .bind(task_id.as_str())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn active_claim(&self, task_id: &TaskId) -> Result<Option<Claim>> {
        let row = sqlx::query_as::<_, ClaimRow>(
            "SELECT claim_id, task_id, worker_id, claimed_at, expires_at, status \
             FROM claims WHERE task_id = ? AND status = 'active'",
        )
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ClaimRow::into_claim).transpose()
    }

    pub async fn claims_for(&self, task_id: &TaskId) -> Result<Vec<Claim>> {
        let rows = sqlx::query_as::<_, ClaimRow>(
            "SELECT claim_id, task_id, worker_id, claimed_at, expires_at, status \
             FROM claims WHERE task_id = ? ORDER BY claimed_at",
        )
        .bind(task_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ClaimRow::into_claim).collect()
    }

    /// Tasks that currently have an active lease.
    pub async fn actively_claimed(&self) -> Result<HashSet<TaskId>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT task_id FROM claims WHERE status = 'active'")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| TaskId::from_raw(id)).collect())
    }

    // =========================================================================
    // Content
    // =========================================================================

    /// Commit a batch of fetched pages in one transaction.
    pub async fn write_batch(&self, responses: &[PageResponse]) -> Result<BatchOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = BatchOutcome::default();

        for response in responses {
            let hash = match &response.body {
                Some(body) => {
                    let hash = content_hash(body);
                    if upsert_blob(&mut tx, &hash, body, response.fetched_at).await? {
                        outcome.blobs_created += 1;
                    } else {
                        outcome.blobs_reused += 1;
                    }
                    Some(hash)
                }
                None => {
                    outcome.failures += 1;
                    None
                }
            };

            sqlx::query(
                r#"
                INSERT INTO request_records (
                    task_id, endpoint, parameters, http_status, content_hash,
                    data_date, page_number, error, fetched_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(response.task_id.as_str())
            .bind(&response.endpoint)
            .bind(response.parameters.to_string())
            .bind(response.http_status.map(i64::from))
            .bind(&hash)
            .bind(response.data_date)
            .bind(i64::from(response.page_number))
            .bind(&response.error)
            .bind(to_millis(response.fetched_at))
            .execute(&mut *tx)
            .await?;
            outcome.records += 1;

            if let Some(hash) = &hash {
                let result = sqlx::query(
                    "INSERT INTO page_results (task_id, page_number, record_count, content_hash) \
                     VALUES (?, ?, ?, ?) ON CONFLICT (task_id, page_number) DO NOTHING",
                )
                .bind(response.task_id.as_str())
                .bind(i64::from(response.page_number))
                .bind(i64::from(response.record_count.unwrap_or(0)))
                .bind(hash)
                .execute(&mut *tx)
                .await?;
                outcome.pages += result.rows_affected() as usize;
            }

            if let Some(discovery) = response.discovery {
                sqlx::query(
                    "UPDATE tasks SET total_pages = ?, total_records = ?, updated_at = ? \
                     WHERE task_id = ?",
                )
                .bind(i64::from(discovery.total_pages))
                .bind(discovery.total_records as i64)
                .bind(to_millis(Utc::now()))
                .bind(response.task_id.as_str())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    /// Page numbers with a persisted result.
    pub async fn persisted_pages(&self, task_id: &TaskId) -> Result<BTreeSet<u32>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT page_number FROM page_results WHERE task_id = ?")
                .bind(task_id.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(n,)| n as u32).collect())
    }

    pub async fn page_results(&self, task_id: &TaskId) -> Result<Vec<PageResult>> {
        let rows: Vec<(String, i64, i64, String)> = sqlx::query_as(
            "SELECT task_id, page_number, record_count, content_hash FROM page_results \
             WHERE task_id = ? ORDER BY page_number",
        )
        .bind(task_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(task_id, page_number, record_count, content_hash)| PageResult {
                task_id: TaskId::from_raw(task_id),
                page_number: page_number as u32,
                record_count: record_count as u32,
                content_hash,
            })
            .collect())
    }

    pub async fn get_blob(&self, hash: &str) -> Result<Option<ContentBlob>> {
        let row: Option<(String, i64, i64, i64)> = sqlx::query_as(
            "SELECT content_hash, size, reference_count, created_at FROM content_blobs \
             WHERE content_hash = ?",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(content_hash, size, reference_count, created_at)| ContentBlob {
            content_hash,
            size: size as u64,
            reference_count: reference_count as u64,
            created_at: from_millis(created_at),
        }))
    }

    /// Stored bytes for a content hash.
    pub async fn blob_body(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT body FROM content_blobs WHERE content_hash = ?")
                .bind(hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(body,)| body))
    }

    pub async fn count_blobs(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM content_blobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn request_records(&self, task_id: &TaskId) -> Result<Vec<RequestRecord>> {
        let rows = sqlx::query_as::<_, RequestRecordRow>(
            r#"
            SELECT request_id, task_id, endpoint, parameters, http_status, content_hash,
                   data_date, page_number, error, fetched_at
            FROM request_records WHERE task_id = ? ORDER BY request_id
            "#,
        )
        .bind(task_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RequestRecordRow::into_record).collect()
    }

    // =========================================================================
    // Ledger
    // =========================================================================

    /// Status of every task of `endpoint` whose window starts inside `range`.
    pub async fn task_statuses(
        &self,
        endpoint: &str,
        range: &DateRange,
    ) -> Result<HashMap<TaskId, TaskStatus>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT task_id, status FROM tasks \
             WHERE endpoint = ? AND data_date >= ? AND data_date <= ?",
        )
        .bind(endpoint)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, status)| Ok((TaskId::from_raw(id), status.parse::<TaskStatus>()?)))
            .collect()
    }
}

#[async_trait]
impl CompletionLedger for SqliteStore {
    async fn completed_buckets(
        &self,
        endpoint: &str,
        range: &DateRange,
    ) -> Result<HashSet<MonthBucket>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT bucket FROM ledger WHERE endpoint = ? AND bucket >= ? AND bucket <= ?",
        )
        .bind(endpoint)
        .bind(MonthBucket::of(range.start).key())
        .bind(MonthBucket::of(range.end).key())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HarvestError::LedgerUnavailable(e.to_string()))?;

        Ok(rows
            .into_iter()
            .filter_map(|(key,)| MonthBucket::parse(&key))
            .collect())
    }

    async fn mark_complete(&self, endpoint: &str, bucket: MonthBucket) -> Result<()> {
        sqlx::query(
            "INSERT INTO ledger (endpoint, bucket, completed_at) VALUES (?, ?, ?) \
             ON CONFLICT (endpoint, bucket) DO NOTHING",
        )
        .bind(endpoint)
        .bind(bucket.key())
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn invalidate(&self, endpoint: &str, bucket: MonthBucket) -> Result<()> {
        sqlx::query("DELETE FROM ledger WHERE endpoint = ? AND bucket = ?")
            .bind(endpoint)
            .bind(bucket.key())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn insert_claim(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: &TaskId,
    worker_id: &str,
    claimed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO claims (claim_id, task_id, worker_id, claimed_at, expires_at, status) \
         VALUES (?, ?, ?, ?, ?, 'active')",
    )
    .bind(Uuid::now_v7().to_string())
    .bind(task_id.as_str())
    .bind(worker_id)
    .bind(to_millis(claimed_at))
    .bind(to_millis(expires_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Insert a blob or bump its reference count. Returns true when the blob is new.
async fn upsert_blob(
    tx: &mut Transaction<'_, Sqlite>,
    hash: &str,
    body: &[u8],
    seen_at: DateTime<Utc>,
) -> Result<bool> {
    let existing: Option<(i64,)> =
        sqlx::query_as("SELECT reference_count FROM content_blobs WHERE content_hash = ?")
            .bind(hash)
            .fetch_optional(&mut **tx)
            .await?;

    sqlx::query(
        r#"
        INSERT INTO content_blobs (content_hash, body, size, reference_count, created_at)
        VALUES (?, ?, ?, 1, ?)
        ON CONFLICT (content_hash) DO UPDATE SET reference_count = reference_count + 1
        "#,
    )
    .bind(hash)
    .bind(body)
    .bind(body.len() as i64)
    .bind(to_millis(seen_at))
    .execute(&mut **tx)
    .await?;

    Ok(existing.is_none())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// Row types for sqlx queries
#[derive(Debug, FromRow)]
struct TaskRow {
    task_id: String,
    endpoint: String,
    data_date: NaiveDate,
    window_end: NaiveDate,
    category_code: String,
    status: String,
    total_pages: Option<i64>,
    total_records: Option<i64>,
    missing_pages: String,
    plan_fingerprint: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            task_id: TaskId::from_raw(self.task_id),
            endpoint: self.endpoint,
            data_date: self.data_date,
            window_end: self.window_end,
            category_code: (!self.category_code.is_empty()).then_some(self.category_code),
            status: self.status.parse()?,
            total_pages: self.total_pages.map(|n| n as u32),
            total_records: self.total_records.map(|n| n as u64),
            missing_pages: serde_json::from_str(&self.missing_pages)?,
            plan_fingerprint: self.plan_fingerprint,
            attempts: self.attempts as u32,
            last_error: self.last_error,
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
        })
    }
}

#[derive(Debug, FromRow)]
struct ClaimRow {
    claim_id: String,
    task_id: String,
    worker_id: String,
    claimed_at: i64,
    expires_at: i64,
    status: String,
}

impl ClaimRow {
    fn into_claim(self) -> Result<Claim> {
        let status = ClaimStatus::parse(&self.status)
            .ok_or_else(|| HarvestError::Config(format!("unknown claim status: {}", self.status)))?;
        Ok(Claim {
            claim_id: self.claim_id,
            task_id: TaskId::from_raw(self.task_id),
            worker_id: self.worker_id,
            claimed_at: from_millis(self.claimed_at),
            expires_at: from_millis(self.expires_at),
            status,
        })
    }
}

#[derive(Debug, FromRow)]
struct PlanRow {
    fingerprint: String,
    range_start: NaiveDate,
    range_end: NaiveDate,
    catalog_version: String,
    environment: String,
    created_at: i64,
}

impl PlanRow {
    fn into_plan(self) -> Plan {
        Plan {
            fingerprint: self.fingerprint,
            range: DateRange {
                start: self.range_start,
                end: self.range_end,
            },
            catalog_version: self.catalog_version,
            environment: self.environment,
            created_at: from_millis(self.created_at),
        }
    }
}

#[derive(Debug, FromRow)]
struct RequestRecordRow {
    request_id: i64,
    task_id: String,
    endpoint: String,
    parameters: String,
    http_status: Option<i64>,
    content_hash: Option<String>,
    data_date: NaiveDate,
    page_number: i64,
    error: Option<String>,
    fetched_at: i64,
}

impl RequestRecordRow {
    fn into_record(self) -> Result<RequestRecord> {
        Ok(RequestRecord {
            request_id: self.request_id,
            task_id: TaskId::from_raw(self.task_id),
            endpoint: self.endpoint,
            parameters: serde_json::from_str(&self.parameters)?,
            http_status: self.http_status.map(|s| s as u16),
            content_hash: self.content_hash,
            data_date: self.data_date,
            page_number: self.page_number as u32,
            error: self.error,
            fetched_at: from_millis(self.fetched_at),
        })
    }
}
