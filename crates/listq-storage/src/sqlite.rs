use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listq_core::{normalize, Job};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Row, Sqlite, SqliteConnection};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sql::{self, JobColumns, JobRow, SqlValue, Statement};
use crate::{
    stale_cutoff, Backend, ColumnInfo, ColumnsInfo, FinishReport, JobStore, StorageError,
    TableNames, TerminalWrite,
};

/// Job store over a SQLite file. Claims run under `BEGIN IMMEDIATE` so two
/// workers sharing the file serialize on the write lock.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    tables: TableNames,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool, tables: TableNames) -> Self {
        Self { pool, tables }
    }

    pub async fn connect(url: &str, tables: TableNames) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(10));
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool, tables))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn execute(&self, stmt: &Statement) -> Result<u64, StorageError> {
        let done = bind_all(sqlx::query(&stmt.text), &stmt.binds)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn jobs_columns(&self) -> Result<ColumnsInfo, StorageError> {
        let info = self.columns(self.tables.jobs()).await?;
        if info.is_empty() {
            return Err(StorageError::MissingTable(self.tables.jobs().to_string()));
        }
        Ok(info)
    }

    /// Claim plus its attempt bookkeeping under one `BEGIN IMMEDIATE`.
    async fn claim_locked(
        &self,
        conn: &mut SqliteConnection,
        info: &ColumnsInfo,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StorageError> {
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let claimed = self.claim_in_tx(conn, info, now).await;
        let end = if claimed.is_ok() { "COMMIT" } else { "ROLLBACK" };
        if let Err(err) = sqlx::query(end).execute(&mut *conn).await {
            if claimed.is_ok() {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(err.into());
            }
            warn!(error = %err, "rollback after failed claim did not succeed");
        }
        claimed
    }

    async fn claim_in_tx(
        &self,
        conn: &mut SqliteConnection,
        info: &ColumnsInfo,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StorageError> {
        let jobs = self.tables.jobs();
        let stmt = sql::claim(Backend::Sqlite, jobs, info, now);
        let row = bind_all(sqlx::query(&stmt.text), &stmt.binds)
            .fetch_optional(&mut *conn)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let job = JobRow::from_row(&row)?.into_claimed_job(jobs, &JobColumns::from_info(info))?;
        if let Some(mark) = sql::mark_claim_attempt(Backend::Sqlite, jobs, info, &job) {
            bind_all(sqlx::query(&mark.text), &mark.binds)
                .execute(&mut *conn)
                .await?;
        }
        Ok(Some(job))
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    binds: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in binds {
        query = match value.clone() {
            SqlValue::Id(id) => query.bind(id.to_string()),
            SqlValue::Text(v) => query.bind(v),
            SqlValue::OptText(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::OptInt(v) => query.bind(v),
            SqlValue::OptFloat(v) => query.bind(v),
            SqlValue::Timestamp(v) => query.bind(v),
            SqlValue::OptTimestamp(v) => query.bind(v),
        };
    }
    query
}

#[async_trait]
impl JobStore for SqliteJobStore {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    fn tables(&self) -> &TableNames {
        &self.tables
    }

    async fn columns(&self, table: &str) -> Result<ColumnsInfo, StorageError> {
        let rows = sqlx::query(sql::introspect(Backend::Sqlite))
            .bind(table)
            .fetch_all(&self.pool)
            .await?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(ColumnInfo {
                name: row.try_get("name")?,
                declared_type: row.try_get::<Option<String>, _>("type")?.unwrap_or_default(),
            });
        }
        Ok(ColumnsInfo {
            table: table.to_string(),
            columns,
        })
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StorageError> {
        let info = self.jobs_columns().await?;
        let mut conn = self.pool.acquire().await?;
        let Some(job) = self.claim_locked(&mut conn, &info, now).await? else {
            return Ok(None);
        };
        debug!(job_id = %job.id, attempt = job.attempts, "claimed job");
        Ok(Some(job))
    }

    async fn finish(&self, write: &TerminalWrite) -> Result<FinishReport, StorageError> {
        write.check_transition()?;
        let jobs = self.jobs_columns().await?;
        let results = match write.result_record() {
            Some(_) => self.columns(self.tables.results()).await?,
            None => ColumnsInfo::empty(self.tables.results()),
        };
        let update = sql::finish_update(Backend::Sqlite, self.tables.jobs(), &jobs, write);
        let insert = sql::insert_result(Backend::Sqlite, self.tables.results(), &results, write);

        let mut tx = self.pool.begin().await?;
        let affected = bind_all(sqlx::query(&update.text), &update.binds)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if affected == 0 {
            tx.rollback().await?;
            return Err(StorageError::LostClaim(write.job_id));
        }
        let result_row_written = match &insert {
            Some(insert) => {
                bind_all(sqlx::query(&insert.text), &insert.binds)
                    .execute(&mut *tx)
                    .await?;
                true
            }
            None => false,
        };
        tx.commit().await?;
        Ok(FinishReport { result_row_written })
    }

    async fn release(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let info = self.jobs_columns().await?;
        let stmt = sql::release(Backend::Sqlite, self.tables.jobs(), &info, job_id, now);
        Ok(self.execute(&stmt).await? > 0)
    }

    async fn reset_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<u64, StorageError> {
        let info = self.jobs_columns().await?;
        let cutoff = stale_cutoff(now, stale_after);
        let stmt = sql::reset_stale(Backend::Sqlite, self.tables.jobs(), &info, now, cutoff);
        self.execute(&stmt).await
    }

    async fn requeue_due(&self, now: DateTime<Utc>, include_captcha: bool) -> Result<u64, StorageError> {
        let info = self.jobs_columns().await?;
        match sql::requeue_due(Backend::Sqlite, self.tables.jobs(), &info, now, include_captcha) {
            Some(stmt) => self.execute(&stmt).await,
            None => Ok(0),
        }
    }

    async fn requeue_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let info = self.jobs_columns().await?;
        let stmt = sql::requeue_job(Backend::Sqlite, self.tables.jobs(), &info, job_id, now);
        Ok(self.execute(&stmt).await? > 0)
    }

    async fn insert_job(&self, url: &str, user_id: Option<&str>, now: DateTime<Utc>) -> Result<Uuid, StorageError> {
        let info = self.jobs_columns().await?;
        let id = Uuid::new_v4();
        let stmt = sql::insert_job(Backend::Sqlite, self.tables.jobs(), &info, id, url, user_id, now)
            .ok_or_else(|| StorageError::MissingTable(self.tables.jobs().to_string()))?;
        self.execute(&stmt).await?;
        Ok(id)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StorageError> {
        let info = self.jobs_columns().await?;
        let stmt = sql::select_job(Backend::Sqlite, self.tables.jobs(), &info, job_id);
        let row = bind_all(sqlx::query(&stmt.text), &stmt.binds)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(JobRow::from_row(&row)?.into_job(self.tables.jobs())?)),
            None => Ok(None),
        }
    }

    async fn status_counts(&self) -> Result<BTreeMap<String, u64>, StorageError> {
        let rows = sqlx::query(&sql::status_counts(self.tables.jobs()))
            .fetch_all(&self.pool)
            .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let status: Option<String> = row.try_get("status")?;
            let total: i64 = row.try_get("total")?;
            let key = normalize(status.as_deref()).as_str().to_string();
            *counts.entry(key).or_insert(0) += u64::try_from(total).unwrap_or(0);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use listq_core::{ExtractedRecord, JobStatus};
    use tempfile::TempDir;

    use super::*;

    const JOBS_DDL: &str = "CREATE TABLE jobs (
        id TEXT PRIMARY KEY,
        url TEXT NOT NULL,
        user_id TEXT,
        status TEXT,
        retry_after TEXT,
        warnings TEXT,
        attempts INTEGER,
        updated_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    )";

    const RESULTS_DDL: &str = "CREATE TABLE listing_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        url TEXT,
        title TEXT,
        address TEXT,
        rating REAL,
        services TEXT
    )";

    async fn store_with(ddl: &[&str]) -> (TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("listq.db").display());
        let store = SqliteJobStore::connect(&url, TableNames::default()).await.unwrap();
        for statement in ddl {
            sqlx::query(statement).execute(store.pool()).await.unwrap();
        }
        (dir, store)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn completed_write(job: &Job) -> TerminalWrite {
        TerminalWrite {
            job_id: job.id,
            url: job.url.clone(),
            user_id: job.user_id.clone(),
            status: JobStatus::Completed,
            attempt: job.attempts,
            retry_after: None,
            warnings: Some("missing_phone; attempt=1".into()),
            error_message: None,
            record: Some(ExtractedRecord {
                title: Some("Zerno".into()),
                address: Some("Lenina 1".into()),
                rating: Some(4.7),
                ..Default::default()
            }),
            captured_at: Some(t0()),
            finished_at: t0(),
        }
    }

    #[tokio::test]
    async fn introspection_lists_columns_in_order() {
        let (_dir, store) = store_with(&[JOBS_DDL]).await;
        let info = store.columns("jobs").await.unwrap();
        assert_eq!(
            info.names(),
            vec![
                "id",
                "url",
                "user_id",
                "status",
                "retry_after",
                "warnings",
                "attempts",
                "updated_at",
                "created_at"
            ]
        );
        assert_eq!(info.get("attempts").unwrap().declared_type, "INTEGER");
        assert!(store.columns("nope").await.unwrap().is_empty());
        assert!(store.has_column("jobs", "retry_after").await.unwrap());
    }

    #[tokio::test]
    async fn claim_takes_oldest_pending_and_counts_attempts() {
        let (_dir, store) = store_with(&[JOBS_DDL]).await;
        let first = store.insert_job("https://example.test/org/a/1000001/", None, t0()).await.unwrap();
        store
            .insert_job("https://example.test/org/b/1000002/", None, t0() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        let job = store.claim_next(t0()).await.unwrap().unwrap();
        assert_eq!(job.id, first);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn legacy_blank_status_is_claimable() {
        let (_dir, store) = store_with(&[JOBS_DDL]).await;
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO jobs (id, url, status, updated_at, created_at) VALUES (?, ?, NULL, ?, ?)")
            .bind(id.to_string())
            .bind("https://example.test/org/c/1000003/")
            .bind(t0())
            .bind(t0())
            .execute(store.pool())
            .await
            .unwrap();
        let job = store.claim_next(t0()).await.unwrap().unwrap();
        assert_eq!(job.id, id);
    }

    #[tokio::test]
    async fn concurrent_claims_hand_out_one_job_once() {
        let (_dir, store) = store_with(&[JOBS_DDL]).await;
        store.insert_job("https://example.test/org/d/1000004/", None, t0()).await.unwrap();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.claim_next(t0()).await }));
        }
        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn finish_writes_job_and_result_together() {
        let (_dir, store) = store_with(&[JOBS_DDL, RESULTS_DDL]).await;
        store.insert_job("https://example.test/org/e/1000005/", Some("u-1"), t0()).await.unwrap();
        let job = store.claim_next(t0()).await.unwrap().unwrap();

        let report = store.finish(&completed_write(&job)).await.unwrap();
        assert!(report.result_row_written);

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        let (title, services): (String, String) =
            sqlx::query_as("SELECT title, services FROM listing_results WHERE job_id = ?")
                .bind(job.id.to_string())
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(title, "Zerno");
        assert_eq!(services, "[]");
    }

    #[tokio::test]
    async fn finish_without_results_table_still_completes_job() {
        let (_dir, store) = store_with(&[JOBS_DDL]).await;
        store.insert_job("https://example.test/org/f/1000006/", None, t0()).await.unwrap();
        let job = store.claim_next(t0()).await.unwrap().unwrap();
        let report = store.finish(&completed_write(&job)).await.unwrap();
        assert!(!report.result_row_written);
    }

    #[tokio::test]
    async fn second_finish_reports_lost_claim() {
        let (_dir, store) = store_with(&[JOBS_DDL, RESULTS_DDL]).await;
        store.insert_job("https://example.test/org/g/1000007/", None, t0()).await.unwrap();
        let job = store.claim_next(t0()).await.unwrap().unwrap();
        store.finish(&completed_write(&job)).await.unwrap();
        assert!(matches!(
            store.finish(&completed_write(&job)).await,
            Err(StorageError::LostClaim(id)) if id == job.id
        ));
        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM listing_results")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn finish_rejects_non_terminal_status() {
        let (_dir, store) = store_with(&[JOBS_DDL, RESULTS_DDL]).await;
        store.insert_job("https://example.test/org/o/1000015/", None, t0()).await.unwrap();
        let job = store.claim_next(t0()).await.unwrap().unwrap();
        for status in [JobStatus::Pending, JobStatus::Processing] {
            let write = TerminalWrite {
                status,
                ..completed_write(&job)
            };
            assert!(matches!(
                store.finish(&write).await,
                Err(StorageError::InvalidTransition { job_id, status: s }) if job_id == job.id && s == status
            ));
        }
        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        store.finish(&completed_write(&job)).await.unwrap();
    }

    #[tokio::test]
    async fn stale_processing_jobs_return_to_pending() {
        let (_dir, store) = store_with(&[JOBS_DDL]).await;
        store.insert_job("https://example.test/org/h/1000008/", None, t0()).await.unwrap();
        let job = store.claim_next(t0()).await.unwrap().unwrap();

        let later = t0() + chrono::Duration::minutes(5);
        assert_eq!(store.reset_stale(later, Duration::from_secs(600)).await.unwrap(), 0);

        let much_later = t0() + chrono::Duration::minutes(11);
        assert_eq!(store.reset_stale(much_later, Duration::from_secs(600)).await.unwrap(), 1);
        let again = store.claim_next(much_later).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn abandoned_claims_count_without_attempts_column() {
        let (_dir, store) = store_with(&[
            "CREATE TABLE jobs (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                status TEXT,
                warnings TEXT,
                updated_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        ])
        .await;
        let id = store.insert_job("https://example.test/org/n/1000014/", None, t0()).await.unwrap();

        let mut seen = Vec::new();
        let mut at = t0();
        for _ in 0..3 {
            let job = store.claim_next(at).await.unwrap().unwrap();
            seen.push(job.attempts);
            at += chrono::Duration::minutes(11);
            assert_eq!(store.reset_stale(at, Duration::from_secs(600)).await.unwrap(), 1);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        let stored = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.warnings.as_deref(), Some("attempt=3"));
        assert_eq!(stored.attempts, 3);
    }

    #[tokio::test]
    async fn retry_after_gates_claims_and_requeue() {
        let (_dir, store) = store_with(&[JOBS_DDL]).await;
        store.insert_job("https://example.test/org/i/1000009/", None, t0()).await.unwrap();
        let job = store.claim_next(t0()).await.unwrap().unwrap();
        let retry_at = t0() + chrono::Duration::minutes(2);
        store
            .finish(&TerminalWrite {
                status: JobStatus::Error,
                retry_after: Some(retry_at),
                record: None,
                warnings: Some("timeout; attempt=1".into()),
                ..completed_write(&job)
            })
            .await
            .unwrap();

        assert_eq!(store.requeue_due(t0() + chrono::Duration::minutes(1), true).await.unwrap(), 0);
        assert_eq!(store.requeue_due(retry_at, true).await.unwrap(), 1);
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn operator_requeue_clears_bookkeeping() {
        let (_dir, store) = store_with(&[JOBS_DDL]).await;
        store.insert_job("https://example.test/org/j/1000010/", None, t0()).await.unwrap();
        let job = store.claim_next(t0()).await.unwrap().unwrap();
        store
            .finish(&TerminalWrite {
                status: JobStatus::Captcha,
                retry_after: Some(t0() + chrono::Duration::hours(6)),
                record: None,
                warnings: Some("captcha_challenge; attempt=1".into()),
                ..completed_write(&job)
            })
            .await
            .unwrap();

        assert!(store.requeue_job(job.id, t0()).await.unwrap());
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_after, None);
        assert_eq!(job.warnings, None);
        assert_eq!(job.attempts, 0);
        assert!(!store.requeue_job(job.id, t0()).await.unwrap());
    }

    #[tokio::test]
    async fn counts_fold_legacy_tokens() {
        let (_dir, store) = store_with(&[JOBS_DDL]).await;
        for (status, n) in [("done", 1), ("completed", 2), ("Queued", 3)] {
            sqlx::query("INSERT INTO jobs (id, url, status, updated_at, created_at) VALUES (?, 'u', ?, ?, ?)")
                .bind(format!("{n}"))
                .bind(status)
                .bind(t0())
                .bind(t0())
                .execute(store.pool())
                .await
                .unwrap();
        }
        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.get("completed"), Some(&2));
        assert_eq!(counts.get("Queued"), Some(&1));
    }

    #[tokio::test]
    async fn missing_job_table_is_reported() {
        let (_dir, store) = store_with(&[]).await;
        assert!(matches!(
            store.claim_next(t0()).await,
            Err(StorageError::MissingTable(table)) if table == "jobs"
        ));
    }
}
