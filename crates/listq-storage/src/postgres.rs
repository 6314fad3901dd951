use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listq_core::{normalize, Job};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{FromRow, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use crate::sql::{self, JobColumns, JobRow, SqlValue, Statement};
use crate::{
    stale_cutoff, Backend, ColumnInfo, ColumnsInfo, FinishReport, JobStore, StorageError,
    TableNames, TerminalWrite,
};

/// Job store over PostgreSQL. Assumes `id` is a uuid and timestamps are
/// `timestamptz`; other column types are cast on write.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    tables: TableNames,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, tables: TableNames) -> Self {
        Self { pool, tables }
    }

    pub async fn connect(url: &str, tables: TableNames) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        Ok(Self::new(pool, tables))
    }

    pub fn pool(&self) -> &PgPool {
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
}

fn bind_all<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    binds: &[SqlValue],
) -> Query<'q, Postgres, PgArguments> {
    for value in binds {
        query = match value.clone() {
            SqlValue::Id(id) => query.bind(id),
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
impl JobStore for PostgresJobStore {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    fn tables(&self) -> &TableNames {
        &self.tables
    }

    async fn columns(&self, table: &str) -> Result<ColumnsInfo, StorageError> {
        let rows = sqlx::query(sql::introspect(Backend::Postgres))
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
        let cols = JobColumns::from_info(&info);
        let jobs = self.tables.jobs();
        let stmt = sql::claim(Backend::Postgres, jobs, &info, now);

        let mut tx = self.pool.begin().await?;
        let row = bind_all(sqlx::query(&stmt.text), &stmt.binds)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let job = JobRow::from_row(&row)?.into_claimed_job(jobs, &cols)?;
        if let Some(mark) = sql::mark_claim_attempt(Backend::Postgres, jobs, &info, &job) {
            bind_all(sqlx::query(&mark.text), &mark.binds)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
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
        let update = sql::finish_update(Backend::Postgres, self.tables.jobs(), &jobs, write);
        let insert = sql::insert_result(Backend::Postgres, self.tables.results(), &results, write);

        let mut tx = self.pool.begin().await?;
        let affected = bind_all(sqlx::query(&update.text), &update.binds)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if affected == 0 {
            tx.rollback().await?;
            return Err(StorageError::LostClaim(write.job_id));
        }
        if let Some(insert) = &insert {
            bind_all(sqlx::query(&insert.text), &insert.binds)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(FinishReport {
            result_row_written: insert.is_some(),
        })
    }

    async fn release(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let info = self.jobs_columns().await?;
        let stmt = sql::release(Backend::Postgres, self.tables.jobs(), &info, job_id, now);
        Ok(self.execute(&stmt).await? > 0)
    }

    async fn reset_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> Result<u64, StorageError> {
        let info = self.jobs_columns().await?;
        let cutoff = stale_cutoff(now, stale_after);
        let stmt = sql::reset_stale(Backend::Postgres, self.tables.jobs(), &info, now, cutoff);
        self.execute(&stmt).await
    }

    async fn requeue_due(&self, now: DateTime<Utc>, include_captcha: bool) -> Result<u64, StorageError> {
        let info = self.jobs_columns().await?;
        match sql::requeue_due(Backend::Postgres, self.tables.jobs(), &info, now, include_captcha) {
            Some(stmt) => self.execute(&stmt).await,
            None => Ok(0),
        }
    }

    async fn requeue_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let info = self.jobs_columns().await?;
        let stmt = sql::requeue_job(Backend::Postgres, self.tables.jobs(), &info, job_id, now);
        Ok(self.execute(&stmt).await? > 0)
    }

    async fn insert_job(&self, url: &str, user_id: Option<&str>, now: DateTime<Utc>) -> Result<Uuid, StorageError> {
        let info = self.jobs_columns().await?;
        let id = Uuid::new_v4();
        let stmt = sql::insert_job(Backend::Postgres, self.tables.jobs(), &info, id, url, user_id, now)
            .ok_or_else(|| StorageError::MissingTable(self.tables.jobs().to_string()))?;
        self.execute(&stmt).await?;
        Ok(id)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StorageError> {
        let info = self.jobs_columns().await?;
        let stmt = sql::select_job(Backend::Postgres, self.tables.jobs(), &info, job_id);
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
