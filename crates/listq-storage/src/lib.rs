//! Job table storage port with SQLite and PostgreSQL backends, schema
//! introspection, and the raw-snapshot artifact store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listq_core::{ExtractedRecord, Job, JobStatus};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

mod artifacts;
mod postgres;
mod sql;
mod sqlite;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use postgres::PostgresJobStore;
pub use sqlite::SqliteJobStore;

pub const CRATE_NAME: &str = "listq-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("unsupported database url: {0}")]
    UnsupportedUrl(String),
    #[error("invalid sql identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("undecodable row in {table}: {reason}")]
    InvalidRow { table: String, reason: String },
    #[error("job {0} is no longer in processing; terminal write discarded")]
    LostClaim(Uuid),
    #[error("job {job_id} cannot move from processing to {status}")]
    InvalidTransition { job_id: Uuid, status: JobStatus },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
}

/// Ordered column list of one table. Empty when the table does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnsInfo {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

impl ColumnsInfo {
    pub fn empty(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns
            .iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }
}

/// Names of the tables the core reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    jobs: String,
    results: String,
}

impl TableNames {
    pub fn new(jobs: &str, results: &str) -> Result<Self, StorageError> {
        validate_identifier(jobs)?;
        validate_identifier(results)?;
        Ok(Self {
            jobs: jobs.to_string(),
            results: results.to_string(),
        })
    }

    pub fn jobs(&self) -> &str {
        &self.jobs
    }

    pub fn results(&self) -> &str {
        &self.results
    }
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            jobs: "jobs".to_string(),
            results: "listing_results".to_string(),
        }
    }
}

/// Table names are spliced into SQL text, so only plain identifiers pass.
pub fn validate_identifier(name: &str) -> Result<(), StorageError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid && name.len() <= 63 {
        Ok(())
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

/// Everything the worker persists when an attempt ends.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalWrite {
    pub job_id: Uuid,
    pub url: String,
    pub user_id: Option<String>,
    pub status: JobStatus,
    pub attempt: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub warnings: Option<String>,
    pub error_message: Option<String>,
    /// Written to the results table only when `status` is completed.
    pub record: Option<ExtractedRecord>,
    pub captured_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl TerminalWrite {
    /// Rejects statuses a claimed job cannot end in.
    pub(crate) fn check_transition(&self) -> Result<(), StorageError> {
        if self.status != JobStatus::Pending && JobStatus::Processing.can_transition_to(self.status) {
            Ok(())
        } else {
            Err(StorageError::InvalidTransition {
                job_id: self.job_id,
                status: self.status,
            })
        }
    }

    pub(crate) fn result_record(&self) -> Option<&ExtractedRecord> {
        if self.status == JobStatus::Completed {
            self.record.as_ref()
        } else {
            None
        }
    }
}

/// Result of a terminal write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishReport {
    pub result_row_written: bool,
}

/// Storage port the worker depends on. One implementation per backend.
#[async_trait]
pub trait JobStore: Send + Sync {
    fn backend(&self) -> Backend;

    fn tables(&self) -> &TableNames;

    /// Column list for `table`, freshly read from the catalog on every call.
    async fn columns(&self, table: &str) -> Result<ColumnsInfo, StorageError>;

    async fn has_column(&self, table: &str, name: &str) -> Result<bool, StorageError> {
        Ok(self.columns(table).await?.has(name))
    }

    /// Atomically move one eligible pending job to processing.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StorageError>;

    /// Persist the outcome of a claimed job in one transaction.
    async fn finish(&self, write: &TerminalWrite) -> Result<FinishReport, StorageError>;

    /// Hand a claimed job back to pending without recording an outcome.
    async fn release(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Reset jobs stuck in processing since before `now - stale_after`.
    async fn reset_stale(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<u64, StorageError>;

    /// Move failed jobs whose `retry_after` has passed back to pending.
    async fn requeue_due(
        &self,
        now: DateTime<Utc>,
        include_captcha: bool,
    ) -> Result<u64, StorageError>;

    /// Operator requeue of one failed job, clearing its retry bookkeeping.
    async fn requeue_job(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<bool, StorageError>;

    async fn insert_job(
        &self,
        url: &str,
        user_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Uuid, StorageError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StorageError>;

    /// Totals keyed by normalized status; unrecognized tokens keep their raw spelling.
    async fn status_counts(&self) -> Result<BTreeMap<String, u64>, StorageError>;
}

/// Database location parsed from a connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    Sqlite(String),
    Postgres(String),
}

impl StoreUrl {
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let raw = raw.trim();
        if raw.starts_with("sqlite:") {
            return Ok(Self::Sqlite(raw.to_string()));
        }
        if raw.starts_with("postgres://") || raw.starts_with("postgresql://") {
            return Ok(Self::Postgres(raw.to_string()));
        }
        Err(StorageError::UnsupportedUrl(raw.to_string()))
    }

    pub fn backend(&self) -> Backend {
        match self {
            StoreUrl::Sqlite(_) => Backend::Sqlite,
            StoreUrl::Postgres(_) => Backend::Postgres,
        }
    }
}

pub async fn connect(database_url: &str, tables: TableNames) -> Result<Arc<dyn JobStore>, StorageError> {
    match StoreUrl::parse(database_url)? {
        StoreUrl::Sqlite(url) => Ok(Arc::new(SqliteJobStore::connect(&url, tables).await?)),
        StoreUrl::Postgres(url) => Ok(Arc::new(PostgresJobStore::connect(&url, tables).await?)),
    }
}

pub(crate) fn stale_cutoff(now: DateTime<Utc>, stale_after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn services_json(record: &ExtractedRecord) -> String {
    let items = record
        .services
        .iter()
        .map(|item| serde_json::json!({ "name": item.name, "price": item.price }))
        .collect::<Vec<JsonValue>>();
    JsonValue::Array(items).to_string()
}
