//! SQL text shared by both backends. Statements only mention columns the
//! caller found through introspection.

use chrono::{DateTime, Utc};
use listq_core::{attempt_from_warnings, normalize, with_attempt_token, Job, JobStatus};
use uuid::Uuid;

use crate::{services_json, Backend, ColumnsInfo, StorageError, TerminalWrite};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlValue {
    Id(Uuid),
    Text(String),
    OptText(Option<String>),
    Int(i64),
    OptInt(Option<i64>),
    OptFloat(Option<f64>),
    Timestamp(DateTime<Utc>),
    OptTimestamp(Option<DateTime<Utc>>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub text: String,
    pub binds: Vec<SqlValue>,
}

/// Matches pending rows, including legacy blank or null statuses.
const PENDING_PREDICATE: &str =
    "COALESCE(LOWER(TRIM(CAST(status AS TEXT))), '') IN ('pending', '')";

const PROCESSING_PREDICATE: &str = "CAST(status AS TEXT) = 'processing'";

/// Optional job table columns the core adapts to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct JobColumns {
    pub user_id: bool,
    pub retry_after: bool,
    pub warnings: bool,
    pub attempts: bool,
    pub error_message: bool,
}

impl JobColumns {
    pub fn from_info(info: &ColumnsInfo) -> Self {
        Self {
            user_id: info.has("user_id"),
            retry_after: info.has("retry_after"),
            warnings: info.has("warnings"),
            attempts: info.has("attempts"),
            error_message: info.has("error_message"),
        }
    }
}

struct Builder<'a> {
    backend: Backend,
    info: &'a ColumnsInfo,
    binds: Vec<SqlValue>,
}

impl<'a> Builder<'a> {
    fn new(backend: Backend, info: &'a ColumnsInfo) -> Self {
        Self {
            backend,
            info,
            binds: Vec::new(),
        }
    }

    fn bind(&mut self, value: SqlValue) -> String {
        self.binds.push(value);
        match self.backend {
            Backend::Sqlite => "?".to_string(),
            Backend::Postgres => format!("${}", self.binds.len()),
        }
    }

    /// Placeholder for a value compared with or written into `column`.
    /// PostgreSQL casts it to the declared column type.
    fn bind_for(&mut self, column: &str, value: SqlValue) -> String {
        let placeholder = self.bind(value);
        match (self.backend, self.info.get(column)) {
            (Backend::Postgres, Some(col)) if is_plain_type_name(&col.declared_type) => {
                format!("CAST({placeholder} AS {})", col.declared_type)
            }
            _ => placeholder,
        }
    }

    fn timestamp_cmp(&mut self, column: &str, op: &str, at: DateTime<Utc>) -> String {
        let placeholder = self.bind(SqlValue::Timestamp(at));
        match self.backend {
            Backend::Sqlite => format!("julianday({column}) {op} julianday({placeholder})"),
            Backend::Postgres => format!("{column} {op} {placeholder}"),
        }
    }

    fn id_eq(&mut self, id: Uuid) -> String {
        format!("id = {}", self.bind_for("id", SqlValue::Id(id)))
    }

    fn build(self, text: String) -> Statement {
        Statement {
            text,
            binds: self.binds,
        }
    }
}

fn is_plain_type_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn introspect(backend: Backend) -> &'static str {
    match backend {
        Backend::Sqlite => "SELECT name, type FROM pragma_table_info(?) ORDER BY cid",
        Backend::Postgres => {
            "SELECT CAST(column_name AS TEXT) AS name, CAST(udt_name AS TEXT) AS type \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 \
             ORDER BY ordinal_position"
        }
    }
}

fn job_select_list(cols: &JobColumns) -> String {
    let mut parts = vec!["CAST(id AS TEXT) AS id", "url"];
    if cols.user_id {
        parts.push("CAST(user_id AS TEXT) AS user_id");
    }
    parts.push("CAST(status AS TEXT) AS status");
    if cols.retry_after {
        parts.push("retry_after");
    }
    if cols.warnings {
        parts.push("warnings");
    }
    if cols.attempts {
        parts.push("CAST(attempts AS BIGINT) AS attempts");
    }
    parts.push("updated_at");
    parts.push("created_at");
    parts.join(", ")
}

/// Single-statement claim of the oldest eligible pending job.
pub(crate) fn claim(backend: Backend, table: &str, info: &ColumnsInfo, now: DateTime<Utc>) -> Statement {
    let cols = JobColumns::from_info(info);
    let mut b = Builder::new(backend, info);

    let mut set = vec![
        format!(
            "status = {}",
            b.bind_for("status", SqlValue::Text(JobStatus::Processing.as_str().to_string()))
        ),
        format!("updated_at = {}", b.bind_for("updated_at", SqlValue::Timestamp(now))),
    ];
    if cols.attempts {
        set.push("attempts = COALESCE(attempts, 0) + 1".to_string());
    }

    let mut eligible = vec![PENDING_PREDICATE.to_string()];
    if cols.retry_after {
        let due = b.timestamp_cmp("retry_after", "<=", now);
        eligible.push(format!("(retry_after IS NULL OR {due})"));
    }
    let lock = match backend {
        Backend::Sqlite => "",
        Backend::Postgres => " FOR UPDATE SKIP LOCKED",
    };

    let text = format!(
        "UPDATE {table} SET {set} WHERE id = (SELECT id FROM {table} WHERE {eligible} \
         ORDER BY created_at, id LIMIT 1{lock}) AND {PENDING_PREDICATE} RETURNING {select}",
        set = set.join(", "),
        eligible = eligible.join(" AND "),
        select = job_select_list(&cols),
    );
    b.build(text)
}

/// Persists the claim's `attempt=N` token for tables that have a warnings
/// column but no attempts column, so abandoned claims still count.
pub(crate) fn mark_claim_attempt(
    backend: Backend,
    table: &str,
    info: &ColumnsInfo,
    job: &Job,
) -> Option<Statement> {
    let cols = JobColumns::from_info(info);
    if cols.attempts || !cols.warnings {
        return None;
    }
    let mut b = Builder::new(backend, info);
    let warnings = b.bind_for("warnings", SqlValue::OptText(job.warnings.clone()));
    let predicate = b.id_eq(job.id);
    let text = format!("UPDATE {table} SET warnings = {warnings} WHERE {predicate} AND {PROCESSING_PREDICATE}");
    Some(b.build(text))
}

pub(crate) fn select_job(backend: Backend, table: &str, info: &ColumnsInfo, id: Uuid) -> Statement {
    let cols = JobColumns::from_info(info);
    let mut b = Builder::new(backend, info);
    let predicate = b.id_eq(id);
    let text = format!("SELECT {} FROM {table} WHERE {predicate}", job_select_list(&cols));
    b.build(text)
}

/// Conditional terminal update; zero affected rows means the claim was lost.
pub(crate) fn finish_update(
    backend: Backend,
    table: &str,
    info: &ColumnsInfo,
    write: &TerminalWrite,
) -> Statement {
    let cols = JobColumns::from_info(info);
    let mut b = Builder::new(backend, info);

    let mut set = vec![
        format!(
            "status = {}",
            b.bind_for("status", SqlValue::Text(write.status.as_str().to_string()))
        ),
        format!(
            "updated_at = {}",
            b.bind_for("updated_at", SqlValue::Timestamp(write.finished_at))
        ),
    ];
    if cols.retry_after {
        set.push(format!(
            "retry_after = {}",
            b.bind_for("retry_after", SqlValue::OptTimestamp(write.retry_after))
        ));
    }
    if cols.warnings {
        set.push(format!(
            "warnings = {}",
            b.bind_for("warnings", SqlValue::OptText(write.warnings.clone()))
        ));
    }
    if cols.error_message {
        set.push(format!(
            "error_message = {}",
            b.bind_for("error_message", SqlValue::OptText(write.error_message.clone()))
        ));
    }
    if cols.attempts {
        set.push(format!(
            "attempts = {}",
            b.bind_for("attempts", SqlValue::Int(i64::from(write.attempt)))
        ));
    }
    let predicate = b.id_eq(write.job_id);

    let text = format!(
        "UPDATE {table} SET {} WHERE {predicate} AND {PROCESSING_PREDICATE}",
        set.join(", ")
    );
    b.build(text)
}

/// Insert into the results table, restricted to the columns it has.
/// `None` when no candidate column exists (or the table is missing).
pub(crate) fn insert_result(
    backend: Backend,
    table: &str,
    info: &ColumnsInfo,
    write: &TerminalWrite,
) -> Option<Statement> {
    let record = write.result_record()?;
    let candidates = vec![
        ("job_id", SqlValue::Id(write.job_id)),
        ("user_id", SqlValue::OptText(write.user_id.clone())),
        ("url", SqlValue::Text(write.url.clone())),
        ("title", SqlValue::OptText(record.title.clone())),
        ("address", SqlValue::OptText(record.address.clone())),
        ("phone", SqlValue::OptText(record.phone.clone())),
        ("site", SqlValue::OptText(record.site.clone())),
        ("rating", SqlValue::OptFloat(record.rating)),
        ("review_count", SqlValue::OptInt(record.review_count.map(i64::from))),
        ("services", SqlValue::Text(services_json(record))),
        ("source_id", SqlValue::OptText(record.source_id.clone())),
        (
            "captured_at",
            SqlValue::Timestamp(write.captured_at.unwrap_or(write.finished_at)),
        ),
        ("created_at", SqlValue::Timestamp(write.finished_at)),
    ];
    insert_row(backend, table, info, candidates)
}

pub(crate) fn insert_job(
    backend: Backend,
    table: &str,
    info: &ColumnsInfo,
    id: Uuid,
    url: &str,
    user_id: Option<&str>,
    now: DateTime<Utc>,
) -> Option<Statement> {
    let candidates = vec![
        ("id", SqlValue::Id(id)),
        ("url", SqlValue::Text(url.to_string())),
        ("user_id", SqlValue::OptText(user_id.map(str::to_string))),
        ("status", SqlValue::Text(JobStatus::Pending.as_str().to_string())),
        ("attempts", SqlValue::Int(0)),
        ("created_at", SqlValue::Timestamp(now)),
        ("updated_at", SqlValue::Timestamp(now)),
    ];
    insert_row(backend, table, info, candidates)
}

fn insert_row(
    backend: Backend,
    table: &str,
    info: &ColumnsInfo,
    candidates: Vec<(&'static str, SqlValue)>,
) -> Option<Statement> {
    let mut b = Builder::new(backend, info);
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for (column, value) in candidates {
        if let Some(col) = info.get(column) {
            columns.push(col.name.clone());
            values.push(b.bind_for(column, value));
        }
    }
    if columns.is_empty() {
        return None;
    }
    let text = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        columns.join(", "),
        values.join(", ")
    );
    Some(b.build(text))
}

pub(crate) fn release(backend: Backend, table: &str, info: &ColumnsInfo, id: Uuid, now: DateTime<Utc>) -> Statement {
    let mut b = Builder::new(backend, info);
    let status = b.bind_for("status", SqlValue::Text(JobStatus::Pending.as_str().to_string()));
    let updated = b.bind_for("updated_at", SqlValue::Timestamp(now));
    let predicate = b.id_eq(id);
    let text = format!(
        "UPDATE {table} SET status = {status}, updated_at = {updated} \
         WHERE {predicate} AND {PROCESSING_PREDICATE}"
    );
    b.build(text)
}

pub(crate) fn reset_stale(
    backend: Backend,
    table: &str,
    info: &ColumnsInfo,
    now: DateTime<Utc>,
    cutoff: DateTime<Utc>,
) -> Statement {
    let cols = JobColumns::from_info(info);
    let mut b = Builder::new(backend, info);
    let mut set = vec![
        format!(
            "status = {}",
            b.bind_for("status", SqlValue::Text(JobStatus::Pending.as_str().to_string()))
        ),
        format!("updated_at = {}", b.bind_for("updated_at", SqlValue::Timestamp(now))),
    ];
    if cols.retry_after {
        set.push("retry_after = NULL".to_string());
    }
    let stale = b.timestamp_cmp("updated_at", "<", cutoff);
    let text = format!(
        "UPDATE {table} SET {} WHERE {PROCESSING_PREDICATE} AND {stale}",
        set.join(", ")
    );
    b.build(text)
}

/// `None` when the job table has no `retry_after` column to schedule from.
pub(crate) fn requeue_due(
    backend: Backend,
    table: &str,
    info: &ColumnsInfo,
    now: DateTime<Utc>,
    include_captcha: bool,
) -> Option<Statement> {
    if !info.has("retry_after") {
        return None;
    }
    let mut b = Builder::new(backend, info);
    let status = b.bind_for("status", SqlValue::Text(JobStatus::Pending.as_str().to_string()));
    let updated = b.bind_for("updated_at", SqlValue::Timestamp(now));
    let due = b.timestamp_cmp("retry_after", "<=", now);
    let failed = if include_captcha {
        "('error', 'captcha')"
    } else {
        "('error')"
    };
    let text = format!(
        "UPDATE {table} SET status = {status}, updated_at = {updated} \
         WHERE CAST(status AS TEXT) IN {failed} AND retry_after IS NOT NULL AND {due}"
    );
    Some(b.build(text))
}

pub(crate) fn requeue_job(
    backend: Backend,
    table: &str,
    info: &ColumnsInfo,
    id: Uuid,
    now: DateTime<Utc>,
) -> Statement {
    let cols = JobColumns::from_info(info);
    let mut b = Builder::new(backend, info);
    let mut set = vec![
        format!(
            "status = {}",
            b.bind_for("status", SqlValue::Text(JobStatus::Pending.as_str().to_string()))
        ),
        format!("updated_at = {}", b.bind_for("updated_at", SqlValue::Timestamp(now))),
    ];
    if cols.retry_after {
        set.push("retry_after = NULL".to_string());
    }
    if cols.attempts {
        set.push("attempts = 0".to_string());
    }
    if cols.warnings {
        set.push("warnings = NULL".to_string());
    }
    if cols.error_message {
        set.push("error_message = NULL".to_string());
    }
    let predicate = b.id_eq(id);
    let text = format!(
        "UPDATE {table} SET {} WHERE {predicate} AND CAST(status AS TEXT) IN ('error', 'captcha')",
        set.join(", ")
    );
    b.build(text)
}

pub(crate) fn status_counts(table: &str) -> String {
    format!(
        "SELECT CAST(status AS TEXT) AS status, COUNT(*) AS total FROM {table} \
         GROUP BY CAST(status AS TEXT)"
    )
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub url: String,
    #[sqlx(default)]
    pub user_id: Option<String>,
    pub status: Option<String>,
    #[sqlx(default)]
    pub retry_after: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub warnings: Option<String>,
    #[sqlx(default)]
    pub attempts: Option<i64>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl JobRow {
    pub fn into_job(self, table: &str) -> Result<Job, StorageError> {
        let id = Uuid::parse_str(self.id.trim()).map_err(|err| StorageError::InvalidRow {
            table: table.to_string(),
            reason: format!("job id {:?}: {err}", self.id),
        })?;
        let attempts = match self.attempts {
            Some(n) => u32::try_from(n).unwrap_or(0),
            None => self
                .warnings
                .as_deref()
                .and_then(attempt_from_warnings)
                .unwrap_or(0),
        };
        Ok(Job {
            id,
            url: self.url,
            user_id: self.user_id,
            status: normalize(self.status.as_deref()),
            retry_after: self.retry_after,
            warnings: self.warnings,
            attempts,
            updated_at: self.updated_at,
            created_at: self.created_at,
        })
    }

    /// Like [`JobRow::into_job`], counting the claim that just happened when
    /// the table has no attempts column to increment.
    pub fn into_claimed_job(self, table: &str, cols: &JobColumns) -> Result<Job, StorageError> {
        let mut job = self.into_job(table)?;
        if !cols.attempts {
            job.attempts += 1;
            if cols.warnings {
                job.warnings = Some(with_attempt_token(job.warnings.as_deref(), job.attempts));
            }
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use listq_core::ExtractedRecord;

    use super::*;
    use crate::ColumnInfo;

    fn info(table: &str, columns: &[(&str, &str)]) -> ColumnsInfo {
        ColumnsInfo {
            table: table.to_string(),
            columns: columns
                .iter()
                .map(|(name, ty)| ColumnInfo {
                    name: name.to_string(),
                    declared_type: ty.to_string(),
                })
                .collect(),
        }
    }

    fn minimal_jobs() -> ColumnsInfo {
        info(
            "jobs",
            &[
                ("id", "TEXT"),
                ("url", "TEXT"),
                ("user_id", "TEXT"),
                ("status", "TEXT"),
                ("updated_at", "TEXT"),
                ("created_at", "TEXT"),
            ],
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn claim_without_optional_columns_skips_retry_gate() {
        let stmt = claim(Backend::Sqlite, "jobs", &minimal_jobs(), now());
        assert!(!stmt.text.contains("retry_after"));
        assert!(!stmt.text.contains("attempts"));
        assert!(!stmt.text.contains("SKIP LOCKED"));
        assert_eq!(stmt.binds.len(), 2);
    }

    #[test]
    fn postgres_claim_numbers_placeholders_and_skips_locked_rows() {
        let mut jobs = minimal_jobs();
        jobs.columns.push(ColumnInfo {
            name: "retry_after".into(),
            declared_type: "timestamptz".into(),
        });
        jobs.columns.push(ColumnInfo {
            name: "attempts".into(),
            declared_type: "int4".into(),
        });
        let stmt = claim(Backend::Postgres, "jobs", &jobs, now());
        assert!(stmt.text.contains("FOR UPDATE SKIP LOCKED"));
        assert!(stmt.text.contains("retry_after <= $3"));
        assert!(stmt.text.contains("attempts = COALESCE(attempts, 0) + 1"));
        assert!(stmt.text.contains("CAST(attempts AS BIGINT) AS attempts"));
        assert_eq!(stmt.binds.len(), 3);
    }

    #[test]
    fn result_insert_only_names_existing_columns() {
        let results = info("listing_results", &[("job_id", "TEXT"), ("title", "TEXT")]);
        let write = TerminalWrite {
            job_id: Uuid::nil(),
            url: "https://example.test/org/1234567/".into(),
            user_id: None,
            status: JobStatus::Completed,
            attempt: 1,
            retry_after: None,
            warnings: None,
            error_message: None,
            record: Some(ExtractedRecord {
                title: Some("Zerno".into()),
                ..Default::default()
            }),
            captured_at: None,
            finished_at: now(),
        };
        let stmt = insert_result(Backend::Sqlite, "listing_results", &results, &write).unwrap();
        assert_eq!(stmt.text, "INSERT INTO listing_results (job_id, title) VALUES (?, ?)");
        assert_eq!(stmt.binds[1], SqlValue::OptText(Some("Zerno".into())));

        let missing = ColumnsInfo::empty("listing_results");
        assert!(insert_result(Backend::Sqlite, "listing_results", &missing, &write).is_none());
    }

    #[test]
    fn failed_writes_never_insert_results() {
        let results = info("listing_results", &[("job_id", "TEXT")]);
        let write = TerminalWrite {
            job_id: Uuid::nil(),
            url: "u".into(),
            user_id: None,
            status: JobStatus::Error,
            attempt: 2,
            retry_after: Some(now()),
            warnings: Some("timeout".into()),
            error_message: None,
            record: Some(ExtractedRecord::default()),
            captured_at: None,
            finished_at: now(),
        };
        assert!(insert_result(Backend::Sqlite, "listing_results", &results, &write).is_none());
    }

    #[test]
    fn requeue_due_needs_a_retry_column() {
        assert!(requeue_due(Backend::Sqlite, "jobs", &minimal_jobs(), now(), true).is_none());
    }

    #[test]
    fn claimed_job_counts_attempt_from_warnings() {
        let row = JobRow {
            id: Uuid::nil().to_string(),
            url: "u".into(),
            user_id: None,
            status: Some("processing".into()),
            retry_after: None,
            warnings: Some("timeout; attempt=2".into()),
            attempts: None,
            updated_at: now(),
            created_at: now(),
        };
        let cols = JobColumns {
            warnings: true,
            ..JobColumns::default()
        };
        let job = row.into_claimed_job("jobs", &cols).unwrap();
        assert_eq!(job.attempts, 3);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.warnings.as_deref(), Some("timeout; attempt=3"));

        let mut jobs = minimal_jobs();
        jobs.columns.push(ColumnInfo {
            name: "warnings".into(),
            declared_type: "TEXT".into(),
        });
        let mark = mark_claim_attempt(Backend::Sqlite, "jobs", &jobs, &job).unwrap();
        assert!(mark.text.starts_with("UPDATE jobs SET warnings = ? WHERE id = ?"));
        assert_eq!(mark.binds[0], SqlValue::OptText(Some("timeout; attempt=3".into())));
        assert!(mark_claim_attempt(Backend::Sqlite, "jobs", &minimal_jobs(), &job).is_none());
    }
}
