//! Queue worker: claim, extract, validate, schedule retries, persist.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use listq_core::{
    classify, render_warnings, ExtractedRecord, FailureKind, Job, JobStatus, Outcome, RawPayload,
    Warning, RETRIES_EXHAUSTED_CODE,
};
use listq_extract::{extract_with_timeout, ExtractionConfig, ExtractionStrategy};
use listq_storage::{ArtifactStore, JobStore, StorageError, TerminalWrite};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod retry;
mod sweep;

pub use config::WorkerConfig;
pub use retry::{RetryDecision, RetryPolicy};
pub use sweep::{build_sweep_scheduler, sweep_stale};

pub const CRATE_NAME: &str = "listq-worker";

pub const RESULTS_TABLE_MISSING_CODE: &str = "results_table_missing";

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedJob {
    pub job_id: Uuid,
    pub url: String,
    pub attempt: u32,
    pub status: JobStatus,
    pub failure: Option<FailureKind>,
    pub retry: RetryDecision,
    pub warnings: Option<String>,
    pub result_row_written: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub completed: usize,
    pub errors: usize,
    pub captchas: usize,
    pub storage_failures: usize,
}

impl RunSummary {
    fn record(&mut self, job: &ProcessedJob) {
        self.processed += 1;
        match job.status {
            JobStatus::Completed => self.completed += 1,
            JobStatus::Captcha => self.captchas += 1,
            _ => self.errors += 1,
        }
    }
}

pub struct QueueWorker {
    store: Arc<dyn JobStore>,
    strategy: Arc<dyn ExtractionStrategy>,
    extraction: ExtractionConfig,
    retry: RetryPolicy,
    poll_interval: Duration,
    auto_requeue_captcha: bool,
    artifacts: Option<ArtifactStore>,
}

impl QueueWorker {
    pub fn new(store: Arc<dyn JobStore>, strategy: Arc<dyn ExtractionStrategy>) -> Self {
        Self {
            store,
            strategy,
            extraction: ExtractionConfig::default(),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(5),
            auto_requeue_captcha: true,
            artifacts: None,
        }
    }

    pub fn from_config(
        store: Arc<dyn JobStore>,
        strategy: Arc<dyn ExtractionStrategy>,
        config: &WorkerConfig,
    ) -> Self {
        let worker = Self::new(store, strategy)
            .with_extraction(ExtractionConfig {
                timeout: config.extraction_timeout,
            })
            .with_retry_policy(config.retry)
            .with_poll_interval(config.poll_interval)
            .with_auto_requeue_captcha(config.auto_requeue_captcha);
        match &config.artifacts_dir {
            Some(dir) => worker.with_artifacts(ArtifactStore::new(dir)),
            None => worker,
        }
    }

    pub fn with_extraction(mut self, extraction: ExtractionConfig) -> Self {
        self.extraction = extraction;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_auto_requeue_captcha(mut self, enabled: bool) -> Self {
        self.auto_requeue_captcha = enabled;
        self
    }

    pub fn with_artifacts(mut self, artifacts: ArtifactStore) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Claims and fully processes at most one job. `Ok(None)` means nothing
    /// was eligible. A storage error leaves the job claimable again.
    pub async fn process_next(&self) -> Result<Option<ProcessedJob>, StorageError> {
        let now = Utc::now();
        match self.store.requeue_due(now, self.auto_requeue_captcha).await {
            Ok(0) => {}
            Ok(requeued) => info!(requeued, "requeued jobs whose retry window passed"),
            Err(err) => warn!(error = %err, "requeue of due jobs failed"),
        }

        let Some(job) = self.store.claim_next(now).await? else {
            return Ok(None);
        };
        let span = info_span!("job", job_id = %job.id, attempt = job.attempts);
        self.process_claimed(job).instrument(span).await.map(Some)
    }

    async fn process_claimed(&self, job: Job) -> Result<ProcessedJob, StorageError> {
        let started = Instant::now();
        let result = extract_with_timeout(self.strategy.as_ref(), &job.url, &self.extraction).await;
        let mut outcome = classify(&job.url, &result);
        let finished_at = Utc::now();

        let retry = self.retry.decide(outcome.status, job.attempts, finished_at);
        if retry == RetryDecision::Exhausted {
            let detail = format!("max={}", self.retry.max_attempts);
            outcome.warnings.push(Warning::with_detail(RETRIES_EXHAUSTED_CODE, detail));
        }

        let payload = result.ok();
        let record = match (&payload, outcome.status) {
            (Some(payload), JobStatus::Completed) => Some(payload.record.clone()),
            _ => None,
        };

        let persisted = self.persist(&job, &mut outcome, record, payload.as_ref(), retry, finished_at).await;
        let (warnings, report) = match persisted {
            Ok(done) => done,
            Err(err) => {
                error!(error = %err, url = %job.url, "terminal write failed");
                if !matches!(err, StorageError::LostClaim(_)) {
                    if let Err(release_err) = self.store.release(job.id, Utc::now()).await {
                        error!(error = %release_err, "could not release job; stale sweep will reclaim it");
                    }
                }
                return Err(err);
            }
        };

        let processed = ProcessedJob {
            job_id: job.id,
            url: job.url,
            attempt: job.attempts,
            status: outcome.status,
            failure: outcome.failure,
            retry,
            warnings,
            result_row_written: report,
            elapsed: started.elapsed(),
        };
        log_outcome(&processed, self.strategy.kind().as_str());
        Ok(processed)
    }

    async fn persist(
        &self,
        job: &Job,
        outcome: &mut Outcome,
        record: Option<ExtractedRecord>,
        payload: Option<&RawPayload>,
        retry: RetryDecision,
        finished_at: DateTime<Utc>,
    ) -> Result<(Option<String>, bool), StorageError> {
        if record.is_some() {
            let results = self.store.columns(self.store.tables().results()).await?;
            if results.is_empty() {
                warn!(table = %results.table, "results table missing; completing without a result row");
                outcome.warnings.push(Warning::new(RESULTS_TABLE_MISSING_CODE));
            }
        }
        if outcome.status != JobStatus::Completed {
            if let (Some(artifacts), Some(payload)) = (&self.artifacts, payload) {
                self.store_snapshot(artifacts, job, payload).await;
            }
        }

        outcome.warnings.push(Warning::attempt(job.attempts));
        let warnings = render_warnings(&outcome.warnings);
        let write = TerminalWrite {
            job_id: job.id,
            url: job.url.clone(),
            user_id: job.user_id.clone(),
            status: outcome.status,
            attempt: job.attempts,
            retry_after: retry.retry_after(),
            warnings: warnings.clone(),
            error_message: outcome.message.clone(),
            record,
            captured_at: payload.map(|p| p.captured_at),
            finished_at,
        };
        let report = self.store.finish(&write).await?;
        Ok((warnings, report.result_row_written))
    }

    async fn store_snapshot(&self, artifacts: &ArtifactStore, job: &Job, payload: &RawPayload) {
        let ext = if payload.content_type.contains("json") { "json" } else { "html" };
        match artifacts
            .store_snapshot(payload.captured_at, job.id, ext, payload.snapshot.as_bytes())
            .await
        {
            Ok(stored) => info!(path = %stored.relative_path.display(), "stored raw snapshot"),
            Err(err) => warn!(error = %err, "could not store raw snapshot"),
        }
    }

    /// Processes jobs until none is eligible or storage fails.
    pub async fn drain(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        loop {
            match self.process_next().await {
                Ok(Some(job)) => summary.record(&job),
                Ok(None) => break,
                Err(_) => {
                    summary.storage_failures += 1;
                    break;
                }
            }
        }
        summary
    }

    /// Poll loop. `shutdown` is checked between jobs, never mid-job.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> RunSummary {
        let mut summary = RunSummary::default();
        info!(
            strategy = %self.strategy.kind(),
            poll_interval_secs = self.poll_interval.as_secs_f64(),
            "queue worker started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next().await {
                Ok(Some(job)) => {
                    summary.record(&job);
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    summary.storage_failures += 1;
                    error!(error = %err, "job attempt failed on storage");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(
            processed = summary.processed,
            completed = summary.completed,
            errors = summary.errors,
            captchas = summary.captchas,
            storage_failures = summary.storage_failures,
            "queue worker stopped"
        );
        summary
    }
}

fn log_outcome(job: &ProcessedJob, strategy: &str) {
    let warnings = job.warnings.as_deref().unwrap_or("");
    let elapsed_ms = job.elapsed.as_millis() as u64;
    match job.failure {
        None => info!(
            url = %job.url,
            status = %job.status,
            strategy,
            elapsed_ms,
            result_row = job.result_row_written,
            warnings,
            "job completed"
        ),
        Some(kind) => warn!(
            url = %job.url,
            status = %job.status,
            strategy,
            warning_code = kind.code(),
            retry_after = ?job.retry.retry_after(),
            elapsed_ms,
            warnings,
            "job failed"
        ),
    }
}
