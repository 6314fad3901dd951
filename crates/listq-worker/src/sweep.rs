use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use listq_storage::{JobStore, StorageError};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, warn};

/// Resets jobs abandoned in `processing` back to `pending`.
pub async fn sweep_stale(
    store: &dyn JobStore,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<u64, StorageError> {
    let reset = store.reset_stale(now, stale_after).await?;
    if reset > 0 {
        warn!(reset, stale_after_secs = stale_after.as_secs(), "reset stale processing jobs");
    } else {
        debug!("no stale processing jobs");
    }
    Ok(reset)
}

/// Scheduler running the staleness sweep on `cron` (6-field, seconds first).
/// Returned unstarted.
pub async fn build_sweep_scheduler(
    store: Arc<dyn JobStore>,
    cron: &str,
    stale_after: Duration,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating sweep scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let store = Arc::clone(&store);
        Box::pin(async move {
            if let Err(err) = sweep_stale(store.as_ref(), Utc::now(), stale_after).await {
                error!(error = %err, "scheduled stale sweep failed");
            }
        })
    })
    .with_context(|| format!("creating sweep job for cron {cron}"))?;
    sched.add(job).await.context("adding sweep job")?;
    Ok(sched)
}
