use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::store::{ChallengeStore, StoreError};

/// How long used or expired challenges are kept for inspection.
pub const RETENTION_HOURS: i64 = 24;

pub const DEFAULT_CRON: &str = "0 */15 * * * *";

/// Deletes challenges that were used or expired more than
/// `RETENTION_HOURS` before `now`. Licenses and activations are not touched.
pub async fn purge_stale_challenges(
    store: &dyn ChallengeStore,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let removed = store
        .purge_stale_challenges(now, Duration::hours(RETENTION_HOURS))
        .await?;

    if removed > 0 {
        tracing::info!(removed, "Purged stale verification challenges");
    } else {
        tracing::debug!("No stale verification challenges to purge");
    }

    Ok(removed)
}

/// Starts a scheduler running the purge on `cron` (six-field, seconds first).
pub async fn start(
    store: Arc<dyn ChallengeStore>,
    cron: &str,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(cron, move |_id, _scheduler| {
        let store = store.clone();
        Box::pin(async move {
            if let Err(e) = purge_stale_challenges(store.as_ref(), Utc::now()).await {
                tracing::error!(error = %e, "Challenge cleanup failed");
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    tracing::info!(cron, "Challenge cleanup job scheduled");

    Ok(scheduler)
}
