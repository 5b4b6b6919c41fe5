use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::merge::MergeResolver;
use crate::runner::SyncRunner;

/// Periodic sync-all and merge jobs; `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    runner: SyncRunner,
    resolver: Arc<MergeResolver>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let sync_job = Job::new_async(&config.sync_cron, move |_uuid, _l| {
        let runner = runner.clone();
        Box::pin(async move {
            match runner.expire_stale_imports().await {
                Ok(0) => {}
                Ok(expired) => warn!(expired, "expired stale sync runs"),
                Err(err) => warn!(error = %err, "stale run expiry failed"),
            }
            for (adapter, result) in runner.run_all().await {
                match result {
                    Ok(import) => info!(adapter, status = import.status.as_str(), "scheduled sync finished"),
                    Err(err) => warn!(adapter, error = %err, "scheduled sync skipped"),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(sync_job).await.context("adding sync job")?;

    let merge_job = Job::new_async(&config.merge_cron, move |_uuid, _l| {
        let resolver = Arc::clone(&resolver);
        Box::pin(async move {
            match resolver.run(false).await {
                Ok(report) => info!(merged = report.merged(), review = report.review.len(), "scheduled merge finished"),
                Err(err) => warn!(error = %err, "scheduled merge failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.merge_cron))?;
    sched.add(merge_job).await.context("adding merge job")?;

    Ok(Some(sched))
}
