use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::HubConfig;
use crate::orchestrator::SyncOrchestrator;

/// Builds the timed "sync all" trigger when `HUBCAL_SCHEDULER_ENABLED` is set.
/// The caller decides when to start it.
pub async fn maybe_build_scheduler(
    config: &HubConfig,
    orchestrator: Arc<SyncOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        Box::pin(async move {
            match orchestrator.sync_all().await {
                Ok(reports) => {
                    let failed = reports
                        .iter()
                        .filter(|r| r.result.as_ref().map_or(true, |res| res.error.is_some()))
                        .count();
                    info!(sources = reports.len(), failed, "scheduled sync finished");
                }
                Err(err) => warn!(error = %err, "scheduled sync could not list sources"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "sync scheduler configured");
    Ok(Some(sched))
}
