//! Stuck-job reaper
//!
//! Fails jobs left in `running` longer than the time budget. These are jobs
//! whose worker crashed or was shut down mid-call, or whose terminal write
//! failed. Runs at worker start and at the top of every poll cycle.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use metrics::counter;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::JobStoreError;
use crate::models::optimization_job::MESSAGE_REAPED;
use crate::repositories::{OptimizationJobRepository, TerminalOutcome};

/// Sweeps stuck running jobs into `failed`.
#[derive(Clone)]
pub struct StuckJobReaper {
    repository: OptimizationJobRepository,
    time_budget: Duration,
}

impl StuckJobReaper {
    pub fn new(repository: OptimizationJobRepository, time_budget: Duration) -> Self {
        Self {
            repository,
            time_budget,
        }
    }

    /// Oldest start time a running job may have at `now` without being reaped.
    /// Never earlier than the Unix epoch.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let budget = TimeDelta::from_std(self.time_budget).unwrap_or(TimeDelta::MAX);
        now.checked_sub_signed(budget)
            .filter(|cutoff| *cutoff > DateTime::<Utc>::UNIX_EPOCH)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Fail every job stuck in running at `now`, except those in `owned`,
    /// which still have a live execution. Returns how many were reaped.
    #[instrument(skip(self, owned), fields(budget_secs = self.time_budget.as_secs(), owned = owned.len()))]
    pub async fn sweep(&self, now: DateTime<Utc>, owned: &[Uuid]) -> Result<usize, JobStoreError> {
        let cutoff = self.cutoff(now);
        let outcome = TerminalOutcome::failed(
            MESSAGE_REAPED,
            format!(
                "job was still running after the {}s time budget (started before {}); worker presumed lost",
                self.time_budget.as_secs(),
                cutoff.to_rfc3339()
            ),
        );

        let reaped = self
            .repository
            .fail_running_older_than(cutoff, owned, &outcome, now)
            .await?;

        if reaped.is_empty() {
            debug!("No stuck jobs found");
            return Ok(0);
        }

        for job in &reaped {
            warn!(
                job_id = %job.id,
                route_id = job.target_route_id,
                started_at = ?job.started_at,
                "Reaped stuck optimization job"
            );
        }
        counter!("optimization_jobs_reaped_total").increment(reaped.len() as u64);
        info!(count = reaped.len(), "Stuck-job sweep complete");

        Ok(reaped.len())
    }
}
