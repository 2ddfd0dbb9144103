//! # Optimization Dispatcher
//!
//! Background poll loop that turns pending optimization jobs into running
//! executions. Each cycle sweeps stuck jobs, takes a permit from the
//! concurrency limiter, claims the oldest pending job and hands it to a
//! tracked executor task without waiting for it. The loop only ever suspends
//! on its poll-interval sleep.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use sea_orm::DatabaseConnection;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::JobStoreError;
use crate::executor::{ExecutorConfig, JobExecutor};
use crate::limiter::ConcurrencyLimiter;
use crate::optimizer::Optimizer;
use crate::reaper::StuckJobReaper;
use crate::repositories::OptimizationJobRepository;

/// Claim attempts per cycle when the oldest pending row is taken from under us.
const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Configuration for the dispatcher and the executions it spawns
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Sleep between cycles that did not dispatch anything
    pub poll_interval: Duration,
    /// Number of optimizations allowed to run at once
    pub max_concurrent_jobs: usize,
    /// Maximum wall-clock duration of one optimizer call
    pub time_budget: Duration,
    /// Grace period for timed-out calls that ignore cancellation
    pub straggler_grace: Duration,
    /// How long shutdown waits for in-flight executions
    pub shutdown_drain: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_concurrent_jobs: 2,
            time_budget: Duration::from_secs(600),
            straggler_grace: Duration::from_secs(5),
            shutdown_drain: Duration::from_secs(30),
        }
    }
}

impl From<&WorkerConfig> for DispatcherConfig {
    fn from(worker: &WorkerConfig) -> Self {
        Self {
            poll_interval: worker.poll_interval(),
            max_concurrent_jobs: worker.max_concurrent_jobs,
            time_budget: worker.time_budget(),
            straggler_grace: worker.straggler_grace(),
            shutdown_drain: worker.shutdown_drain(),
        }
    }
}

/// Result of a single poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A job was marked running and handed to an executor
    Dispatched(Uuid),
    /// Every permit is in use
    AtCapacity,
    /// No pending job was available
    Idle,
}

/// Ids of jobs with a live execution in this process.
#[derive(Debug, Clone, Default)]
struct InFlightJobs {
    ids: Arc<Mutex<HashSet<Uuid>>>,
}

impl InFlightJobs {
    fn lock(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.ids.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn snapshot(&self) -> Vec<Uuid> {
        self.lock().iter().copied().collect()
    }

    fn register(&self, job_id: Uuid) -> InFlightEntry {
        self.lock().insert(job_id);
        gauge!("optimization_jobs_running").increment(1.0);
        InFlightEntry {
            jobs: self.clone(),
            job_id,
        }
    }
}

/// Removes its job from [`InFlightJobs`] when the execution task ends,
/// including on panic or abort.
struct InFlightEntry {
    jobs: InFlightJobs,
    job_id: Uuid,
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        self.jobs.lock().remove(&self.job_id);
        gauge!("optimization_jobs_running").decrement(1.0);
    }
}

/// Background dispatcher service.
pub struct OptimizationDispatcher {
    repository: OptimizationJobRepository,
    limiter: ConcurrencyLimiter,
    executor: JobExecutor,
    reaper: StuckJobReaper,
    config: DispatcherConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    in_flight: InFlightJobs,
}

impl OptimizationDispatcher {
    /// Create a dispatcher. Cancelling `shutdown` stops the loop and every
    /// in-flight execution.
    pub fn new(
        db: DatabaseConnection,
        optimizer: Arc<dyn Optimizer>,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let repository = OptimizationJobRepository::new(db);
        let executor = JobExecutor::new(
            repository.clone(),
            optimizer,
            ExecutorConfig {
                time_budget: config.time_budget,
                straggler_grace: config.straggler_grace,
            },
        );
        let reaper = StuckJobReaper::new(repository.clone(), config.time_budget);

        Self {
            repository,
            limiter: ConcurrencyLimiter::new(config.max_concurrent_jobs),
            executor,
            reaper,
            config,
            shutdown,
            tracker: TaskTracker::new(),
            in_flight: InFlightJobs::default(),
        }
    }

    pub fn repository(&self) -> &OptimizationJobRepository {
        &self.repository
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Executions spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the poll loop until the shutdown token fires, then wait for
    /// in-flight executions to drain.
    #[instrument(skip_all)]
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_concurrent_jobs = self.limiter.capacity(),
            time_budget_secs = self.config.time_budget.as_secs(),
            "Starting optimization dispatcher"
        );

        // Fail rows orphaned by a previous process before claiming anything.
        match self.reaper.sweep(Utc::now(), &self.in_flight.snapshot()).await {
            Ok(reaped) if reaped > 0 => info!(reaped, "Recovered stuck jobs at startup"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Startup stuck-job sweep failed"),
        }

        while !self.shutdown.is_cancelled() {
            let cycle_started = Instant::now();
            let outcome = self.poll_once().await;
            histogram!("optimization_poll_cycle_duration_ms")
                .record(cycle_started.elapsed().as_secs_f64() * 1_000.0);

            match outcome {
                Ok(PollOutcome::Dispatched(_)) => continue,
                Ok(PollOutcome::AtCapacity) => debug!("All permits in use"),
                Ok(PollOutcome::Idle) => {}
                Err(err) => error!(error = %err, "Poll cycle failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        info!(in_flight = self.in_flight(), "Optimization dispatcher stopping");
        self.drain().await;
        info!("Optimization dispatcher stopped");
    }

    /// Perform exactly one poll cycle.
    pub async fn poll_once(&self) -> Result<PollOutcome, JobStoreError> {
        let owned = self.in_flight.snapshot();
        if let Err(err) = self.reaper.sweep(Utc::now(), &owned).await {
            warn!(error = %err, "Stuck-job sweep failed; continuing with claim");
        }

        let Some(permit) = self.limiter.try_acquire() else {
            return Ok(PollOutcome::AtCapacity);
        };

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let Some(candidate) = self.repository.claim_oldest_pending().await? else {
                return Ok(PollOutcome::Idle);
            };

            let Some(job) = self
                .repository
                .mark_running(candidate.id, Utc::now())
                .await?
            else {
                debug!(job_id = %candidate.id, "Pending job changed before claim; retrying");
                continue;
            };

            counter!("optimization_jobs_claimed_total").increment(1);
            info!(
                job_id = %job.id,
                route_id = job.target_route_id,
                available_permits = self.limiter.available(),
                "Dispatching optimization job"
            );

            let executor = self.executor.clone();
            let shutdown = self.shutdown.clone();
            let job_id = job.id;
            let entry = self.in_flight.register(job_id);
            self.tracker.spawn(async move {
                let _entry = entry;
                executor.execute(job_id, permit, shutdown).await;
            });

            return Ok(PollOutcome::Dispatched(job_id));
        }

        Ok(PollOutcome::Idle)
    }

    async fn drain(&self) {
        self.tracker.close();
        if timeout(self.config.shutdown_drain, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.in_flight(),
                drain_secs = self.config.shutdown_drain.as_secs(),
                "In-flight executions did not drain before shutdown deadline"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_worker_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.time_budget, Duration::from_secs(600));
    }

    #[test]
    fn converts_from_worker_config() {
        let worker = WorkerConfig {
            poll_interval_ms: 250,
            max_concurrent_jobs: 4,
            time_budget_seconds: 90,
            straggler_grace_seconds: 1,
            shutdown_drain_seconds: 10,
        };
        let config = DispatcherConfig::from(&worker);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.time_budget, Duration::from_secs(90));
        assert_eq!(config.straggler_grace, Duration::from_secs(1));
        assert_eq!(config.shutdown_drain, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn in_flight_entry_is_removed_when_task_ends() {
        let jobs = InFlightJobs::default();
        let finished = Uuid::now_v7();
        let panicked = Uuid::now_v7();

        let entry = jobs.register(finished);
        assert_eq!(jobs.snapshot(), vec![finished]);
        tokio::spawn(async move {
            let _entry = entry;
        })
        .await
        .unwrap();

        let entry = jobs.register(panicked);
        let handle = tokio::spawn(async move {
            let _entry = entry;
            panic!("executor blew up");
        });
        assert!(handle.await.is_err());

        assert!(jobs.snapshot().is_empty());
    }
}
