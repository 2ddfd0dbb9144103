//! Job Executor
//!
//! Runs one claimed optimization job: reloads the row, calls the optimizer
//! under a per-job cancellation token, races the call against the time budget
//! and writes the terminal state back onto the latest copy of the row.
//!
//! The optimizer call runs in its own task. A panic inside the optimizer is
//! therefore reported as a failed job instead of unwinding the executor, and a
//! call that outlives its budget can be cancelled and, failing that, aborted by
//! the straggler watcher.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use metrics::{counter, histogram};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::limiter::JobPermit;
use crate::models::optimization_job::{JobStatus, MESSAGE_FAILED, MESSAGE_TIMED_OUT};
use crate::optimizer::{OptimizationRequest, OptimizationResponse, Optimizer, OptimizerError};
use crate::repositories::{OptimizationJobRepository, TerminalOutcome};

type OptimizerCall = JoinHandle<Result<OptimizationResponse, OptimizerError>>;

/// Configuration for the job executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum wall-clock duration of one optimizer call
    pub time_budget: Duration,
    /// How long a timed-out call may keep running after cancellation before it is aborted
    pub straggler_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_secs(600), // 10 minutes
            straggler_grace: Duration::from_secs(5),
        }
    }
}

/// How a single execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Optimizer succeeded and the job was written as completed
    Completed,
    /// Optimizer failed or panicked and the job was written as failed
    Failed,
    /// Time budget elapsed and the job was written as failed
    TimedOut,
    /// Row had already left running when the terminal state was written
    Superseded,
    /// Terminal write failed; the row stays running until the reaper sees it
    PersistFailed,
    /// Shutdown interrupted the call; nothing was written
    Interrupted,
    /// Row was missing or not running, so the optimizer was never called
    Skipped,
}

enum Race {
    Finished(Result<Result<OptimizationResponse, OptimizerError>, JoinError>),
    TimedOut,
    Shutdown,
}

/// Executes claimed optimization jobs
#[derive(Clone)]
pub struct JobExecutor {
    repository: OptimizationJobRepository,
    optimizer: Arc<dyn Optimizer>,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        repository: OptimizationJobRepository,
        optimizer: Arc<dyn Optimizer>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            repository,
            optimizer,
            config,
        }
    }

    /// Execute a job already marked running.
    ///
    /// `permit` is held until this returns, on every path.
    #[instrument(skip(self, permit, shutdown), fields(job_id = %job_id))]
    pub async fn execute(
        &self,
        job_id: Uuid,
        permit: JobPermit,
        shutdown: CancellationToken,
    ) -> ExecutionOutcome {
        let _permit = permit;
        let started = Instant::now();

        let job = match self.repository.find_by_id(job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Running => job,
            Ok(Some(job)) => {
                warn!(status = %job.status, "Job is not running; skipping optimizer call");
                return ExecutionOutcome::Skipped;
            }
            Ok(None) => {
                warn!("Job row not found; skipping optimizer call");
                return ExecutionOutcome::Skipped;
            }
            Err(err) => {
                error!(error = %err, "Failed to reload job before execution");
                return ExecutionOutcome::Skipped;
            }
        };

        let request = OptimizationRequest::from(&job);
        let cancel = shutdown.child_token();
        let mut call = self.spawn_call(request, cancel.clone());

        let race = tokio::select! {
            biased;
            joined = &mut call => Race::Finished(joined),
            _ = shutdown.cancelled() => Race::Shutdown,
            _ = sleep(self.config.time_budget) => Race::TimedOut,
        };

        let joined = match race {
            Race::Shutdown => return Self::interrupt(&call, &cancel, started),
            Race::TimedOut => None,
            Race::Finished(joined) => Some(joined),
        };

        let (outcome, terminal, reason) = match joined {
            None => {
                cancel.cancel();
                self.watch_straggler(job_id, call);
                let budget_ms = self.config.time_budget.as_millis() as u64;
                warn!(budget_ms, "Optimization exceeded its time budget");
                (
                    ExecutionOutcome::TimedOut,
                    TerminalOutcome::failed(
                        MESSAGE_TIMED_OUT,
                        format!("optimizer did not finish within {budget_ms}ms"),
                    ),
                    "timeout",
                )
            }
            Some(Ok(Err(OptimizerError::Cancelled))) if shutdown.is_cancelled() => {
                return Self::interrupt(&call, &cancel, started);
            }
            Some(Ok(Ok(response))) => match serde_json::to_value(&response) {
                Ok(payload) => (
                    ExecutionOutcome::Completed,
                    TerminalOutcome::completed(&response.message, payload),
                    "",
                ),
                Err(err) => (
                    ExecutionOutcome::Failed,
                    TerminalOutcome::failed(
                        MESSAGE_FAILED,
                        format!("failed to serialize optimizer result: {err}"),
                    ),
                    "serialization",
                ),
            },
            Some(Ok(Err(err))) => {
                warn!(error = %err, "Optimizer returned an error");
                (
                    ExecutionOutcome::Failed,
                    TerminalOutcome::failed(MESSAGE_FAILED, err.to_string()),
                    err.reason(),
                )
            }
            Some(Err(join_err)) => {
                let detail = describe_join_error(join_err);
                error!(error = %detail, "Optimizer task ended abnormally");
                (
                    ExecutionOutcome::Failed,
                    TerminalOutcome::failed(MESSAGE_FAILED, detail),
                    "panic",
                )
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        histogram!("optimization_job_duration_ms").record(elapsed_ms as f64);

        match self.repository.finalize(job_id, &terminal, Utc::now()).await {
            Ok(Some(_)) => {
                if outcome == ExecutionOutcome::Completed {
                    counter!("optimization_jobs_completed_total").increment(1);
                } else {
                    counter!("optimization_jobs_failed_total", "reason" => reason).increment(1);
                }
                info!(
                    elapsed_ms,
                    status = %terminal.status,
                    "Optimization job finished"
                );
                outcome
            }
            Ok(None) => ExecutionOutcome::Superseded,
            Err(err) => {
                error!(
                    error = %err,
                    status = %terminal.status,
                    "Failed to persist terminal job state; job stays running until reaped"
                );
                ExecutionOutcome::PersistFailed
            }
        }
    }

    fn interrupt(
        call: &OptimizerCall,
        cancel: &CancellationToken,
        started: Instant,
    ) -> ExecutionOutcome {
        cancel.cancel();
        call.abort();
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Shutdown interrupted optimization; leaving job for the reaper"
        );
        ExecutionOutcome::Interrupted
    }

    fn spawn_call(&self, request: OptimizationRequest, cancel: CancellationToken) -> OptimizerCall {
        let optimizer = Arc::clone(&self.optimizer);
        tokio::spawn(async move { optimizer.optimize(request, cancel).await })
    }

    /// Observe a timed-out call after its token was cancelled.
    ///
    /// The job is already being finalized as timed out; whatever the call
    /// produces now is only logged. Calls still running after the grace period
    /// are aborted.
    fn watch_straggler(&self, job_id: Uuid, call: OptimizerCall) {
        let grace = self.config.straggler_grace;
        let abort = call.abort_handle();

        tokio::spawn(async move {
            match timeout(grace, call).await {
                Ok(Ok(Ok(_))) => {
                    info!(job_id = %job_id, "Timed-out optimization finished late; result discarded");
                }
                Ok(Ok(Err(OptimizerError::Cancelled))) => {
                    debug!(job_id = %job_id, "Timed-out optimization acknowledged cancellation");
                }
                Ok(Ok(Err(err))) => {
                    warn!(job_id = %job_id, error = %err, "Timed-out optimization failed late");
                }
                Ok(Err(join_err)) => {
                    warn!(
                        job_id = %job_id,
                        error = %describe_join_error(join_err),
                        "Timed-out optimization task ended abnormally"
                    );
                }
                Err(_) => {
                    abort.abort();
                    warn!(
                        job_id = %job_id,
                        grace_ms = grace.as_millis() as u64,
                        "Timed-out optimization ignored cancellation; task aborted"
                    );
                }
            }
        });
    }
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_panic() {
        format!("optimizer panicked: {}", panic_message(err.into_panic()))
    } else {
        format!("optimizer task cancelled: {err}")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
