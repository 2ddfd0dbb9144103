//! # OptimizationJob Repository
//!
//! Data access for the `optimization_jobs` table. Every write reloads the
//! latest row first and guards the update on the status it expects, so a
//! terminal row is never moved again and a claim only ever applies to a row
//! that is still pending.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobStoreError, map_db_err};
use crate::models::optimization_job::{
    ActiveModel, Column, Entity, JobStatus, JobStatusView, MESSAGE_QUEUED, MESSAGE_RUNNING, Model,
    truncate_message,
};

/// Parameters supplied by the caller when requesting an optimization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOptimizationJob {
    pub target_route_id: i64,
    pub optimization_mode: String,
    pub avoid_tolls: bool,
    pub preserve_order: bool,
    pub is_time_deviation_optimization: bool,
    pub requested_by: String,
}

/// Terminal state written by the executor or the reaper.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalOutcome {
    pub status: JobStatus,
    pub message: String,
    pub error: Option<String>,
    pub result_payload: Option<JsonValue>,
}

impl TerminalOutcome {
    /// Completed job carrying the optimizer result.
    pub fn completed(message: &str, result_payload: JsonValue) -> Self {
        Self {
            status: JobStatus::Completed,
            message: truncate_message(message),
            error: None,
            result_payload: Some(result_payload),
        }
    }

    /// Failed job; `error` keeps the full diagnostic for operators.
    pub fn failed(message: &str, error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            message: truncate_message(message),
            error: Some(error.into()),
            result_payload: None,
        }
    }

    fn apply(&self, mut active: ActiveModel, now: DateTime<Utc>) -> ActiveModel {
        let now = now.fixed_offset();
        active.status = Set(self.status);
        active.message = Set(self.message.clone());
        active.error = Set(self.error.clone());
        active.result_payload = Set(self.result_payload.clone());
        active.completed_at = Set(Some(now));
        active.updated_at = Set(now);
        active
    }
}

/// Repository for optimization job database operations
#[derive(Clone)]
pub struct OptimizationJobRepository {
    db: DatabaseConnection,
}

impl OptimizationJobRepository {
    /// Create a new OptimizationJobRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Insert a new pending job and return it.
    pub async fn enqueue(&self, params: NewOptimizationJob) -> Result<Model, JobStoreError> {
        let now = Utc::now().fixed_offset();

        let job = ActiveModel {
            id: Set(Uuid::now_v7()),
            target_route_id: Set(params.target_route_id),
            status: Set(JobStatus::Pending),
            optimization_mode: Set(params.optimization_mode),
            avoid_tolls: Set(params.avoid_tolls),
            preserve_order: Set(params.preserve_order),
            is_time_deviation_optimization: Set(params.is_time_deviation_optimization),
            requested_by: Set(params.requested_by),
            created_at: Set(now),
            started_at: Set(None),
            completed_at: Set(None),
            updated_at: Set(now),
            message: Set(MESSAGE_QUEUED.to_string()),
            error: Set(None),
            result_payload: Set(None),
        };

        let job = job
            .insert(&self.db)
            .await
            .map_err(|err| map_db_err("failed to enqueue optimization job", err))?;

        info!(
            job_id = %job.id,
            route_id = job.target_route_id,
            optimization_mode = %job.optimization_mode,
            requested_by = %job.requested_by,
            "Optimization job enqueued"
        );

        Ok(job)
    }

    /// Read the oldest pending job, if any.
    pub async fn claim_oldest_pending(&self) -> Result<Option<Model>, JobStoreError> {
        Entity::find()
            .filter(Column::Status.eq(JobStatus::Pending))
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .one(&self.db)
            .await
            .map_err(|err| map_db_err("failed to load oldest pending job", err))
    }

    /// Move a pending job to running.
    ///
    /// Returns `None` when the row is gone or no longer pending.
    pub async fn mark_running(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>, JobStoreError> {
        let Some(job) = self.find_by_id(job_id).await? else {
            return Ok(None);
        };
        if !job.status.can_transition_to(JobStatus::Running) {
            debug!(job_id = %job_id, status = %job.status, "Job no longer pending; not claiming");
            return Ok(None);
        }

        let now = now.fixed_offset();
        let mut active: ActiveModel = job.into();
        active.status = Set(JobStatus::Running);
        active.started_at = Set(Some(now));
        active.message = Set(MESSAGE_RUNNING.to_string());
        active.updated_at = Set(now);

        match Entity::update(active)
            .filter(Column::Status.eq(JobStatus::Pending))
            .exec(&self.db)
            .await
        {
            Ok(model) => Ok(Some(model)),
            Err(DbErr::RecordNotUpdated) => Ok(None),
            Err(err) => Err(map_db_err("failed to mark job running", err)),
        }
    }

    /// Persist the full row state of `job`.
    pub async fn save(&self, job: Model) -> Result<Model, JobStoreError> {
        let job_id = job.id;
        let active = ActiveModel {
            id: Set(job.id),
            target_route_id: Set(job.target_route_id),
            status: Set(job.status),
            optimization_mode: Set(job.optimization_mode),
            avoid_tolls: Set(job.avoid_tolls),
            preserve_order: Set(job.preserve_order),
            is_time_deviation_optimization: Set(job.is_time_deviation_optimization),
            requested_by: Set(job.requested_by),
            created_at: Set(job.created_at),
            started_at: Set(job.started_at),
            completed_at: Set(job.completed_at),
            updated_at: Set(job.updated_at),
            message: Set(truncate_message(&job.message)),
            error: Set(job.error),
            result_payload: Set(job.result_payload),
        };

        match active.update(&self.db).await {
            Ok(model) => Ok(model),
            Err(DbErr::RecordNotUpdated) => Err(JobStoreError::NotFound(job_id)),
            Err(err) => Err(map_db_err("failed to save optimization job", err)),
        }
    }

    /// Find a job by its identifier
    pub async fn find_by_id(&self, job_id: Uuid) -> Result<Option<Model>, JobStoreError> {
        Entity::find_by_id(job_id)
            .one(&self.db)
            .await
            .map_err(|err| map_db_err("failed to find optimization job", err))
    }

    /// Running jobs whose `started_at` (or `created_at` when unset) is before `cutoff`.
    pub async fn find_running_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Model>, JobStoreError> {
        Self::running_older_than(&self.db, cutoff, &[]).await
    }

    /// Write a terminal outcome onto the latest copy of a running job.
    ///
    /// Returns `None` when the row is gone or has already left `running`, in
    /// which case nothing is written.
    pub async fn finalize(
        &self,
        job_id: Uuid,
        outcome: &TerminalOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Model>, JobStoreError> {
        let Some(latest) = self.find_by_id(job_id).await? else {
            warn!(job_id = %job_id, "Job row disappeared before terminal write");
            return Ok(None);
        };
        if !latest.status.can_transition_to(outcome.status) {
            warn!(
                job_id = %job_id,
                status = %latest.status,
                attempted = %outcome.status,
                "Job already left running; terminal write skipped"
            );
            return Ok(None);
        }

        let active = outcome.apply(latest.into(), now);
        match Entity::update(active)
            .filter(Column::Status.eq(JobStatus::Running))
            .exec(&self.db)
            .await
        {
            Ok(model) => Ok(Some(model)),
            Err(DbErr::RecordNotUpdated) => {
                warn!(job_id = %job_id, "Job left running during terminal write; skipped");
                Ok(None)
            }
            Err(err) => Err(map_db_err("failed to persist terminal job state", err)),
        }
    }

    /// Fail every running job older than `cutoff` in a single transaction.
    ///
    /// Jobs listed in `owned` still have a live execution in this process and
    /// are left alone.
    pub async fn fail_running_older_than(
        &self,
        cutoff: DateTime<Utc>,
        owned: &[Uuid],
        outcome: &TerminalOutcome,
        now: DateTime<Utc>,
    ) -> Result<Vec<Model>, JobStoreError> {
        let txn = self
            .db
            .begin()
            .await
            .map_err(|err| map_db_err("failed to start reaper transaction", err))?;

        let stuck = Self::running_older_than(&txn, cutoff, owned).await?;
        let mut failed = Vec::with_capacity(stuck.len());

        for job in stuck {
            if !job.status.can_transition_to(outcome.status) {
                continue;
            }
            let active = outcome.apply(job.into(), now);
            match Entity::update(active)
                .filter(Column::Status.eq(JobStatus::Running))
                .exec(&txn)
                .await
            {
                Ok(model) => failed.push(model),
                Err(DbErr::RecordNotUpdated) => {}
                Err(err) => return Err(map_db_err("failed to fail stuck job", err)),
            }
        }

        txn.commit()
            .await
            .map_err(|err| map_db_err("failed to commit reaper transaction", err))?;

        Ok(failed)
    }

    /// Client-facing status of a job.
    pub async fn status(&self, job_id: Uuid) -> Result<Option<JobStatusView>, JobStoreError> {
        Ok(self.find_by_id(job_id).await?.map(JobStatusView::from))
    }

    /// Number of jobs currently in `status`.
    pub async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobStoreError> {
        Entity::find()
            .filter(Column::Status.eq(status))
            .count(&self.db)
            .await
            .map_err(|err| map_db_err("failed to count jobs by status", err))
    }

    async fn running_older_than<C>(
        conn: &C,
        cutoff: DateTime<Utc>,
        owned: &[Uuid],
    ) -> Result<Vec<Model>, JobStoreError>
    where
        C: ConnectionTrait,
    {
        let cutoff = cutoff.fixed_offset();

        let mut query = Entity::find().filter(Column::Status.eq(JobStatus::Running));
        if !owned.is_empty() {
            query = query.filter(Column::Id.is_not_in(owned.iter().copied()));
        }

        query
            .filter(
                Condition::any().add(Column::StartedAt.lt(cutoff)).add(
                    Condition::all()
                        .add(Column::StartedAt.is_null())
                        .add(Column::CreatedAt.lt(cutoff)),
                ),
            )
            .order_by_asc(Column::CreatedAt)
            .all(conn)
            .await
            .map_err(|err| map_db_err("failed to load stuck running jobs", err))
    }
}
