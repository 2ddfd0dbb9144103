//! OptimizationJob entity model
//!
//! SeaORM entity for the `optimization_jobs` table. A row is created in the
//! `pending` state when a route optimization is requested, moved to `running`
//! when the dispatcher claims it, and finished as `completed` or `failed` by
//! the executor or the stuck-job reaper.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Maximum number of characters stored in `message`.
pub const MESSAGE_MAX_CHARS: usize = 1000;

/// Message written at enqueue time.
pub const MESSAGE_QUEUED: &str = "Optimization queued.";
/// Message written when the dispatcher claims a job.
pub const MESSAGE_RUNNING: &str = "Optimization running.";
/// Message written when the optimizer exceeds the time budget.
pub const MESSAGE_TIMED_OUT: &str = "Optimization timed out.";
/// Message written when the optimizer fails.
pub const MESSAGE_FAILED: &str = "Optimization failed.";
/// Message written by the reaper for orphaned running jobs.
pub const MESSAGE_REAPED: &str = "exceeded server timeout";

/// Lifecycle state of an optimization job.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OptimizationJob entity representing one queued route optimization
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "optimization_jobs")]
pub struct Model {
    /// Job identifier handed back to the caller at enqueue time
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Route owned by the external route domain
    pub target_route_id: i64,

    /// Current lifecycle state
    pub status: JobStatus,

    /// Optimizer mode, passed through unchanged
    pub optimization_mode: String,

    pub avoid_tolls: bool,

    pub preserve_order: bool,

    pub is_time_deviation_optimization: bool,

    /// Requesting user, kept for auditing only
    pub requested_by: String,

    pub created_at: DateTimeWithTimeZone,

    /// Set when the dispatcher claims the job
    pub started_at: Option<DateTimeWithTimeZone>,

    /// Set when the job reaches a terminal state
    pub completed_at: Option<DateTimeWithTimeZone>,

    pub updated_at: DateTimeWithTimeZone,

    /// Client-facing outcome summary, at most [`MESSAGE_MAX_CHARS`] characters
    pub message: String,

    /// Operator-facing failure detail; never exposed through the status view
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,

    /// Serialized optimizer response, present only for completed jobs
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub result_payload: Option<JsonValue>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

/// Truncates `message` to [`MESSAGE_MAX_CHARS`] characters.
///
/// Counts characters rather than bytes so multi-byte input never splits a code
/// point. Applying it twice yields the same string.
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MESSAGE_MAX_CHARS) {
        Some((byte_index, _)) => message[..byte_index].to_string(),
        None => message.to_string(),
    }
}

/// What clients see when they poll a job by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: Uuid,
    pub status: JobStatus,
    pub message: String,
    /// Only populated once the job has completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
}

impl From<Model> for JobStatusView {
    fn from(model: Model) -> Self {
        let result = match model.status {
            JobStatus::Completed => model.result_payload,
            _ => None,
        };

        Self {
            id: model.id,
            status: model.status,
            message: model.message,
            result,
        }
    }
}
