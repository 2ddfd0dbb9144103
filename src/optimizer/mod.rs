//! Optimizer boundary
//!
//! The optimizer itself lives outside this service. The worker only depends on
//! the [`Optimizer`] trait, which keeps the executor testable with stub
//! implementations and lets production wire in [`http::HttpOptimizer`].

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::optimization_job::Model as OptimizationJob;

pub use http::HttpOptimizer;

/// Parameters handed to the optimizer for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationRequest {
    pub route_id: i64,
    pub optimization_mode: String,
    pub avoid_tolls: bool,
    pub preserve_order: bool,
    pub is_time_deviation_optimization: bool,
    pub requested_by: String,
}

impl From<&OptimizationJob> for OptimizationRequest {
    fn from(job: &OptimizationJob) -> Self {
        Self {
            route_id: job.target_route_id,
            optimization_mode: job.optimization_mode.clone(),
            avoid_tolls: job.avoid_tolls,
            preserve_order: job.preserve_order,
            is_time_deviation_optimization: job.is_time_deviation_optimization,
            requested_by: job.requested_by.clone(),
        }
    }
}

/// Successful optimizer outcome.
///
/// `message` becomes the job's client-facing message; the whole response is
/// stored as the job's result payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResponse {
    pub message: String,
    #[serde(default)]
    pub result: JsonValue,
}

impl OptimizationResponse {
    pub fn new(message: impl Into<String>, result: JsonValue) -> Self {
        Self {
            message: message.into(),
            result,
        }
    }
}

/// Errors an optimizer call can end with.
#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("optimization cancelled")]
    Cancelled,
    #[error("optimization failed: {0}")]
    Failed(String),
    #[error("optimizer returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("optimizer transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid optimizer response: {0}")]
    InvalidResponse(String),
    #[error("invalid optimizer configuration: {0}")]
    Configuration(String),
}

impl OptimizerError {
    /// Short label used as the `reason` on failure metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            OptimizerError::Cancelled => "cancelled",
            OptimizerError::Failed(_) => "failed",
            OptimizerError::Upstream { .. } => "upstream",
            OptimizerError::Transport(_) => "transport",
            OptimizerError::InvalidResponse(_) => "invalid_response",
            OptimizerError::Configuration(_) => "configuration",
        }
    }
}

/// External route optimizer.
///
/// Implementations should return promptly with [`OptimizerError::Cancelled`]
/// once `cancel` fires. Implementations that ignore it are tolerated: the
/// executor stops waiting at the time budget and aborts the call after a grace
/// period.
#[async_trait]
pub trait Optimizer: Send + Sync {
    async fn optimize(
        &self,
        request: OptimizationRequest,
        cancel: CancellationToken,
    ) -> Result<OptimizationResponse, OptimizerError>;
}
