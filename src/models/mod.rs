//! # Data Models
//!
//! SeaORM entities persisted by the optimization worker.

pub mod optimization_job;

pub use optimization_job::Entity as OptimizationJob;
pub use optimization_job::{JobStatus, JobStatusView};
