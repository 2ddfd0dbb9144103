//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the
//! optimization job table.

pub mod optimization_job;

pub use optimization_job::{NewOptimizationJob, OptimizationJobRepository, TerminalOutcome};
