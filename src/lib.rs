//! # Route Optimization Jobs
//!
//! Durable background worker for route optimization requests. Requests are
//! persisted as jobs, claimed in FIFO order by a polling dispatcher, run
//! against an external optimizer under a concurrency cap and a per-job time
//! budget, and always finish in a terminal state.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod limiter;
pub mod models;
pub mod optimizer;
pub mod reaper;
pub mod repositories;
pub mod telemetry;
pub use migration;
