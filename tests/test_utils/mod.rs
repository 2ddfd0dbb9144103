//! Test utilities for database and optimizer testing.
//!
//! Provides an in-memory SQLite database with migrations applied, helpers for
//! seeding jobs, and a scriptable [`StubOptimizer`].

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use migration::{Migrator, MigratorTrait};
use route_jobs::dispatcher::DispatcherConfig;
use route_jobs::models::optimization_job::Model as OptimizationJob;
use route_jobs::optimizer::{
    OptimizationRequest, OptimizationResponse, Optimizer, OptimizerError,
};
use route_jobs::repositories::{NewOptimizationJob, OptimizationJobRepository};
use sea_orm::{Database, DatabaseConnection};
use serde_json::{Value as JsonValue, json};
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Parameters for a job targeting `route_id` with default options.
pub fn new_job(route_id: i64) -> NewOptimizationJob {
    NewOptimizationJob {
        target_route_id: route_id,
        optimization_mode: "fastest".to_string(),
        avoid_tolls: false,
        preserve_order: false,
        is_time_deviation_optimization: false,
        requested_by: "tests@example.com".to_string(),
    }
}

/// Enqueues a job for `route_id`.
pub async fn enqueue_job(
    repository: &OptimizationJobRepository,
    route_id: i64,
) -> Result<OptimizationJob> {
    Ok(repository.enqueue(new_job(route_id)).await?)
}

/// Dispatcher settings scaled down for tests.
pub fn fast_dispatcher_config(max_concurrent_jobs: usize) -> DispatcherConfig {
    DispatcherConfig {
        poll_interval: Duration::from_millis(10),
        max_concurrent_jobs,
        time_budget: Duration::from_secs(5),
        straggler_grace: Duration::from_millis(100),
        shutdown_drain: Duration::from_secs(2),
    }
}

/// Polls `condition` every 10ms until it holds or `deadline` elapses.
pub async fn wait_for<F, Fut>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    loop {
        if condition().await {
            return true;
        }
        if started.elapsed() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Synchronous variant of [`wait_for`].
pub async fn wait_until<F>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    wait_for(deadline, || std::future::ready(condition())).await
}

/// Scripted optimizer behaviour.
#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// Return a successful response immediately.
    Succeed { message: String, result: JsonValue },
    /// Return `OptimizerError::Failed` immediately.
    Fail(String),
    /// Wait until cancelled, then return `OptimizerError::Cancelled`.
    Hang,
    /// Never return, ignoring cancellation.
    IgnoreCancel,
    /// Ignore cancellation, then succeed after the delay.
    LateSuccess(Duration),
    /// Panic inside the optimizer.
    Panic(String),
    /// Wait for a gate permit (see [`StubOptimizer::release`]); honours cancellation.
    Gated,
}

impl StubBehavior {
    pub fn succeed(message: &str) -> Self {
        StubBehavior::Succeed {
            message: message.to_string(),
            result: json!({"orderedStops": [3, 1, 2], "distanceKm": 42.5}),
        }
    }
}

/// In-process [`Optimizer`] whose behaviour is scripted per route.
pub struct StubOptimizer {
    default: StubBehavior,
    per_route: Mutex<HashMap<i64, StubBehavior>>,
    calls: Mutex<Vec<OptimizationRequest>>,
    gate: Semaphore,
    active: Arc<AtomicUsize>,
    max_active: AtomicUsize,
    returned: AtomicUsize,
}

/// Tracks a call that is still running; dropping it (including on abort) ends the call.
struct ActiveCall(Arc<AtomicUsize>);

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StubOptimizer {
    pub fn new(default: StubBehavior) -> Arc<Self> {
        Arc::new(Self {
            default,
            per_route: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            gate: Semaphore::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
        })
    }

    /// Override the behaviour for one route.
    pub fn set_route(&self, route_id: i64, behavior: StubBehavior) {
        self.per_route
            .lock()
            .unwrap()
            .insert(route_id, behavior);
    }

    /// Let `n` gated calls proceed to success.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Route ids in the order the optimizer was called.
    pub fn called_routes(&self) -> Vec<i64> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.route_id)
            .collect()
    }

    pub fn calls(&self) -> Vec<OptimizationRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls currently in progress.
    pub fn active_calls(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in progress at once.
    pub fn max_active_calls(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Calls that ran to completion and returned a value.
    pub fn returned_calls(&self) -> usize {
        self.returned.load(Ordering::SeqCst)
    }

    fn behavior_for(&self, route_id: i64) -> StubBehavior {
        self.per_route
            .lock()
            .unwrap()
            .get(&route_id)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    async fn perform(
        &self,
        behavior: StubBehavior,
        cancel: CancellationToken,
    ) -> Result<OptimizationResponse, OptimizerError> {
        match behavior {
            StubBehavior::Succeed { message, result } => {
                Ok(OptimizationResponse::new(message, result))
            }
            StubBehavior::Fail(detail) => Err(OptimizerError::Failed(detail)),
            StubBehavior::Hang => {
                cancel.cancelled().await;
                Err(OptimizerError::Cancelled)
            }
            StubBehavior::IgnoreCancel => {
                std::future::pending::<()>().await;
                Err(OptimizerError::Cancelled)
            }
            StubBehavior::LateSuccess(delay) => {
                sleep(delay).await;
                Ok(OptimizationResponse::new("Late result.", json!({"late": true})))
            }
            StubBehavior::Panic(message) => panic!("{message}"),
            StubBehavior::Gated => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(OptimizerError::Cancelled),
                    permit = self.gate.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                        Ok(OptimizationResponse::new("Gated optimization done.", json!({"gated": true})))
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Optimizer for StubOptimizer {
    async fn optimize(
        &self,
        request: OptimizationRequest,
        cancel: CancellationToken,
    ) -> Result<OptimizationResponse, OptimizerError> {
        let behavior = self.behavior_for(request.route_id);
        self.calls.lock().unwrap().push(request);

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        let _active = ActiveCall(Arc::clone(&self.active));

        let result = self.perform(behavior, cancel).await;
        self.returned.fetch_add(1, Ordering::SeqCst);
        result
    }
}
