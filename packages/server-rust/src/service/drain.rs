//! Deferred-task drain: runs a request's queued work in a fresh scope.
//!
//! The drain scope is opened only after the request scope closed, so no
//! request-bound resource outlives the request it belonged to.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::config::{DrainPolicy, HostConfig};
use super::deferred::{DrainReport, ProcessingContext};
use super::registry::{ManagedService, ServiceContext};
use super::worker::{BackgroundRunnable, BackgroundWorker, WorkerHandle};
use crate::shell::context::ShellContext;
use crate::traits::DeferredTask;

/// Opens a new scope on `shell`, moves `tasks` into its engine, and drains it.
///
/// The scope closes when this returns.
///
/// # Errors
///
/// Returns the container's error if the drain scope cannot be opened; the
/// tasks are dropped unexecuted in that case.
pub async fn drain_in_fresh_scope(
    shell: &ShellContext,
    tasks: Vec<Box<dyn DeferredTask>>,
    policy: DrainPolicy,
) -> anyhow::Result<DrainReport> {
    let queued = tasks.len();
    let scope = shell.create_scope().await?;
    let engine = scope.deferred_tasks();
    engine.extend(tasks)?;

    let ctx = ProcessingContext::new(scope.services(), Arc::clone(shell.settings()));
    let report = engine.execute_tasks(&ctx, policy).await;

    info!(
        tenant = %shell.tenant(),
        scope_id = %scope.id(),
        queued,
        executed = report.executed,
        failed = report.failures.len(),
        discarded = report.discarded,
        "deferred tasks drained"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Background drain
// ---------------------------------------------------------------------------

/// Work handed to the background drain worker.
pub struct DrainJob {
    pub shell: Arc<ShellContext>,
    pub tasks: Vec<Box<dyn DeferredTask>>,
}

impl std::fmt::Debug for DrainJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainJob")
            .field("tenant", self.shell.tenant())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

/// Runs [`DrainJob`]s one at a time and keeps running totals for the tick log.
#[derive(Debug)]
pub struct DrainRunnable {
    policy: DrainPolicy,
    drained_jobs: u64,
    failed_tasks: u64,
}

impl DrainRunnable {
    #[must_use]
    pub fn new(policy: DrainPolicy) -> Self {
        Self {
            policy,
            drained_jobs: 0,
            failed_tasks: 0,
        }
    }
}

#[async_trait]
impl BackgroundRunnable for DrainRunnable {
    type Task = DrainJob;

    async fn run(&mut self, job: DrainJob) {
        match drain_in_fresh_scope(&job.shell, job.tasks, self.policy).await {
            Ok(report) => {
                self.drained_jobs += 1;
                self.failed_tasks += report.failures.len() as u64;
            }
            Err(e) => {
                warn!(tenant = %job.shell.tenant(), error = %format!("{e:#}"), "failed to open drain scope");
            }
        }
    }

    async fn on_tick(&mut self) {
        debug!(
            drained_jobs = self.drained_jobs,
            failed_tasks = self.failed_tasks,
            "drain worker status"
        );
    }

    async fn shutdown(&mut self) {
        info!(drained_jobs = self.drained_jobs, "drain worker stopped");
    }
}

/// Lifecycle wrapper around the background drain worker.
///
/// The worker starts on construction so the dispatcher can take a handle
/// before services are initialized; `shutdown` stops it once every queued
/// job has drained.
pub struct DrainWorker {
    worker: Mutex<Option<BackgroundWorker<DrainRunnable>>>,
    handle: Option<WorkerHandle<DrainJob>>,
}

impl DrainWorker {
    /// Starts the worker with the drain settings from `config`.
    #[must_use]
    pub fn start(config: &HostConfig) -> Self {
        let worker = BackgroundWorker::start_with_capacity(
            DrainRunnable::new(config.drain_policy),
            config.drain_queue_capacity,
            config.drain_tick_interval_ms,
        );
        let handle = worker.handle();
        Self {
            worker: Mutex::new(Some(worker)),
            handle,
        }
    }

    /// Submit side for the dispatcher. `None` only if the worker never started.
    #[must_use]
    pub fn handle(&self) -> Option<WorkerHandle<DrainJob>> {
        self.handle.clone()
    }
}

#[async_trait]
impl ManagedService for DrainWorker {
    fn name(&self) -> &'static str {
        "drain-worker"
    }

    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }
        Ok(())
    }
}
