//! Deferred task engine: a scope-local FIFO of work queued during a request
//! and drained after the request scope has closed.

use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use shellhost_core::{ShellSettings, TenantId};
use tracing::{debug, warn};

use super::config::DrainPolicy;
use crate::shell::scope::{RequestServices, ScopeError};
use crate::traits::DeferredTask;

// ---------------------------------------------------------------------------
// ProcessingContext
// ---------------------------------------------------------------------------

/// Context handed to deferred tasks during drain.
///
/// Built from the drain scope, never from the scope of the request that
/// queued the work.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    services: RequestServices,
    settings: Arc<ShellSettings>,
}

impl ProcessingContext {
    #[must_use]
    pub fn new(services: RequestServices, settings: Arc<ShellSettings>) -> Self {
        Self { services, settings }
    }

    #[must_use]
    pub fn services(&self) -> &RequestServices {
        &self.services
    }

    #[must_use]
    pub fn settings(&self) -> &ShellSettings {
        &self.settings
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.settings.name
    }

    /// Queues follow-up work into the engine currently draining.
    ///
    /// # Errors
    ///
    /// Returns `ScopeError::Closed` if the drain scope is already gone.
    pub fn defer(&self, task: impl DeferredTask + 'static) -> Result<(), ScopeError> {
        self.services
            .deferred_tasks()?
            .add(task)
            .map_err(|EngineSealed| ScopeError::Closed {
                scope_id: self.services.scope_id(),
            })
    }
}

// ---------------------------------------------------------------------------
// DrainReport
// ---------------------------------------------------------------------------

/// A deferred task that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: String,
    pub error: String,
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks that were started, successful or not.
    pub executed: usize,
    pub failures: Vec<TaskFailure>,
    /// Tasks dropped unexecuted after an abort.
    pub discarded: usize,
}

impl DrainReport {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.executed - self.failures.len()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.discarded == 0
    }
}

// ---------------------------------------------------------------------------
// DeferredTaskEngine
// ---------------------------------------------------------------------------

/// Returned when work is offered to an engine whose scope already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deferred task engine is sealed, its scope has closed")]
pub struct EngineSealed;

#[derive(Default)]
struct TaskQueue {
    tasks: VecDeque<Box<dyn DeferredTask>>,
    sealed: bool,
}

/// Per-scope queue of deferred work.
///
/// The lock is only held to push or pop; tasks run without it, so a task may
/// queue more work into the engine that is draining it. Once sealed, the
/// engine refuses new work under the same lock, so nothing can slip in
/// after the owner took the queue.
#[derive(Default)]
pub struct DeferredTaskEngine {
    queue: Mutex<TaskQueue>,
}

impl DeferredTaskEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task.
    ///
    /// # Errors
    ///
    /// `EngineSealed` once the engine was sealed; the task is dropped.
    pub fn add(&self, task: impl DeferredTask + 'static) -> Result<(), EngineSealed> {
        self.add_task(Box::new(task))
    }

    /// Appends an already boxed task.
    ///
    /// # Errors
    ///
    /// `EngineSealed` once the engine was sealed; the task is dropped.
    pub fn add_task(&self, task: Box<dyn DeferredTask>) -> Result<(), EngineSealed> {
        self.extend([task])
    }

    /// Appends tasks in order, after anything already queued.
    ///
    /// # Errors
    ///
    /// `EngineSealed` once the engine was sealed; no task is queued.
    pub fn extend(
        &self,
        tasks: impl IntoIterator<Item = Box<dyn DeferredTask>>,
    ) -> Result<(), EngineSealed> {
        let mut queue = self.queue.lock();
        if queue.sealed {
            return Err(EngineSealed);
        }
        queue.tasks.extend(tasks);
        Ok(())
    }

    /// Whether any task is queued right now.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.queue.lock().tasks.is_empty()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.lock().tasks.len()
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.queue.lock().sealed
    }

    /// Removes and returns every queued task, in order.
    #[must_use]
    pub fn take_pending(&self) -> Vec<Box<dyn DeferredTask>> {
        self.queue.lock().tasks.drain(..).collect()
    }

    /// Refuses all further work and returns every queued task, in order.
    #[must_use]
    pub fn seal(&self) -> Vec<Box<dyn DeferredTask>> {
        let mut queue = self.queue.lock();
        queue.sealed = true;
        queue.tasks.drain(..).collect()
    }

    /// Runs queued tasks in FIFO order until the queue is empty.
    ///
    /// Tasks queued while draining run before this returns. A failing or
    /// panicking task is logged and recorded; with
    /// [`DrainPolicy::ContinueOnFailure`] the remaining tasks still run, with
    /// [`DrainPolicy::AbortOnFailure`] they are discarded.
    pub async fn execute_tasks(&self, ctx: &ProcessingContext, policy: DrainPolicy) -> DrainReport {
        let tenant = ctx.tenant().to_string();
        let mut report = DrainReport::default();

        loop {
            let next = self.queue.lock().tasks.pop_front();
            let Some(task) = next else {
                break;
            };

            report.executed += 1;
            let outcome = AssertUnwindSafe(task.execute(ctx)).catch_unwind().await;
            let error = match outcome {
                Ok(Ok(())) => {
                    debug!(tenant = %tenant, task = task.name(), "deferred task completed");
                    metrics::counter!("deferred_tasks_executed_total", "tenant" => tenant.clone())
                        .increment(1);
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };

            warn!(tenant = %tenant, task = task.name(), error = %error, "deferred task failed");
            metrics::counter!("deferred_task_failures_total", "tenant" => tenant.clone())
                .increment(1);
            report.failures.push(TaskFailure {
                task: task.name().to_string(),
                error,
            });

            if policy == DrainPolicy::AbortOnFailure {
                report.discarded = self.take_pending().len();
                if report.discarded > 0 {
                    warn!(
                        tenant = %tenant,
                        discarded = report.discarded,
                        "drain aborted, remaining deferred tasks discarded"
                    );
                }
                break;
            }
        }

        report
    }
}

impl fmt::Debug for DeferredTaskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredTaskEngine")
            .field("pending", &self.pending_count())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
