//! Request dispatcher: resolve the tenant, activate its shell, run the
//! request in a scope, then drain deferred work in a fresh scope.

use std::future::Future;
use std::sync::Arc;

use http::StatusCode;
use shellhost_core::{RequestHead, TenantId, TenantResolver};
use tracing::{debug, info_span, warn, Instrument};

use super::config::{DrainPolicy, HostConfig};
use super::deferred::DrainReport;
use super::drain::{drain_in_fresh_scope, DrainJob};
use super::worker::WorkerHandle;
use crate::shell::context::{ActivationError, ShellContext};
use crate::shell::host::{error_chain, HostError, ShellHost};
use crate::shell::scope::RequestServices;
use crate::traits::DeferredTask;

/// Errors that fail a single dispatched request.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Shell(#[from] HostError),
    #[error("failed to open a request scope for tenant {tenant}")]
    ScopeCreation {
        tenant: TenantId,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Activation(#[from] ActivationError),
    #[error("request stage failed")]
    Next(#[source] anyhow::Error),
}

impl DispatchError {
    /// HTTP status used when this error ends a request.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Shell(_) | Self::ScopeCreation { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Activation(_) | Self::Next(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// What happened to the deferred work of a served request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Nothing was queued; no drain scope was opened.
    Idle,
    /// Drained before the dispatcher returned.
    Completed(DrainReport),
    /// Handed to the background drain worker.
    Queued,
    /// The drain scope could not be opened. The request itself succeeded.
    Failed(String),
}

/// Result of a dispatch that did not fail.
#[derive(Debug)]
pub enum Dispatched<T> {
    /// No tenant matched. The next stage was not called.
    Unmatched,
    Served {
        tenant: TenantId,
        response: T,
        drain: DrainOutcome,
    },
}

impl<T> Dispatched<T> {
    #[must_use]
    pub fn is_unmatched(&self) -> bool {
        matches!(self, Self::Unmatched)
    }
}

/// Per-request pipeline in front of tenant code.
///
/// Shared by every request; holds no per-request state.
pub struct ShellDispatcher {
    host: Arc<ShellHost>,
    resolver: Arc<dyn TenantResolver>,
    policy: DrainPolicy,
    drain_worker: Option<WorkerHandle<DrainJob>>,
}

impl ShellDispatcher {
    /// Dispatcher resolving tenants through the host's running shell table.
    #[must_use]
    pub fn new(host: Arc<ShellHost>, config: &HostConfig) -> Self {
        let resolver: Arc<dyn TenantResolver> = host.shell_table();
        Self {
            host,
            resolver,
            policy: config.drain_policy,
            drain_worker: None,
        }
    }

    /// Replaces the tenant resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn TenantResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Hands drains to a background worker instead of running them inline.
    /// Falls back to an inline drain when the worker's queue is full.
    #[must_use]
    pub fn with_drain_worker(mut self, worker: WorkerHandle<DrainJob>) -> Self {
        self.drain_worker = Some(worker);
        self
    }

    #[must_use]
    pub fn host(&self) -> &Arc<ShellHost> {
        &self.host
    }

    /// Runs one request through its tenant's shell.
    ///
    /// `next` is called at most once, with the services of the request
    /// scope, after the shell is activated. Deferred tasks queued during
    /// `next` are drained in a new scope once the request scope has closed,
    /// and only if `next` succeeded.
    ///
    /// # Errors
    ///
    /// `DispatchError` if the shell cannot be loaded, the scope cannot be
    /// opened, activation fails, or `next` fails. The request scope is
    /// closed in every case.
    pub async fn dispatch<F, Fut, T>(
        &self,
        head: &RequestHead<'_>,
        next: F,
    ) -> Result<Dispatched<T>, DispatchError>
    where
        F: FnOnce(RequestServices) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Err(e) = self.host.initialize().await {
            warn!(error = %error_chain(&e), "shell host initialization failed");
        }

        let Some(settings) = self.resolver.resolve(head) else {
            debug!(host = ?head.host, path = head.path, "no tenant matched request");
            return Ok(Dispatched::Unmatched);
        };
        let tenant = settings.name.clone();
        let span = info_span!("shell_request", tenant = %tenant);

        async move {
            let shell = self.host.get_context(&settings).await?;
            let scope = shell
                .create_scope()
                .await
                .map_err(|source| DispatchError::ScopeCreation {
                    tenant: tenant.clone(),
                    source,
                })?;
            let services = scope.services();

            shell.ensure_activated(&services).await?;
            let response = next(services).await.map_err(DispatchError::Next)?;

            let pending = scope.close_and_take_pending();

            let drain = self.drain(shell, pending).await;
            Ok(Dispatched::Served {
                tenant,
                response,
                drain,
            })
        }
        .instrument(span)
        .await
    }

    async fn drain(&self, shell: Arc<ShellContext>, tasks: Vec<Box<dyn DeferredTask>>) -> DrainOutcome {
        if tasks.is_empty() {
            return DrainOutcome::Idle;
        }

        let (shell, tasks) = match &self.drain_worker {
            Some(worker) => match worker.try_submit(DrainJob { shell, tasks }) {
                Ok(()) => return DrainOutcome::Queued,
                Err(job) => {
                    warn!(tasks = job.tasks.len(), "drain worker unavailable, draining inline");
                    (job.shell, job.tasks)
                }
            },
            None => (shell, tasks),
        };

        match drain_in_fresh_scope(&shell, tasks, self.policy).await {
            Ok(report) => DrainOutcome::Completed(report),
            Err(e) => {
                let message = format!("{e:#}");
                warn!(error = %message, "failed to open drain scope");
                DrainOutcome::Failed(message)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use parking_lot::Mutex;
    use shellhost_core::ShellSettings;
    use uuid::Uuid;

    use super::*;
    use crate::service::deferred::ProcessingContext;
    use crate::shell::source::StaticTenantRegistry;
    use crate::shell::testing::{Recorder, ScriptedFactory};
    use crate::traits::FnTask;

    type Log = Arc<Mutex<Vec<(String, Uuid)>>>;

    fn tenants() -> Vec<ShellSettings> {
        vec![
            ShellSettings::new("a").with_host("a.example.com"),
            ShellSettings::new("b").with_host("b.example.com"),
        ]
    }

    fn dispatcher_with(factory: ScriptedFactory) -> (Arc<ShellDispatcher>, Arc<Recorder>) {
        let recorder = factory.recorder();
        let host = Arc::new(ShellHost::new(
            Arc::new(StaticTenantRegistry::new(tenants())),
            Arc::new(factory),
        ));
        let dispatcher = ShellDispatcher::new(host, &HostConfig::default());
        (Arc::new(dispatcher), recorder)
    }

    fn head(host: &str) -> RequestHead<'_> {
        RequestHead::new(Some(host), "/")
    }

    type Ready = futures_util::future::Ready<anyhow::Result<()>>;

    /// Task that records its name and the scope it ran in.
    fn record(log: &Log, name: &'static str) -> FnTask<impl Fn(ProcessingContext) -> Ready + Send + Sync> {
        let log = Arc::clone(log);
        FnTask::new(name, move |ctx: ProcessingContext| {
            log.lock().push((name.to_string(), ctx.services().scope_id()));
            futures_util::future::ready(Ok(()))
        })
    }

    fn names(log: &Log) -> Vec<String> {
        log.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_activate_exactly_once() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());
        recorder.activation_delay_ms.store(50, Ordering::SeqCst);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let dispatcher = Arc::clone(&dispatcher);
            let recorder = Arc::clone(&recorder);
            handles.push(tokio::spawn(async move {
                dispatcher
                    .dispatch(&head("a.example.com"), |_services| async move {
                        // Forwarded only after the hook completed.
                        Ok(recorder.events().len())
                    })
                    .await
            }));
        }

        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Dispatched::Served { response, .. } => assert_eq!(response, 2),
                Dispatched::Unmatched => panic!("tenant should match"),
            }
        }
        assert_eq!(recorder.events(), vec!["activating:a", "activated:a"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn activation_of_one_tenant_does_not_block_another() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());
        recorder.activation_delay_ms.store(300, Ordering::SeqCst);

        let slow = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .dispatch(&head("a.example.com"), |_| async { Ok(()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        recorder.activation_delay_ms.store(0, Ordering::SeqCst);

        let started = tokio::time::Instant::now();
        let fast = dispatcher
            .dispatch(&head("b.example.com"), |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(!fast.is_unmatched());
        assert!(started.elapsed() < Duration::from_millis(200));

        slow.await.unwrap().unwrap();
        let host = dispatcher.host();
        assert!(host.loaded_context(&TenantId::new("a")).unwrap().is_activated());
        assert!(host.loaded_context(&TenantId::new("b")).unwrap().is_activated());
    }

    #[tokio::test]
    async fn no_drain_scope_without_pending_tasks() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());

        let outcome = dispatcher
            .dispatch(&head("a.example.com"), |_| async { Ok("ok") })
            .await
            .unwrap();

        let Dispatched::Served { response, drain, .. } = outcome else {
            panic!("tenant should match");
        };
        assert_eq!(response, "ok");
        assert_eq!(drain, DrainOutcome::Idle);
        assert_eq!(recorder.scopes_opened.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.open_scopes(), 0);
    }

    #[tokio::test]
    async fn queued_tasks_drain_in_order_in_a_separate_scope() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());
        let log: Log = Arc::default();
        let request_scope = Arc::new(Mutex::new(None));

        let outcome = dispatcher
            .dispatch(&head("a.example.com"), {
                let log = Arc::clone(&log);
                let request_scope = Arc::clone(&request_scope);
                move |services: RequestServices| async move {
                    *request_scope.lock() = Some(services.scope_id());
                    let engine = services.deferred_tasks()?;
                    for name in ["1", "2", "3", "4", "5"] {
                        engine.add(record(&log, name))?;
                    }
                    Ok::<_, anyhow::Error>(())
                }
            })
            .await
            .unwrap();

        let Dispatched::Served { drain, .. } = outcome else {
            panic!("tenant should match");
        };
        let DrainOutcome::Completed(report) = drain else {
            panic!("expected an inline drain, got {drain:?}");
        };
        assert_eq!(report.executed, 5);
        assert!(report.is_clean());
        assert_eq!(names(&log), vec!["1", "2", "3", "4", "5"]);

        let request_scope = request_scope.lock().unwrap();
        let drain_scopes: Vec<Uuid> = log.lock().iter().map(|(_, id)| *id).collect();
        assert!(drain_scopes.iter().all(|id| *id == drain_scopes[0]));
        assert_ne!(drain_scopes[0], request_scope);
        assert_eq!(recorder.scopes_opened.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.open_scopes(), 0);
    }

    #[tokio::test]
    async fn drain_scope_opens_after_request_scope_closed() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());
        let observed = Arc::new(Mutex::new(None));

        let task = {
            let observed = Arc::clone(&observed);
            let recorder = Arc::clone(&recorder);
            FnTask::new("check", move |_ctx: ProcessingContext| {
                *observed.lock() = Some(recorder.open_scopes());
                futures_util::future::ready(Ok(()))
            })
        };

        dispatcher
            .dispatch(&head("a.example.com"), move |services: RequestServices| async move {
                services.deferred_tasks()?.add(task)?;
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap();

        // Only the drain scope itself was open while the task ran.
        assert_eq!(*observed.lock(), Some(1));
    }

    #[tokio::test]
    async fn two_concurrent_requests_share_one_activation() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());
        recorder.activation_delay_ms.store(20, Ordering::SeqCst);

        let plain = head("a.example.com");
        let with_port = head("A.EXAMPLE.COM:443");
        let (first, second) = tokio::join!(
            dispatcher.dispatch(&plain, |_| async { Ok(StatusCode::OK) }),
            dispatcher.dispatch(&with_port, |_| async { Ok(StatusCode::OK) }),
        );

        for outcome in [first.unwrap(), second.unwrap()] {
            let Dispatched::Served { response, tenant, .. } = outcome else {
                panic!("tenant should match");
            };
            assert_eq!(response, StatusCode::OK);
            assert_eq!(tenant.as_str(), "a");
        }
        assert_eq!(recorder.events(), vec!["activating:a", "activated:a"]);
        let shell = dispatcher.host().loaded_context(&TenantId::new("a")).unwrap();
        assert!(shell.is_activated());
    }

    #[tokio::test]
    async fn unmatched_request_is_not_forwarded() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());
        let called = Arc::new(Mutex::new(false));

        let outcome = dispatcher
            .dispatch(&head("unknown.test"), {
                let called = Arc::clone(&called);
                move |_| async move {
                    *called.lock() = true;
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert!(outcome.is_unmatched());
        assert!(!*called.lock());
        assert_eq!(recorder.scopes_opened.load(Ordering::SeqCst), 0);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn tasks_queued_during_drain_run_before_dispatch_returns() {
        let (dispatcher, _recorder) = dispatcher_with(ScriptedFactory::default());
        let log: Log = Arc::default();

        let spawner = {
            let log = Arc::clone(&log);
            FnTask::new("2", move |ctx: ProcessingContext| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push(("2".to_string(), ctx.services().scope_id()));
                    ctx.defer(record(&log, "4"))?;
                    Ok::<_, anyhow::Error>(())
                }
            })
        };

        let outcome = dispatcher
            .dispatch(&head("a.example.com"), |services: RequestServices| {
                let log = Arc::clone(&log);
                async move {
                    let engine = services.deferred_tasks()?;
                    engine.add(record(&log, "1"))?;
                    engine.add(spawner)?;
                    engine.add(record(&log, "3"))?;
                    Ok::<_, anyhow::Error>(())
                }
            })
            .await
            .unwrap();

        let Dispatched::Served {
            drain: DrainOutcome::Completed(report),
            ..
        } = outcome
        else {
            panic!("expected an inline drain");
        };
        assert_eq!(report.executed, 4);
        let ran = names(&log);
        assert_eq!(ran.len(), 4);
        for name in ["1", "2", "3", "4"] {
            assert!(ran.iter().any(|r| r == name), "task {name} did not run");
        }
    }

    #[tokio::test]
    async fn failed_activation_fails_the_request_and_is_retried() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());
        recorder.fail_activations.store(1, Ordering::SeqCst);

        let err = dispatcher
            .dispatch(&head("a.example.com"), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Activation(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let shell = dispatcher.host().loaded_context(&TenantId::new("a")).unwrap();
        assert!(!shell.is_activated());
        assert_eq!(recorder.open_scopes(), 0);

        dispatcher
            .dispatch(&head("a.example.com"), |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(shell.is_activated());
        assert_eq!(
            recorder.events(),
            vec!["activating:a", "activating:a", "activated:a"]
        );
    }

    #[tokio::test]
    async fn failed_stage_releases_scope_and_skips_drain() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());
        let log: Log = Arc::default();

        let err = dispatcher
            .dispatch(&head("a.example.com"), |services: RequestServices| {
                let log = Arc::clone(&log);
                async move {
                    services.deferred_tasks()?.add(record(&log, "never"))?;
                    Err::<(), _>(anyhow::anyhow!("handler failed"))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Next(_)));
        assert!(log.lock().is_empty());
        assert_eq!(recorder.scopes_opened.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.open_scopes(), 0);
    }

    #[tokio::test]
    async fn scope_creation_failure_is_reported_per_request() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());
        recorder.fail_scopes.store(1, Ordering::SeqCst);

        let err = dispatcher
            .dispatch(&head("a.example.com"), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ScopeCreation { .. }));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let ok = dispatcher
            .dispatch(&head("b.example.com"), |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(!ok.is_unmatched());
    }

    #[tokio::test]
    async fn shell_build_failure_maps_to_service_unavailable() {
        let (dispatcher, _recorder) = dispatcher_with(ScriptedFactory::failing_for(["a"]));

        let err = dispatcher
            .dispatch(&head("a.example.com"), |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Shell(HostError::Build { .. })));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn background_worker_receives_pending_tasks() {
        let factory = ScriptedFactory::default();
        let recorder = factory.recorder();
        let host = Arc::new(ShellHost::new(
            Arc::new(StaticTenantRegistry::new(tenants())),
            Arc::new(factory),
        ));
        let config = HostConfig::default();
        let worker = crate::service::drain::DrainWorker::start(&config);
        let dispatcher = ShellDispatcher::new(host, &config).with_drain_worker(worker.handle().unwrap());
        let log: Log = Arc::default();

        let outcome = dispatcher
            .dispatch(&head("a.example.com"), |services: RequestServices| {
                let log = Arc::clone(&log);
                async move {
                    services.deferred_tasks()?.add(record(&log, "bg"))?;
                    Ok::<_, anyhow::Error>(())
                }
            })
            .await
            .unwrap();

        let Dispatched::Served { drain, .. } = outcome else {
            panic!("tenant should match");
        };
        assert_eq!(drain, DrainOutcome::Queued);
        for _ in 0..50 {
            if !log.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(names(&log), vec!["bg"]);
        assert_eq!(recorder.scopes_opened.load(Ordering::SeqCst), 2);
    }

    fn crash() {
        panic!("handler crashed");
    }

    #[tokio::test]
    async fn panicking_stage_releases_scope_and_skips_drain() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());
        let log: Log = Arc::default();

        let request = {
            let dispatcher = Arc::clone(&dispatcher);
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                dispatcher
                    .dispatch(&head("a.example.com"), |services: RequestServices| async move {
                        services.deferred_tasks()?.add(record(&log, "never"))?;
                        crash();
                        Ok::<_, anyhow::Error>(())
                    })
                    .await
            })
        };

        let join = request.await.unwrap_err();
        assert!(join.is_panic());
        assert!(log.lock().is_empty());
        assert_eq!(recorder.scopes_opened.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.open_scopes(), 0);
    }

    #[tokio::test]
    async fn cancelled_dispatch_releases_scope_and_skips_drain() {
        let (dispatcher, recorder) = dispatcher_with(ScriptedFactory::default());
        let log: Log = Arc::default();
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

        let request = {
            let dispatcher = Arc::clone(&dispatcher);
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                dispatcher
                    .dispatch(&head("a.example.com"), |services: RequestServices| async move {
                        services.deferred_tasks()?.add(record(&log, "never"))?;
                        let _ = entered_tx.send(());
                        std::future::pending::<()>().await;
                        Ok::<_, anyhow::Error>(())
                    })
                    .await
            })
        };

        entered_rx.await.unwrap();
        assert_eq!(recorder.open_scopes(), 1);
        request.abort();
        assert!(request.await.unwrap_err().is_cancelled());

        assert!(log.lock().is_empty());
        assert_eq!(recorder.scopes_opened.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.open_scopes(), 0);
        let shell = dispatcher.host().loaded_context(&TenantId::new("a")).unwrap();
        assert_eq!(shell.open_scopes(), 0);
    }

    #[tokio::test]
    async fn work_queued_through_a_leaked_handle_is_refused() {
        let (dispatcher, _recorder) = dispatcher_with(ScriptedFactory::default());
        let log: Log = Arc::default();
        let leaked = Arc::new(Mutex::new(None));

        dispatcher
            .dispatch(&head("a.example.com"), {
                let leaked = Arc::clone(&leaked);
                move |services: RequestServices| async move {
                    *leaked.lock() = Some(services);
                    Ok::<_, anyhow::Error>(())
                }
            })
            .await
            .unwrap();

        let services = leaked.lock().take().unwrap();
        assert!(services.is_closed());
        let late = ProcessingContext::new(services, Arc::new(ShellSettings::new("a")))
            .defer(record(&log, "late"));
        assert!(matches!(late, Err(crate::shell::ScopeError::Closed { .. })));
        assert!(log.lock().is_empty());
    }
}
