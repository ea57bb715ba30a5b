use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use shellhost_core::ShellSettings;

use crate::service::deferred::ProcessingContext;
use crate::shell::scope::{RequestServices, ServiceScope};

/// A tenant's service container: produces request scopes on demand.
/// Implementations: the built-in [`DefaultShellContainer`](crate::shell::DefaultShellContainer),
/// application containers, test doubles.
#[async_trait]
pub trait ScopeFactory: Send + Sync {
    /// Open a new scope. Each call must return an independent scope with its
    /// own deferred task engine.
    async fn create_scope(&self, settings: &ShellSettings) -> anyhow::Result<ServiceScope>;
}

/// One-time activation work for a shell.
///
/// Both calls receive the services of the request that triggered activation,
/// so anything they resolve lives exactly as long as that request's scope.
#[async_trait]
pub trait ActivationHook: Send + Sync {
    /// Called first, before any request for the tenant is forwarded.
    async fn activating(&self, services: &RequestServices) -> anyhow::Result<()>;

    /// Called after `activating` succeeded.
    async fn activated(&self, services: &RequestServices) -> anyhow::Result<()>;
}

/// Hook that does nothing. Used for shells without activation work.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopActivationHook;

#[async_trait]
impl ActivationHook for NoopActivationHook {
    async fn activating(&self, _services: &RequestServices) -> anyhow::Result<()> {
        Ok(())
    }

    async fn activated(&self, _services: &RequestServices) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything the host needs to run one tenant.
#[derive(Clone)]
pub struct ShellComponents {
    pub scope_factory: Arc<dyn ScopeFactory>,
    pub activation_hook: Arc<dyn ActivationHook>,
}

/// Builds the components of a shell from its settings.
///
/// Called once per tenant when the host loads it, and again after the shell
/// was released or failed to build.
#[async_trait]
pub trait ShellContainerFactory: Send + Sync {
    async fn build(&self, settings: &ShellSettings) -> anyhow::Result<ShellComponents>;
}

/// Opaque unit of work queued during a request and executed after it.
#[async_trait]
pub trait DeferredTask: Send + Sync {
    /// Name used in logs and drain reports.
    fn name(&self) -> &str {
        "deferred-task"
    }

    /// Run the task against the drain scope.
    async fn execute(&self, ctx: &ProcessingContext) -> anyhow::Result<()>;
}

/// Adapts a closure into a [`DeferredTask`].
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnTask<F>
where
    F: Fn(ProcessingContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> DeferredTask for FnTask<F>
where
    F: Fn(ProcessingContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &ProcessingContext) -> anyhow::Result<()> {
        (self.f)(ctx.clone()).await
    }
}
