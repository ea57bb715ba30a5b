use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::config::HostConfig;

// ---------------------------------------------------------------------------
// ServiceContext
// ---------------------------------------------------------------------------

/// Context handed to every service on `init`.
#[derive(Debug, Clone, Default)]
pub struct ServiceContext {
    pub config: Arc<HostConfig>,
}

// ---------------------------------------------------------------------------
// ManagedService trait
// ---------------------------------------------------------------------------

/// A host-level component with a start/reload/stop lifecycle.
///
/// The shell host and the background drain worker implement this.
#[async_trait]
pub trait ManagedService: Send + Sync {
    /// Name used in lifecycle logs (e.g., `"shell-host"`).
    fn name(&self) -> &'static str;

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// Return to the just-constructed state so the next use reloads (e.g.,
    /// drop every loaded shell).
    async fn reset(&self) -> anyhow::Result<()>;

    /// Stop the service. If `terminate` is true, skip graceful cleanup.
    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Ordered set of managed services.
///
/// `init_all` and `reset_all` walk services in registration order;
/// `shutdown_all` walks them in reverse, so a service registered after the
/// host (the drain worker) stops while the host is still up.
pub struct ServiceRegistry {
    services: RwLock<Vec<Arc<dyn ManagedService>>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: RwLock::new(Vec::new()),
        }
    }

    /// Registers a service that other components already hold an `Arc` to.
    /// The registry drives that same instance.
    pub fn register_shared<T: ManagedService + 'static>(&self, service: Arc<T>) {
        self.services.write().push(service);
    }

    fn snapshot(&self) -> Vec<Arc<dyn ManagedService>> {
        self.services.read().clone()
    }

    /// Initializes every service in registration order.
    ///
    /// # Errors
    ///
    /// Stops at, and returns, the first `init` failure.
    pub async fn init_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        for service in self.snapshot() {
            debug!(service = service.name(), "initializing");
            service.init(ctx).await?;
        }
        Ok(())
    }

    /// Resets every service in registration order.
    ///
    /// # Errors
    ///
    /// Stops at, and returns, the first `reset` failure.
    pub async fn reset_all(&self) -> anyhow::Result<()> {
        for service in self.snapshot() {
            debug!(service = service.name(), "resetting");
            service.reset().await?;
        }
        Ok(())
    }

    /// Shuts every service down in reverse registration order.
    ///
    /// # Errors
    ///
    /// Stops at, and returns, the first `shutdown` failure.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        for service in self.snapshot().into_iter().rev() {
            debug!(service = service.name(), terminate, "shutting down");
            service.shutdown(terminate).await?;
        }
        Ok(())
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
