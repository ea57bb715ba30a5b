//! Shell host: owns every tenant's [`ShellContext`] and loads them lazily.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use shellhost_core::{ShellSettings, TenantId, TenantRegistry};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::context::ShellContext;
use super::table::RunningShellTable;
use crate::service::registry::{ManagedService, ServiceContext};
use crate::traits::ShellContainerFactory;

/// Errors raised while loading shells.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to list known tenants")]
    Registry(#[source] anyhow::Error),
    #[error("failed to build shell for tenant {tenant}")]
    Build {
        tenant: TenantId,
        #[source]
        source: anyhow::Error,
    },
    #[error("tenant {tenant} is not running")]
    NotRunning { tenant: TenantId },
}

/// Owns the `TenantId -> ShellContext` map.
///
/// Created once per process and shared by reference (`Arc`) with the
/// dispatcher and health endpoints. Lifecycle is driven through
/// [`ManagedService`]: `init` loads the registry, `shutdown` drops every shell.
pub struct ShellHost {
    registry: Arc<dyn TenantRegistry>,
    factory: Arc<dyn ShellContainerFactory>,
    shells: DashMap<TenantId, Arc<ShellContext>>,
    failed: DashMap<TenantId, String>,
    table: Arc<RunningShellTable>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
}

impl ShellHost {
    #[must_use]
    pub fn new(registry: Arc<dyn TenantRegistry>, factory: Arc<dyn ShellContainerFactory>) -> Self {
        Self {
            registry,
            factory,
            shells: DashMap::new(),
            failed: DashMap::new(),
            table: Arc::new(RunningShellTable::new()),
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    /// The table of running shells, filled by [`initialize`](Self::initialize).
    /// This is the default tenant resolver.
    #[must_use]
    pub fn shell_table(&self) -> Arc<RunningShellTable> {
        Arc::clone(&self.table)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Loads every running tenant from the registry. Idempotent.
    ///
    /// A tenant whose shell fails to build is logged and recorded in
    /// [`failed_tenants`](Self::failed_tenants); it stays in the shell table
    /// so a later request retries the build. Other tenants are unaffected.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Registry` if the registry cannot be listed; the
    /// host then stays uninitialized and the next call tries again.
    pub async fn initialize(&self) -> Result<(), HostError> {
        if self.is_initialized() {
            return Ok(());
        }

        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        let tenants = self
            .registry
            .list_known_tenants()
            .await
            .map_err(HostError::Registry)?;
        let running: Vec<Arc<ShellSettings>> = tenants
            .into_iter()
            .filter(ShellSettings::is_running)
            .map(Arc::new)
            .collect();

        let built = join_all(running.iter().map(|settings| self.build_context(settings))).await;
        for (settings, result) in running.iter().zip(built) {
            match result {
                Ok(ctx) => {
                    self.shells.entry(settings.name.clone()).or_insert(ctx);
                    self.failed.remove(&settings.name);
                }
                Err(e) => {
                    let message = error_chain(&e);
                    warn!(tenant = %settings.name, error = %message, "failed to load shell");
                    self.failed.insert(settings.name.clone(), message);
                }
            }
        }

        self.table.replace_all(running);
        self.initialized.store(true, Ordering::Release);
        info!(
            shells = self.shells.len(),
            failed = self.failed.len(),
            "shell host initialized"
        );
        Ok(())
    }

    /// Returns the tenant's shell, building it on first access.
    ///
    /// Concurrent first accesses may build more than once, but only the
    /// first inserted context is ever returned.
    ///
    /// # Errors
    ///
    /// `HostError::NotRunning` for a tenant that is not running,
    /// `HostError::Build` if the tenant's container cannot be built.
    pub async fn get_context(&self, settings: &Arc<ShellSettings>) -> Result<Arc<ShellContext>, HostError> {
        if let Some(ctx) = self.shells.get(&settings.name) {
            return Ok(Arc::clone(ctx.value()));
        }
        if !settings.is_running() {
            return Err(HostError::NotRunning {
                tenant: settings.name.clone(),
            });
        }

        let built = match self.build_context(settings).await {
            Ok(ctx) => ctx,
            Err(e) => {
                self.failed.insert(settings.name.clone(), error_chain(&e));
                return Err(e);
            }
        };
        let ctx = Arc::clone(
            self.shells
                .entry(settings.name.clone())
                .or_insert(built)
                .value(),
        );
        self.failed.remove(&settings.name);
        debug!(tenant = %settings.name, "shell loaded on first access");
        Ok(ctx)
    }

    /// Returns the loaded shell for `tenant` without building it.
    #[must_use]
    pub fn loaded_context(&self, tenant: &TenantId) -> Option<Arc<ShellContext>> {
        self.shells.get(tenant).map(|entry| Arc::clone(entry.value()))
    }

    /// Drops a tenant's shell so the next access builds a fresh, inactive one.
    ///
    /// Requests already holding the old context finish on it.
    pub fn release_shell(&self, tenant: &TenantId) -> Option<Arc<ShellContext>> {
        let released = self.shells.remove(tenant).map(|(_, ctx)| ctx);
        if released.is_some() {
            info!(tenant = %tenant, "shell released");
        }
        released
    }

    #[must_use]
    pub fn shell_count(&self) -> usize {
        self.shells.len()
    }

    #[must_use]
    pub fn activated_count(&self) -> usize {
        self.shells
            .iter()
            .filter(|entry| entry.value().is_activated())
            .count()
    }

    /// Tenants whose last build failed, with the error message.
    #[must_use]
    pub fn failed_tenants(&self) -> Vec<(TenantId, String)> {
        let mut failed: Vec<_> = self
            .failed
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        failed.sort_by(|a, b| a.0.cmp(&b.0));
        failed
    }

    /// Drops every shell and forgets the loaded registry.
    fn clear(&self) {
        self.shells.clear();
        self.failed.clear();
        self.table.replace_all(Vec::new());
        self.initialized.store(false, Ordering::Release);
    }

    async fn build_context(&self, settings: &Arc<ShellSettings>) -> Result<Arc<ShellContext>, HostError> {
        let components = self
            .factory
            .build(settings)
            .await
            .map_err(|source| HostError::Build {
                tenant: settings.name.clone(),
                source,
            })?;
        Ok(Arc::new(ShellContext::new(Arc::clone(settings), components)))
    }
}

/// Renders an error and its sources as `outer: inner: root`.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[async_trait]
impl ManagedService for ShellHost {
    fn name(&self) -> &'static str {
        "shell-host"
    }

    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        self.initialize().await?;
        Ok(())
    }

    async fn reset(&self) -> anyhow::Result<()> {
        self.clear();
        Ok(())
    }

    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()> {
        let shells = self.shells.len();
        self.clear();
        info!(shells, terminate, "shell host stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
