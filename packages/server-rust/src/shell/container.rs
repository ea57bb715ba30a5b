//! Built-in shell container for tenants without application services.

use std::sync::Arc;

use async_trait::async_trait;
use shellhost_core::ShellSettings;
use tracing::info;

use super::scope::{RequestServices, ServiceScope};
use crate::traits::{ActivationHook, ScopeFactory, ShellComponents, ShellContainerFactory};

/// Container whose scopes expose the tenant's [`ShellSettings`] and nothing
/// else. Activation only logs.
///
/// Used by the `shellhost` binary when no application container is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultShellContainer;

#[async_trait]
impl ShellContainerFactory for DefaultShellContainer {
    async fn build(&self, _settings: &ShellSettings) -> anyhow::Result<ShellComponents> {
        Ok(ShellComponents {
            scope_factory: Arc::new(SettingsScopeFactory),
            activation_hook: Arc::new(LoggingActivationHook),
        })
    }
}

#[derive(Debug)]
struct SettingsScopeFactory;

#[async_trait]
impl ScopeFactory for SettingsScopeFactory {
    async fn create_scope(&self, settings: &ShellSettings) -> anyhow::Result<ServiceScope> {
        Ok(ServiceScope::builder(settings.name.clone())
            .service(Arc::new(settings.clone()))
            .build())
    }
}

#[derive(Debug)]
struct LoggingActivationHook;

#[async_trait]
impl ActivationHook for LoggingActivationHook {
    async fn activating(&self, services: &RequestServices) -> anyhow::Result<()> {
        info!(tenant = %services.tenant(), scope_id = %services.scope_id(), "activating shell");
        Ok(())
    }

    async fn activated(&self, services: &RequestServices) -> anyhow::Result<()> {
        info!(tenant = %services.tenant(), "shell ready");
        Ok(())
    }
}
