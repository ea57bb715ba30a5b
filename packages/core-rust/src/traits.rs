use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RequestHead;
use crate::types::ShellSettings;

/// Read-only source of tenant configuration.
///
/// Adding, removing and reloading tenants happens outside the host; the host
/// only lists what is currently known.
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// List every known tenant with its configuration.
    async fn list_known_tenants(&self) -> anyhow::Result<Vec<ShellSettings>>;
}

/// Maps an inbound request to the tenant that should serve it.
///
/// Implementations must be pure and safe to call concurrently: no I/O, no
/// activation, no mutation visible to other requests.
pub trait TenantResolver: Send + Sync {
    /// Returns the matching tenant's settings, or `None` when no tenant matches.
    fn resolve(&self, head: &RequestHead<'_>) -> Option<Arc<ShellSettings>>;
}
