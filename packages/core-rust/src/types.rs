use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque, comparable key identifying a tenant ("shell").
///
/// Backed by `Arc<str>` so cloning into maps, spans and processing contexts
/// never copies the name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Arc<str>);

impl TenantId {
    /// Creates a tenant id from any string-like value.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// Returns the tenant name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Lifecycle state of a tenant as recorded by its configuration source.
///
/// Only `Running` shells are loaded by the host and matched by the shell table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantState {
    /// Configured but not yet set up.
    Uninitialized,
    /// Serving requests.
    #[default]
    Running,
    /// Known but switched off by an operator.
    Disabled,
}

/// Configuration of a single tenant.
///
/// `request_url_host` and `request_url_prefix` drive request matching. A
/// shell with neither is the fallback shell for otherwise unmatched traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellSettings {
    /// Unique tenant name.
    pub name: TenantId,
    /// Host this tenant answers on. Either an exact host (`a.example.com`)
    /// or a wildcard (`*.example.com`).
    #[serde(default)]
    pub request_url_host: Option<String>,
    /// First path segment this tenant is mounted under, without slashes.
    #[serde(default)]
    pub request_url_prefix: Option<String>,
    /// Lifecycle state.
    #[serde(default)]
    pub state: TenantState,
    /// Free-form tenant configuration handed to the tenant's container.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ShellSettings {
    /// Creates running settings with no host or prefix binding.
    pub fn new(name: impl Into<TenantId>) -> Self {
        Self {
            name: name.into(),
            request_url_host: None,
            request_url_prefix: None,
            state: TenantState::Running,
            extra: BTreeMap::new(),
        }
    }

    /// Binds the tenant to a request host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.request_url_host = Some(host.into());
        self
    }

    /// Mounts the tenant under a URL prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.request_url_prefix = Some(prefix.into());
        self
    }

    /// Overrides the lifecycle state.
    #[must_use]
    pub fn with_state(mut self, state: TenantState) -> Self {
        self.state = state;
        self
    }

    /// Returns true when the shell should be loaded and served.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == TenantState::Running
    }

    /// Returns true for the host-less, prefix-less fallback shell.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.request_url_host.as_deref().map_or(true, str::is_empty)
            && self.request_url_prefix.as_deref().map_or(true, str::is_empty)
    }
}
