//! Tenant registries: where the host learns which tenants exist.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use shellhost_core::{ShellSettings, TenantId, TenantRegistry};

/// In-memory registry. Mutated by whoever owns it; the host only reads it.
#[derive(Debug, Default)]
pub struct StaticTenantRegistry {
    tenants: RwLock<Vec<ShellSettings>>,
}

impl StaticTenantRegistry {
    #[must_use]
    pub fn new(tenants: Vec<ShellSettings>) -> Self {
        Self {
            tenants: RwLock::new(tenants),
        }
    }

    /// Adds a tenant or replaces the one with the same name.
    pub fn upsert(&self, settings: ShellSettings) {
        let mut tenants = self.tenants.write();
        match tenants.iter_mut().find(|t| t.name == settings.name) {
            Some(existing) => *existing = settings,
            None => tenants.push(settings),
        }
    }

    /// Removes a tenant. Returns true if it was present.
    pub fn remove(&self, tenant: &TenantId) -> bool {
        let mut tenants = self.tenants.write();
        let before = tenants.len();
        tenants.retain(|t| &t.name != tenant);
        tenants.len() != before
    }
}

#[async_trait]
impl TenantRegistry for StaticTenantRegistry {
    async fn list_known_tenants(&self) -> anyhow::Result<Vec<ShellSettings>> {
        Ok(self.tenants.read().clone())
    }
}

/// On-disk layout read by [`JsonFileTenantRegistry`].
#[derive(Debug, Deserialize)]
struct TenantFile {
    tenants: Vec<ShellSettings>,
}

/// Reads tenants from a JSON file of the form `{ "tenants": [ ... ] }`.
///
/// The file is re-read on every listing; the host lists once per
/// initialization.
#[derive(Debug, Clone)]
pub struct JsonFileTenantRegistry {
    path: PathBuf,
}

impl JsonFileTenantRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TenantRegistry for JsonFileTenantRegistry {
    async fn list_known_tenants(&self) -> anyhow::Result<Vec<ShellSettings>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let file: TenantFile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid tenant file {}", self.path.display()))?;

        let mut seen = std::collections::HashSet::new();
        for tenant in &file.tenants {
            if !seen.insert(tenant.name.clone()) {
                anyhow::bail!("duplicate tenant {} in {}", tenant.name, self.path.display());
            }
        }
        Ok(file.tenants)
    }
}
