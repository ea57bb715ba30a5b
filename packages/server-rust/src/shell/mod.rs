//! Tenant shells: loading, matching, activation, and request scopes.
//!
//! - **Host** (`host`): owns every tenant's shell and loads them lazily
//! - **Table** (`table`): matches a request to a running shell
//! - **Context** (`context`): per-tenant state and one-time activation
//! - **Scope** (`scope`): per-request service scope with its deferred queue
//! - **Source** (`source`): tenant registries
//! - **Container** (`container`): the built-in shell container

pub mod container;
pub mod context;
pub mod host;
pub mod scope;
pub mod source;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use container::DefaultShellContainer;
pub use context::{ActivationError, ActivationState, ShellContext};
pub use host::{HostError, ShellHost};
pub use scope::{RequestServices, ScopeBuilder, ScopeError, ServiceScope};
pub use source::{JsonFileTenantRegistry, StaticTenantRegistry};
pub use table::RunningShellTable;
