//! Shellhost core: tenant identities, shell settings, and the registry and
//! resolver contracts shared by the host and its transports.

pub mod context;
pub mod traits;
pub mod types;

pub use context::{normalize_host, RequestHead};
pub use traits::{TenantRegistry, TenantResolver};
pub use types::{ShellSettings, TenantId, TenantState};
