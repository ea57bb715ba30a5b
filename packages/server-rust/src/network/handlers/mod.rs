//! Handlers served by the host itself, outside any tenant.
//!
//! Defines `AppState`, the state carried through axum extractors.

pub mod health;

pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::shell::ShellHost;

/// Shared state for the health handlers. Cloning copies `Arc`s only.
#[derive(Clone)]
pub struct AppState {
    /// Tenant shells, for shell and activation counts.
    pub host: Arc<ShellHost>,
    /// Health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// Process start, for uptime.
    pub start_time: Instant,
}
