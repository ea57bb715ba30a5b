use serde::{Deserialize, Serialize};

/// Where the deferred-task drain of a request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DrainMode {
    /// Drain before the dispatcher returns, after the request scope closed.
    #[default]
    Inline,
    /// Hand the drain to the background drain worker and return immediately.
    Background,
}

/// What a drain does after a deferred task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Report the failure and keep draining.
    #[default]
    ContinueOnFailure,
    /// Report the failure and discard the rest of the queue.
    AbortOnFailure,
}

/// Host-level configuration for tenant dispatch and deferred work.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Unique identifier for this host process.
    pub node_id: String,
    pub drain_mode: DrainMode,
    pub drain_policy: DrainPolicy,
    /// Capacity of the background drain worker's job channel.
    pub drain_queue_capacity: usize,
    /// Interval between background drain worker status ticks in milliseconds.
    pub drain_tick_interval_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            drain_mode: DrainMode::Inline,
            drain_policy: DrainPolicy::ContinueOnFailure,
            drain_queue_capacity: 256,
            drain_tick_interval_ms: 60_000,
        }
    }
}
