//! Tower middleware in front of tenant code.
//!
//! - [`shell_dispatch`]: tenant resolution, activation, scoped dispatch and drain

pub mod shell_dispatch;

pub use shell_dispatch::{ShellDispatchLayer, ShellDispatchService};
