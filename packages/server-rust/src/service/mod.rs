//! Request dispatch and deferred work.
//!
//! 1. **Dispatch** (`dispatcher`): resolve, activate, run the request in a scope
//! 2. **Deferred tasks** (`deferred`): the scope-local task queue and its drain loop
//! 3. **Drain** (`drain`): fresh-scope drain, inline or on the background worker
//! 4. **Middleware** (`middleware`): the dispatcher as a tower layer
//! 5. **Lifecycle** (`registry`, `worker`): managed services and background workers

pub mod config;
pub mod deferred;
pub mod dispatcher;
pub mod drain;
pub mod middleware;
pub mod registry;
pub mod worker;

// Re-export key types for convenient access.
pub use config::{DrainMode, DrainPolicy, HostConfig};
pub use deferred::{DeferredTaskEngine, DrainReport, EngineSealed, ProcessingContext, TaskFailure};
pub use dispatcher::{DispatchError, Dispatched, DrainOutcome, ShellDispatcher};
pub use drain::{drain_in_fresh_scope, DrainJob, DrainRunnable, DrainWorker};
pub use middleware::{ShellDispatchLayer, ShellDispatchService};
pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
pub use worker::{BackgroundRunnable, BackgroundWorker, WorkerHandle};
