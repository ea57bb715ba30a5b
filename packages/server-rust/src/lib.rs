//! Shellhost server: per-tenant shells with lazy one-time activation, scoped
//! request dispatch, and deferred-task drain, served over axum.

pub mod network;
pub mod service;
pub mod shell;
pub mod traits;

pub use service::{
    DispatchError, Dispatched, DrainOutcome, HostConfig, ProcessingContext, ShellDispatchLayer,
    ShellDispatcher,
};
pub use shell::{RequestServices, ServiceScope, ShellContext, ShellHost};
pub use traits::{
    ActivationHook, DeferredTask, FnTask, NoopActivationHook, ScopeFactory, ShellComponents,
    ShellContainerFactory,
};
