//! Request scopes: a tenant's per-request service map plus its deferred task queue.
//!
//! [`ServiceScope`] is the owning handle; dropping it closes the scope. The
//! request sees a cloneable [`RequestServices`] view that stops resolving
//! once the owner closed the scope, so a leaked handle can never reach
//! services past the end of the request.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use shellhost_core::TenantId;
use uuid::Uuid;

use crate::service::deferred::DeferredTaskEngine;
use crate::traits::DeferredTask;

type Disposer = Box<dyn FnOnce() + Send>;

/// Errors raised when resolving through a scope.
#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("scope {scope_id} is closed")]
    Closed { scope_id: Uuid },
    #[error("service {type_name} is not registered in scope {scope_id}")]
    NotRegistered {
        type_name: &'static str,
        scope_id: Uuid,
    },
}

struct ScopeInner {
    id: Uuid,
    tenant: TenantId,
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    deferred: DeferredTaskEngine,
    closed: AtomicBool,
}

/// Cloneable view of a scope, bound to the request it serves.
#[derive(Clone)]
pub struct RequestServices {
    inner: Arc<ScopeInner>,
}

impl RequestServices {
    #[must_use]
    pub fn scope_id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.inner.tenant
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Resolve a service by type.
    ///
    /// # Errors
    ///
    /// `ScopeError::Closed` after the owning scope was closed,
    /// `ScopeError::NotRegistered` if the container never provided `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ScopeError> {
        self.ensure_open()?;
        self.inner
            .services
            .get(&TypeId::of::<T>())
            .and_then(|svc| svc.clone().downcast::<T>().ok())
            .ok_or(ScopeError::NotRegistered {
                type_name: type_name::<T>(),
                scope_id: self.inner.id,
            })
    }

    /// The deferred task queue of this scope.
    ///
    /// # Errors
    ///
    /// Returns `ScopeError::Closed` after the owning scope was closed; work
    /// queued then would never be drained.
    pub fn deferred_tasks(&self) -> Result<&DeferredTaskEngine, ScopeError> {
        self.ensure_open()?;
        Ok(&self.inner.deferred)
    }

    fn ensure_open(&self) -> Result<(), ScopeError> {
        if self.is_closed() {
            Err(ScopeError::Closed {
                scope_id: self.inner.id,
            })
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for RequestServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestServices")
            .field("scope_id", &self.inner.id)
            .field("tenant", &self.inner.tenant)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Owning handle of a request scope.
///
/// Closing (explicitly or by drop) marks the scope closed, runs the
/// registered disposers in reverse registration order, and releases the
/// shell's open-scope count.
pub struct ServiceScope {
    services: RequestServices,
    disposers: Vec<Disposer>,
    open_scopes: Option<Arc<AtomicU64>>,
}

impl ServiceScope {
    /// Starts building a scope for the given tenant.
    #[must_use]
    pub fn builder(tenant: TenantId) -> ScopeBuilder {
        ScopeBuilder {
            tenant,
            services: HashMap::new(),
            disposers: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.services.scope_id()
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        self.services.tenant()
    }

    /// Returns a handle to bind to the request.
    #[must_use]
    pub fn services(&self) -> RequestServices {
        self.services.clone()
    }

    /// The scope's own deferred task engine. Always available to the owner.
    #[must_use]
    pub fn deferred_tasks(&self) -> &DeferredTaskEngine {
        &self.services.inner.deferred
    }

    /// Counts this scope in `counter` until it closes.
    pub(crate) fn track(&mut self, counter: Arc<AtomicU64>) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.open_scopes = Some(counter);
    }

    /// Closes the scope. Equivalent to dropping it.
    pub fn close(self) {
        drop(self);
    }

    /// Closes the scope and hands back the work queued in it, in order.
    ///
    /// The scope is marked closed and its engine sealed before the queue is
    /// taken, so a leaked [`RequestServices`] gets an error instead of
    /// queuing work nobody will drain.
    #[must_use]
    pub fn close_and_take_pending(self) -> Vec<Box<dyn DeferredTask>> {
        self.services.inner.closed.store(true, Ordering::Release);
        let pending = self.deferred_tasks().seal();
        drop(self);
        pending
    }
}

impl Drop for ServiceScope {
    fn drop(&mut self) {
        self.services.inner.closed.store(true, Ordering::Release);
        let abandoned = self.services.inner.deferred.seal();
        if !abandoned.is_empty() {
            tracing::debug!(
                scope_id = %self.services.inner.id,
                abandoned = abandoned.len(),
                "scope closed with undrained deferred tasks"
            );
        }
        while let Some(dispose) = self.disposers.pop() {
            dispose();
        }
        if let Some(counter) = self.open_scopes.take() {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
        tracing::trace!(
            tenant = %self.services.inner.tenant,
            scope_id = %self.services.inner.id,
            "scope closed"
        );
    }
}

impl fmt::Debug for ServiceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceScope")
            .field("services", &self.services)
            .field("disposers", &self.disposers.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ServiceScope`], used by scope factories.
pub struct ScopeBuilder {
    tenant: TenantId,
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    disposers: Vec<Disposer>,
}

impl ScopeBuilder {
    /// Registers a service instance, replacing any previous one of the same type.
    #[must_use]
    pub fn service<T: Any + Send + Sync>(mut self, service: Arc<T>) -> Self {
        self.services.insert(TypeId::of::<T>(), service);
        self
    }

    /// Registers a callback run when the scope closes.
    #[must_use]
    pub fn on_close(mut self, dispose: impl FnOnce() + Send + 'static) -> Self {
        self.disposers.push(Box::new(dispose));
        self
    }

    #[must_use]
    pub fn build(self) -> ServiceScope {
        ServiceScope {
            services: RequestServices {
                inner: Arc::new(ScopeInner {
                    id: Uuid::new_v4(),
                    tenant: self.tenant,
                    services: self.services,
                    deferred: DeferredTaskEngine::new(),
                    closed: AtomicBool::new(false),
                }),
            },
            disposers: self.disposers,
            open_scopes: None,
        }
    }
}
