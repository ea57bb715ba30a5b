//! Per-tenant runtime state and the one-time activation state machine.
//!
//! Activation is double-checked: an atomic state read is the fast path, and
//! callers that see a not-yet-active shell serialize on the shell's own lock.
//! The lock is per tenant, so activating one shell never blocks another.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use shellhost_core::{ShellSettings, TenantId};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use super::scope::{RequestServices, ServiceScope};
use crate::traits::{ActivationHook, ScopeFactory, ShellComponents};

// ---------------------------------------------------------------------------
// ActivationState
// ---------------------------------------------------------------------------

/// Activation state of a shell.
///
/// State machine: Inactive -> Activating -> Active, with Activating rolling
/// back to Inactive when the hook fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ActivationState {
    Inactive = 0,
    Activating = 1,
    Active = 2,
}

impl ActivationState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            2 => Self::Active,
            1 => Self::Activating,
            _ => Self::Inactive,
        }
    }

    /// Returns the lowercase name used in logs and health output.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Activating => "activating",
            Self::Active => "active",
        }
    }
}

/// Activation failures. The shell stays inactive and the next request retries.
#[derive(Debug, thiserror::Error)]
pub enum ActivationError {
    #[error("activation hook failed for tenant {tenant}")]
    Hook {
        tenant: TenantId,
        #[source]
        source: anyhow::Error,
    },
    #[error("activation hook panicked for tenant {tenant}")]
    Panicked { tenant: TenantId },
    #[error("activation for tenant {tenant} was cancelled")]
    Cancelled { tenant: TenantId },
}

// ---------------------------------------------------------------------------
// ShellContext
// ---------------------------------------------------------------------------

/// Long-lived runtime state of one tenant.
pub struct ShellContext {
    settings: Arc<ShellSettings>,
    scope_factory: Arc<dyn ScopeFactory>,
    activation_hook: Arc<dyn ActivationHook>,
    state: Arc<AtomicU8>,
    activation_lock: Arc<Mutex<()>>,
    open_scopes: Arc<AtomicU64>,
}

impl ShellContext {
    #[must_use]
    pub fn new(settings: Arc<ShellSettings>, components: ShellComponents) -> Self {
        Self {
            settings,
            scope_factory: components.scope_factory,
            activation_hook: components.activation_hook,
            state: Arc::new(AtomicU8::new(ActivationState::Inactive as u8)),
            activation_lock: Arc::new(Mutex::new(())),
            open_scopes: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &Arc<ShellSettings> {
        &self.settings
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantId {
        &self.settings.name
    }

    #[must_use]
    pub fn activation_state(&self) -> ActivationState {
        ActivationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_activated(&self) -> bool {
        self.activation_state() == ActivationState::Active
    }

    /// Number of scopes of this shell that are currently open.
    #[must_use]
    pub fn open_scopes(&self) -> u64 {
        self.open_scopes.load(Ordering::SeqCst)
    }

    /// Opens a new scope from the shell's container.
    ///
    /// # Errors
    ///
    /// Propagates the container's failure to produce a scope.
    pub async fn create_scope(&self) -> anyhow::Result<ServiceScope> {
        let mut scope = self.scope_factory.create_scope(&self.settings).await?;
        scope.track(Arc::clone(&self.open_scopes));
        Ok(scope)
    }

    /// Runs the activation hook exactly once for this shell.
    ///
    /// Returns immediately once the shell is active. Otherwise waits for the
    /// shell's lock; the first caller to find the shell still inactive runs
    /// `activating` then `activated` with its own request services, and every
    /// other caller waits for that to finish.
    ///
    /// The hook runs on a separate task that owns the lock, so cancelling any
    /// caller (the one that started activation included) never interrupts it
    /// halfway. The hook still sees the services of the request that started
    /// it: if that request is cancelled, its scope closes and lookups made by
    /// the hook afterwards fail with `ScopeError::Closed`. The attempt then
    /// rolls back and the next waiter activates with its own services.
    ///
    /// # Errors
    ///
    /// Returns `ActivationError` when the hook fails or panics. The shell is
    /// left inactive so a later request retries.
    pub async fn ensure_activated(&self, services: &RequestServices) -> Result<(), ActivationError> {
        if self.is_activated() {
            return Ok(());
        }

        let lock = Arc::clone(&self.activation_lock).lock_owned().await;
        if self.is_activated() {
            return Ok(());
        }

        let run = ActivationRun {
            state: Arc::clone(&self.state),
            completed: false,
            _lock: lock,
        };
        run.state
            .store(ActivationState::Activating as u8, Ordering::SeqCst);

        let hook = Arc::clone(&self.activation_hook);
        let services = services.clone();
        let tenant = self.tenant().clone();

        let handle = tokio::spawn(async move {
            let mut run = run;
            hook.activating(&services).await?;
            hook.activated(&services).await?;
            run.complete();
            Ok::<_, anyhow::Error>(())
        });

        match handle.await {
            Ok(Ok(())) => {
                info!(tenant = %tenant, "shell activated");
                metrics::counter!("shell_activations_total", "tenant" => tenant.to_string())
                    .increment(1);
                Ok(())
            }
            Ok(Err(source)) => {
                warn!(tenant = %tenant, error = %format!("{source:#}"), "shell activation failed");
                metrics::counter!("shell_activation_failures_total", "tenant" => tenant.to_string())
                    .increment(1);
                Err(ActivationError::Hook { tenant, source })
            }
            Err(join) if join.is_panic() => {
                warn!(tenant = %tenant, "shell activation panicked");
                metrics::counter!("shell_activation_failures_total", "tenant" => tenant.to_string())
                    .increment(1);
                Err(ActivationError::Panicked { tenant })
            }
            Err(_) => Err(ActivationError::Cancelled { tenant }),
        }
    }
}

impl fmt::Debug for ShellContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellContext")
            .field("tenant", self.tenant())
            .field("state", &self.activation_state())
            .field("open_scopes", &self.open_scopes())
            .finish_non_exhaustive()
    }
}

/// Holds the shell's activation lock for one activation attempt.
///
/// Publishes `Active` on completion; on any other exit (error, panic,
/// runtime shutdown) rolls the state back to `Inactive`. The state is
/// written before the lock field is released.
struct ActivationRun {
    state: Arc<AtomicU8>,
    completed: bool,
    _lock: OwnedMutexGuard<()>,
}

impl ActivationRun {
    fn complete(&mut self) {
        self.state
            .store(ActivationState::Active as u8, Ordering::SeqCst);
        self.completed = true;
    }
}

impl Drop for ActivationRun {
    fn drop(&mut self) {
        if !self.completed {
            self.state
                .store(ActivationState::Inactive as u8, Ordering::SeqCst);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
