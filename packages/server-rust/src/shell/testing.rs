//! Scriptable shell components shared by the host and dispatcher tests.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shellhost_core::{ShellSettings, TenantRegistry};

use super::scope::{RequestServices, ServiceScope};
use crate::traits::{ActivationHook, ScopeFactory, ShellComponents, ShellContainerFactory};

/// Side channel recording everything the scripted components did.
#[derive(Debug, Default)]
pub struct Recorder {
    pub builds: AtomicU32,
    pub scopes_opened: AtomicU32,
    pub scopes_closed: Arc<AtomicU32>,
    /// `activating:<tenant>` / `activated:<tenant>` in call order.
    pub events: Mutex<Vec<String>>,
    /// Number of upcoming `activating` calls that fail.
    pub fail_activations: AtomicU32,
    /// Number of upcoming scope creations that fail.
    pub fail_scopes: AtomicU32,
    pub activation_delay_ms: AtomicU64,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn open_scopes(&self) -> u32 {
        self.scopes_opened.load(Ordering::SeqCst) - self.scopes_closed.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

struct RecordingScopeFactory {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl ScopeFactory for RecordingScopeFactory {
    async fn create_scope(&self, settings: &ShellSettings) -> anyhow::Result<ServiceScope> {
        if take_one(&self.recorder.fail_scopes) {
            anyhow::bail!("container misconfigured");
        }
        self.recorder.scopes_opened.fetch_add(1, Ordering::SeqCst);
        let closed = Arc::clone(&self.recorder.scopes_closed);
        Ok(ServiceScope::builder(settings.name.clone())
            .service(Arc::new(settings.clone()))
            .service(Arc::clone(&self.recorder))
            .on_close(move || {
                closed.fetch_add(1, Ordering::SeqCst);
            })
            .build())
    }
}

struct RecordingHook {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl ActivationHook for RecordingHook {
    async fn activating(&self, services: &RequestServices) -> anyhow::Result<()> {
        self.recorder
            .events
            .lock()
            .push(format!("activating:{}", services.tenant()));
        let delay = self.recorder.activation_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if take_one(&self.recorder.fail_activations) {
            anyhow::bail!("event bus unavailable");
        }
        Ok(())
    }

    async fn activated(&self, services: &RequestServices) -> anyhow::Result<()> {
        self.recorder
            .events
            .lock()
            .push(format!("activated:{}", services.tenant()));
        Ok(())
    }
}

/// Container factory whose shells all report into one [`Recorder`].
#[derive(Default)]
pub struct ScriptedFactory {
    recorder: Arc<Recorder>,
    fail_tenants: Vec<String>,
    fail_builds: AtomicU32,
}

impl ScriptedFactory {
    /// Fails every build for the named tenants.
    pub fn failing_for<'a>(tenants: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            fail_tenants: tenants.into_iter().map(String::from).collect(),
            ..Self::default()
        }
    }

    /// Fails the next `n` builds, whatever the tenant.
    pub fn failing_first(n: u32) -> Self {
        Self {
            fail_builds: AtomicU32::new(n),
            ..Self::default()
        }
    }

    pub fn recorder(&self) -> Arc<Recorder> {
        Arc::clone(&self.recorder)
    }
}

#[async_trait]
impl ShellContainerFactory for ScriptedFactory {
    async fn build(&self, settings: &ShellSettings) -> anyhow::Result<ShellComponents> {
        if self.fail_tenants.iter().any(|t| t == settings.name.as_str()) || take_one(&self.fail_builds) {
            anyhow::bail!("no container for {}", settings.name);
        }
        self.recorder.builds.fetch_add(1, Ordering::SeqCst);
        Ok(ShellComponents {
            scope_factory: Arc::new(RecordingScopeFactory {
                recorder: Arc::clone(&self.recorder),
            }),
            activation_hook: Arc::new(RecordingHook {
                recorder: Arc::clone(&self.recorder),
            }),
        })
    }
}

/// Registry that fails its first N listings.
pub struct TestRegistry {
    tenants: Vec<ShellSettings>,
    fail_first: AtomicU32,
    calls: AtomicU32,
}

impl TestRegistry {
    pub fn failing_first(n: u32, tenants: Vec<ShellSettings>) -> Self {
        Self {
            tenants,
            fail_first: AtomicU32::new(n),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TenantRegistry for TestRegistry {
    async fn list_known_tenants(&self) -> anyhow::Result<Vec<ShellSettings>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fail_first) {
            anyhow::bail!("tenant store unreachable");
        }
        Ok(self.tenants.clone())
    }
}
