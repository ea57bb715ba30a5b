//! `shellhost` binary: serves the tenants listed in a JSON file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::{Extension, Json, Router};
use clap::Parser;
use serde_json::json;
use shellhost_core::ShellSettings;
use shellhost_server::network::{NetworkConfig, NetworkModule, TlsConfig};
use shellhost_server::service::{
    DrainMode, DrainPolicy, DrainWorker, HostConfig, ServiceContext, ServiceRegistry,
    ShellDispatcher,
};
use shellhost_server::shell::{DefaultShellContainer, JsonFileTenantRegistry, RequestServices, ShellHost};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shellhost")]
#[command(about = "Multi-tenant shell host with lazy activation and deferred work", long_about = None)]
struct Cli {
    /// JSON file listing the tenants: `{ "tenants": [ ... ] }`
    #[arg(long, value_name = "FILE", env = "SHELLHOST_TENANTS")]
    tenants: PathBuf,

    /// Bind address
    #[arg(long, env = "SHELLHOST_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 for OS-assigned)
    #[arg(short, long, env = "SHELLHOST_PORT", default_value_t = 8080)]
    port: u16,

    /// Identifier of this host process, used in logs
    #[arg(long, env = "SHELLHOST_NODE_ID", default_value = "shellhost")]
    node_id: String,

    /// Where deferred tasks are drained
    #[arg(long, value_enum, env = "SHELLHOST_DRAIN_MODE", default_value_t = DrainMode::Inline)]
    drain_mode: DrainMode,

    /// What a drain does after a failed task
    #[arg(long, value_enum, env = "SHELLHOST_DRAIN_POLICY", default_value_t = DrainPolicy::ContinueOnFailure)]
    drain_policy: DrainPolicy,

    /// Capacity of the background drain queue
    #[arg(long, env = "SHELLHOST_DRAIN_QUEUE_CAPACITY", default_value_t = 256)]
    drain_queue_capacity: usize,

    /// Request timeout in seconds
    #[arg(long, env = "SHELLHOST_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    /// Allowed CORS origins, comma separated
    #[arg(long, env = "SHELLHOST_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    cors_origins: Vec<String>,

    /// PEM certificate chain; enables TLS together with --tls-key
    #[arg(long, env = "SHELLHOST_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, env = "SHELLHOST_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Log filter, overridden by `RUST_LOG`
    #[arg(long, env = "SHELLHOST_LOG", default_value = "info")]
    log: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "SHELLHOST_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn host_config(&self) -> HostConfig {
        HostConfig {
            node_id: self.node_id.clone(),
            drain_mode: self.drain_mode,
            drain_policy: self.drain_policy,
            drain_queue_capacity: self.drain_queue_capacity,
            ..HostConfig::default()
        }
    }

    fn network_config(&self) -> NetworkConfig {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            _ => None,
        };
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            tls,
            cors_origins: self.cors_origins.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            ..NetworkConfig::default()
        }
    }
}

fn init_tracing(filter: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(filter))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Tenant app served by the binary: describes the shell that handled the request.
fn tenant_app() -> Router {
    Router::new().fallback(describe_tenant)
}

async fn describe_tenant(
    Extension(services): Extension<RequestServices>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let settings = services
        .get::<ShellSettings>()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(json!({
        "tenant": settings.name,
        "scope_id": services.scope_id().to_string(),
        "settings": settings.extra,
    })))
}

/// Reloads every tenant on SIGHUP: shells are dropped and rebuilt from the
/// tenants file, and each shell activates again on its next request.
#[cfg(unix)]
fn reload_on_hangup(services: Arc<ServiceRegistry>, ctx: ServiceContext) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGHUP, tenant reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading tenants");
            let reloaded = match services.reset_all().await {
                Ok(()) => services.init_all(&ctx).await,
                Err(e) => Err(e),
            };
            if let Err(e) = reloaded {
                warn!(error = %format!("{e:#}"), "tenant reload failed");
            }
        }
    });
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log, cli.log_json)?;

    let host_config = Arc::new(cli.host_config());
    let registry = Arc::new(JsonFileTenantRegistry::new(&cli.tenants));
    let host = Arc::new(ShellHost::new(registry, Arc::new(DefaultShellContainer)));

    let services = Arc::new(ServiceRegistry::new());
    services.register_shared(Arc::clone(&host));

    let mut dispatcher = ShellDispatcher::new(Arc::clone(&host), &host_config);
    if host_config.drain_mode == DrainMode::Background {
        let worker = Arc::new(DrainWorker::start(&host_config));
        if let Some(handle) = worker.handle() {
            dispatcher = dispatcher.with_drain_worker(handle);
        }
        services.register_shared(worker);
    }

    let service_ctx = ServiceContext {
        config: Arc::clone(&host_config),
    };
    services.init_all(&service_ctx).await?;
    #[cfg(unix)]
    reload_on_hangup(Arc::clone(&services), service_ctx);

    let mut network = NetworkModule::new(cli.network_config(), Arc::new(dispatcher), services);
    let port = network.start().await?;
    info!(
        node_id = %host_config.node_id,
        port,
        shells = host.shell_count(),
        drain_mode = ?host_config.drain_mode,
        "shellhost started"
    );

    network.serve(tenant_app(), shutdown_signal()).await
}
