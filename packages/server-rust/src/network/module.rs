//! Network module with deferred startup.
//!
//! `new()` allocates shared state, `start()` binds the listener, and
//! `serve()` accepts connections until shutdown. Tenant routes sit behind
//! the shell dispatch layer; health routes never touch a tenant.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tracing::{info, warn};

use super::config::{NetworkConfig, TlsConfig};
use super::handlers::{health_handler, liveness_handler, readiness_handler, AppState};
use super::middleware::{build_http_layers, track_in_flight};
use super::shutdown::ShutdownController;
use crate::service::dispatcher::ShellDispatcher;
use crate::service::middleware::ShellDispatchLayer;
use crate::service::registry::ServiceRegistry;

/// Owns the HTTP server lifecycle.
///
/// 1. `new()` allocates the shutdown controller
/// 2. `start()` binds the TCP listener
/// 3. `serve()` serves until the shutdown future resolves, waits for
///    in-flight requests, then shuts every managed service down
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    dispatcher: Arc<ShellDispatcher>,
    services: Arc<ServiceRegistry>,
    shutdown: Arc<ShutdownController>,
    start_time: Instant,
}

impl NetworkModule {
    /// Creates the module without binding any port.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        dispatcher: Arc<ShellDispatcher>,
        services: Arc<ServiceRegistry>,
    ) -> Self {
        Self {
            config,
            listener: None,
            dispatcher,
            services,
            shutdown: Arc::new(ShutdownController::new()),
            start_time: Instant::now(),
        }
    }

    /// Shared handle to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Assembles the router.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    /// - anything else -- `tenant_app`, behind the shell dispatch layer
    pub fn build_router(&self, tenant_app: Router) -> Router {
        let state = AppState {
            host: Arc::clone(self.dispatcher.host()),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            start_time: self.start_time,
        };

        let tenants = ServiceBuilder::new()
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&self.shutdown),
                track_in_flight,
            ))
            .layer(ShellDispatchLayer::new(Arc::clone(&self.dispatcher)))
            .service(tenant_app);

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .fallback_service(tenants)
            .layer(build_http_layers(&self.config))
            .with_state(state)
    }

    /// Binds the listener and returns the bound port (OS-assigned for port 0).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves, then drains and tears down.
    ///
    /// After the signal: health moves to Draining, in-flight requests get up
    /// to `drain_timeout` to finish, and `ServiceRegistry::shutdown_all`
    /// releases every shell.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, TLS material cannot be
    /// loaded, or the server hits a fatal I/O error.
    pub async fn serve(
        mut self,
        tenant_app: Router,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router(tenant_app);

        self.shutdown.set_ready();

        match self.config.tls.clone() {
            Some(tls) => serve_tls(listener, router, &tls, shutdown).await?,
            None => serve_plain(listener, router, shutdown).await?,
        }

        self.stop().await
    }

    async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.trigger_shutdown();
        let in_flight = self.shutdown.in_flight_count();
        if in_flight > 0 {
            info!(in_flight, "waiting for in-flight requests");
        }
        if self.shutdown.wait_for_drain(self.config.drain_timeout).await {
            info!("all requests drained");
        } else {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired with requests in flight"
            );
        }
        self.services.shutdown_all(false).await
    }
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("serving plain HTTP");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Serves TLS through `axum-server` with rustls, reusing the bound listener.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls: &TlsConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        shutdown_handle.graceful_shutdown(None);
    });

    info!(%addr, "serving TLS");
    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}
