//! Tower middleware that runs HTTP requests through [`ShellDispatcher`].
//!
//! The inner service only sees requests whose tenant matched and whose shell
//! is active; the request's [`RequestServices`](crate::shell::RequestServices)
//! travel in its extensions.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use http::{header, Request, StatusCode};
use shellhost_core::RequestHead;
use tower::{Layer, Service, ServiceExt};
use tracing::warn;

use crate::service::dispatcher::{Dispatched, ShellDispatcher};
use crate::shell::host::error_chain;

// ---------------------------------------------------------------------------
// ShellDispatchLayer
// ---------------------------------------------------------------------------

/// Tower layer that resolves the tenant of each request.
///
/// Unmatched requests get `404 Not Found` without reaching the inner service.
/// Activation failures map to `500`, shells or scopes that cannot be opened
/// to `503`.
#[derive(Clone)]
pub struct ShellDispatchLayer {
    dispatcher: Arc<ShellDispatcher>,
}

impl ShellDispatchLayer {
    #[must_use]
    pub fn new(dispatcher: Arc<ShellDispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl<S> Layer<S> for ShellDispatchLayer {
    type Service = ShellDispatchService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ShellDispatchService {
            inner,
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }
}

// ---------------------------------------------------------------------------
// ShellDispatchService
// ---------------------------------------------------------------------------

/// Service produced by [`ShellDispatchLayer`].
#[derive(Clone)]
pub struct ShellDispatchService<S> {
    inner: S,
    dispatcher: Arc<ShellDispatcher>,
}

impl<S, B> Service<Request<B>> for ShellDispatchService<S>
where
    S: Service<Request<B>, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        // The readied service goes with this request; keep a fresh clone.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let dispatcher = Arc::clone(&self.dispatcher);

        Box::pin(async move {
            let host = request_host(&req);
            let path = req.uri().path().to_owned();
            let head = RequestHead::new(host.as_deref(), &path);

            let dispatched = dispatcher
                .dispatch(&head, move |services| {
                    req.extensions_mut().insert(services);
                    async move {
                        let response = match inner.oneshot(req).await {
                            Ok(response) => response,
                            Err(never) => match never {},
                        };
                        Ok::<_, anyhow::Error>(response)
                    }
                })
                .await;

            Ok(match dispatched {
                Ok(Dispatched::Served { response, .. }) => response,
                Ok(Dispatched::Unmatched) => StatusCode::NOT_FOUND.into_response(),
                Err(e) => {
                    let status = e.status_code();
                    warn!(status = status.as_u16(), error = %error_chain(&e), "tenant request failed");
                    status.into_response()
                }
            })
        })
    }
}

/// `Host` header, or the URI authority for absolute-form requests.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().authority().map(http::uri::Authority::as_str))
        .map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use axum::body::Body;
    use shellhost_core::{ShellSettings, TenantId};

    use super::*;
    use crate::service::config::HostConfig;
    use crate::shell::host::ShellHost;
    use crate::shell::scope::RequestServices;
    use crate::shell::source::StaticTenantRegistry;
    use crate::shell::testing::{Recorder, ScriptedFactory};

    fn build_dispatcher(factory: ScriptedFactory) -> (Arc<ShellDispatcher>, Arc<Recorder>) {
        let recorder = factory.recorder();
        let host = Arc::new(ShellHost::new(
            Arc::new(StaticTenantRegistry::new(vec![
                ShellSettings::new("a").with_host("a.example.com"),
                ShellSettings::new("docs").with_prefix("docs"),
            ])),
            Arc::new(factory),
        ));
        (
            Arc::new(ShellDispatcher::new(host, &HostConfig::default())),
            recorder,
        )
    }

    /// Inner service answering with the tenant found in the request extensions.
    #[derive(Clone)]
    struct EchoTenant;

    impl Service<Request<Body>> for EchoTenant {
        type Response = Response;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<Body>) -> Self::Future {
            let tenant = req
                .extensions()
                .get::<RequestServices>()
                .map_or_else(|| "none".to_string(), |s| s.tenant().to_string());
            Box::pin(async move { Ok(tenant.into_response()) })
        }
    }

    fn echo_tenant() -> EchoTenant {
        EchoTenant
    }

    fn request(host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn matched_request_reaches_inner_service_with_services() {
        let (dispatcher, recorder) = build_dispatcher(ScriptedFactory::default());
        let svc = ShellDispatchLayer::new(dispatcher).layer(echo_tenant());

        let response = svc.oneshot(request("a.example.com", "/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "a");
        assert_eq!(recorder.events(), vec!["activating:a", "activated:a"]);
    }

    #[tokio::test]
    async fn prefix_tenant_matches_on_any_host() {
        let (dispatcher, _recorder) = build_dispatcher(ScriptedFactory::default());
        let svc = ShellDispatchLayer::new(dispatcher).layer(echo_tenant());

        let response = svc
            .oneshot(request("whatever.test", "/docs/intro"))
            .await
            .unwrap();

        assert_eq!(body_text(response).await, "docs");
    }

    #[tokio::test]
    async fn unmatched_request_gets_not_found() {
        let (dispatcher, recorder) = build_dispatcher(ScriptedFactory::default());
        let svc = ShellDispatchLayer::new(dispatcher).layer(echo_tenant());

        let response = svc.oneshot(request("nobody.test", "/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(recorder.scopes_opened.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn activation_failure_gets_internal_error_then_recovers() {
        let (dispatcher, recorder) = build_dispatcher(ScriptedFactory::default());
        recorder.fail_activations.store(1, Ordering::SeqCst);
        let svc = ShellDispatchLayer::new(Arc::clone(&dispatcher)).layer(echo_tenant());

        let failed = svc
            .clone()
            .oneshot(request("a.example.com", "/"))
            .await
            .unwrap();
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = svc.oneshot(request("a.example.com", "/")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert!(dispatcher
            .host()
            .loaded_context(&TenantId::new("a"))
            .unwrap()
            .is_activated());
    }

    #[tokio::test]
    async fn scope_failure_gets_service_unavailable() {
        let (dispatcher, recorder) = build_dispatcher(ScriptedFactory::default());
        recorder.fail_scopes.store(1, Ordering::SeqCst);
        let svc = ShellDispatchLayer::new(dispatcher).layer(echo_tenant());

        let response = svc.oneshot(request("a.example.com", "/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn host_falls_back_to_uri_authority() {
        let req = Request::builder()
            .uri("http://a.example.com:8080/x")
            .body(())
            .unwrap();
        assert_eq!(request_host(&req).as_deref(), Some("a.example.com:8080"));

        let req = Request::builder().uri("/x").body(()).unwrap();
        assert_eq!(request_host(&req), None);
    }
}
