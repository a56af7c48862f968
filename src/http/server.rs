//! HTTP server and router assembly.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::admin::admin_routes;
use super::middleware::RateLimitState;
use crate::error::{GatekeeperError, Result};
use crate::metrics;
use crate::ratelimit::{class, RateLimitAdmin};

/// Build the service router.
///
/// `/health` and `/metrics` are not rate limited; the admin routes are
/// limited by the `admin` class.
pub fn build_router(state: &RateLimitState, admin: RateLimitAdmin) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(admin_routes(admin).route_layer(state.layer(class::ADMIN)))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::render() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// HTTP server for a prepared router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    ///
    /// Peer addresses are exposed to handlers and middleware as `ConnectInfo`.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            GatekeeperError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GatekeeperError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{MemoryAuditSink, StaticUserDirectory, ViolationReporter};
    use crate::ratelimit::{
        AdmissionEngine, ClientIdentifier, CounterStore, MemoryStore, PolicyRegistry,
    };
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router() -> (Router, Arc<MemoryStore>) {
        let registry = Arc::new(PolicyRegistry::default());
        let store = Arc::new(MemoryStore::new());
        let engine = AdmissionEngine::new(registry.clone(), ClientIdentifier::new(), store.clone());
        let reporter = ViolationReporter::new(
            Arc::new(MemoryAuditSink::new()),
            Arc::new(StaticUserDirectory::default()),
        );
        let state = RateLimitState::new(Arc::new(engine), reporter);
        let admin = RateLimitAdmin::new(registry, store.clone());
        (build_router(&state, admin), store)
    }

    #[tokio::test]
    async fn test_health_is_not_limited() {
        let (app, store) = router();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_admin_routes_are_limited() {
        let (app, _) = router();
        let request = Request::builder()
            .uri("/admin/rate-limits/user:1")
            .header("x-forwarded-for", "10.0.0.9")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-ratelimit-limit").unwrap(),
            "100"
        );
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (app, _) = router();
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_server_stops_on_signal() {
        let (app, _) = router();
        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), app);
        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
