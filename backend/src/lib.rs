pub mod auth;
pub mod authorizations;
pub mod billing;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod models;
pub mod reports;
pub mod routes;

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{CredentialVerifier, TokenKeys};
use crate::db::Database;
use crate::routes::api_routes;

/// Everything a request handler needs, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub db: Database,
    pub tokens: Arc<TokenKeys>,
    pub credentials: Arc<dyn CredentialVerifier>,
}

async fn root() -> &'static str {
    "Mutua API"
}

pub fn app(context: AppContext) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(api_routes())
        .layer(Extension(context.db))
        .layer(Extension(context.tokens))
        .layer(Extension(context.credentials))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Adds the Prometheus `/metrics` route and request metrics. The recorder is process
/// global, so call this at most once.
pub fn with_metrics(router: Router) -> Router {
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    router
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .layer(prometheus_layer)
}
