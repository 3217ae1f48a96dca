//! HTTP server for exposing Prometheus metrics.
//!
//! This module provides an Axum-based HTTP server that serves the `/metrics`
//! endpoint for Prometheus scraping and a `/health` endpoint for health checks.

use crate::error::{NbuError, Result};
use crate::metrics::MetricsCollector;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state.
#[derive(Clone)]
struct AppState {
    metrics: Arc<MetricsCollector>,
}

/// Build the exporter's router.
pub fn router(metrics: Arc<MetricsCollector>) -> Router {
    let state = AppState { metrics };

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/", get(root_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and run until `shutdown` completes.
///
/// # Arguments
///
/// * `listen_address` - Address to bind to (e.g., "0.0.0.0:2112")
/// * `metrics` - Metrics collector instance
/// * `shutdown` - Future that resolves when the server should stop
///
/// # Examples
///
/// ```no_run
/// use nbu_exporter::client::ApiClient;
/// use nbu_exporter::config::NbuConfig;
/// use nbu_exporter::metrics::{CollectorOptions, MetricsCollector};
/// use nbu_exporter::server::start_server;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let config = NbuConfig::new("nbu.example.com", "my-api-key");
///     let options = CollectorOptions::from_config(&config);
///     let client = Arc::new(ApiClient::new(config).unwrap());
///     let metrics = Arc::new(MetricsCollector::new(client, options).unwrap());
///     start_server("0.0.0.0:2112", metrics, async {
///         let _ = tokio::signal::ctrl_c().await;
///     })
///     .await
///     .unwrap();
/// }
/// ```
pub async fn start_server<F>(
    listen_address: &str,
    metrics: Arc<MetricsCollector>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(metrics);

    info!("Starting HTTP server on {}", listen_address);

    let listener = TcpListener::bind(listen_address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| NbuError::Server(e.to_string()))?;

    info!("HTTP server stopped");
    Ok(())
}

/// Handler for /metrics endpoint.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    info!("Received metrics scrape request");

    // Whatever was collected is published even when a source failed
    if let Err(e) = state.metrics.collect().await {
        warn!("Failed to collect metrics: {}", e);
    }

    match state.metrics.encode() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

/// Handler for /health endpoint.
async fn health_handler(State(state): State<AppState>) -> Response {
    if state.metrics.client().is_closed() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    (StatusCode::OK, "OK").into_response()
}

/// Handler for root endpoint.
async fn root_handler() -> Response {
    let html = r#"
<!DOCTYPE html>
<html>
<head>
    <title>NetBackup Exporter</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 40px; }
        h1 { color: #333; }
        a { color: #0066cc; text-decoration: none; }
        a:hover { text-decoration: underline; }
        .info { background: #f0f0f0; padding: 15px; border-radius: 5px; margin: 20px 0; }
    </style>
</head>
<body>
    <h1>NetBackup Exporter</h1>
    <div class="info">
        <p>Prometheus metrics exporter for NetBackup primary servers</p>
        <p><strong>Endpoints:</strong></p>
        <ul>
            <li><a href="/metrics">/metrics</a> - Prometheus metrics</li>
            <li><a href="/health">/health</a> - Health check</li>
        </ul>
    </div>
</body>
</html>
"#;

    (StatusCode::OK, axum::response::Html(html)).into_response()
}
