//! HTTP server for metrics, service listings and runtime configuration.

use crate::config::{Config, ConfigError};
use crate::config_manager::{ConfigChange, ConfigManager};
use crate::metrics::MetricsRegistry;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use discovery::DiscoveryClient;
use healthcheck::{HealthCheckResult, HealthCheckStats, HealthMonitor};
use portalloc::PortRange;
use registry::{ServiceRecord, ServiceRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared handles for request handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
    pub monitor: Arc<HealthMonitor>,
    pub client: Arc<DiscoveryClient>,
    pub config: Arc<ConfigManager>,
    /// `None` when metrics are disabled
    pub metrics: Option<Arc<MetricsRegistry>>,
}

/// HTTP server for the daemon's API
pub struct HttpServer {
    state: AppState,
    listen_addr: String,
}

impl HttpServer {
    pub fn new(state: AppState, listen_addr: String) -> Self {
        Self { state, listen_addr }
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Bind the configured address and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
        info!(listen_addr = %listener.local_addr()?, "HTTP server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the router; exposed for in-process tests
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/services", get(list_services_handler))
        .route("/services/:name", get(service_handler))
        .route("/discover/:name", get(discover_handler))
        .route("/config", get(get_config_handler).put(put_config_handler))
        .route("/config/ranges/:name", put(put_range_handler))
        .route(
            "/config/reserved-ports/:port",
            post(reserve_port_handler).delete(release_port_handler),
        )
        .route("/config/lock", post(lock_handler))
        .route("/config/unlock", post(unlock_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    healthy: bool,
}

/// Body of `GET /services/:name`
#[derive(Debug, Serialize)]
pub struct ServiceDetail {
    pub service: ServiceRecord,
    pub last_check: Option<HealthCheckResult>,
    pub stats: Option<HealthCheckStats>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

async fn healthz_handler() -> &'static str {
    "ok"
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let Some(metrics) = state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics disabled").into_response();
    };

    match metrics.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}

async fn list_services_handler(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Vec<ServiceRecord>> {
    Json(state.registry.list(params.healthy).await)
}

async fn service_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.registry.get(&name).await {
        Ok(service) => Json(ServiceDetail {
            last_check: state.monitor.get_last_result(&name),
            stats: state.monitor.get_stats(&name),
            service,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn discover_handler(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.client.discover(&name).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_config_handler(State(state): State<AppState>) -> Json<Config> {
    Json(state.config.current())
}

async fn put_config_handler(State(state): State<AppState>, Json(config): Json<Config>) -> Response {
    config_response(state.config.update(config))
}

async fn put_range_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(range): Json<PortRange>,
) -> Response {
    config_response(state.config.set_port_range(&name, range))
}

async fn reserve_port_handler(State(state): State<AppState>, Path(port): Path<u16>) -> Response {
    config_response(state.config.add_reserved_port(port))
}

async fn release_port_handler(State(state): State<AppState>, Path(port): Path<u16>) -> Response {
    config_response(state.config.remove_reserved_port(port))
}

async fn lock_handler(State(state): State<AppState>) -> StatusCode {
    state.config.lock();
    StatusCode::NO_CONTENT
}

async fn unlock_handler(State(state): State<AppState>) -> StatusCode {
    state.config.unlock();
    StatusCode::NO_CONTENT
}

fn config_response(result: Result<ConfigChange, ConfigError>) -> Response {
    let err = match result {
        Ok(change) => return Json(change).into_response(),
        Err(err) => err,
    };
    let status = match err {
        ConfigError::Locked => StatusCode::LOCKED,
        ConfigError::Rejected(_) => StatusCode::CONFLICT,
        ConfigError::ValidationError(_) | ConfigError::ParseError(_) => StatusCode::BAD_REQUEST,
        ConfigError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!(error = %err, "Configuration update refused");
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn error_response(err: common::Error) -> Response {
    let status = if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_timeout() {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_status_mapping() {
        let response = error_response(common::Error::service_not_found("api"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = error_response(common::Error::DiscoveryTimeout {
            service: "api".to_string(),
            waited: Duration::from_secs(1),
        });
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = error_response(common::Error::Cancelled);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_config_error_status_mapping() {
        assert_eq!(
            config_response(Err(ConfigError::Locked)).status(),
            StatusCode::LOCKED
        );
        assert_eq!(
            config_response(Err(ConfigError::Rejected("no".to_string()))).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            config_response(Ok(ConfigChange::default())).status(),
            StatusCode::OK
        );
    }

    #[tokio::test]
    async fn test_healthz() {
        assert_eq!(healthz_handler().await, "ok");
    }
}
