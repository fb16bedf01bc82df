//! 健康检查和运行指标 API
//!
//! 包含 /, /health, /metrics 端点

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// 服务信息
#[derive(Debug, Serialize)]
struct BannerResponse {
    message: &'static str,
    version: &'static str,
    docs: String,
}

/// 健康检查响应
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    version: &'static str,
    /// 运行时长（秒）
    uptime: i64,
}

/// 运行指标
#[derive(Debug, Serialize)]
struct MetricsResponse {
    deployments: HashMap<&'static str, usize>,
    total_deployments: usize,
    active_pipelines: usize,
    in_progress: usize,
    websocket_subscribers: usize,
    reserved_ports: usize,
    port_range: String,
    uptime: i64,
}

/// 创建健康检查路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(banner))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
}

fn uptime_secs(state: &AppState) -> i64 {
    (chrono::Utc::now() - state.started_at).num_seconds()
}

/// GET /
async fn banner(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(BannerResponse {
        message: "Model Deploy Agent",
        version: VERSION,
        docs: format!("{}/deployments", state.config.api_prefix),
    })
}

/// 健康检查
///
/// GET /health
/// 无需认证
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: VERSION,
        uptime: uptime_secs(&state),
    })
}

/// GET /metrics
///
/// ENABLE_METRICS=false 时返回 404
async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    if !state.config.enable_metrics {
        return Err(ApiError::not_found("Metrics"));
    }

    let deployments = state.registry.count_by_status().await;
    Ok(Json(MetricsResponse {
        total_deployments: deployments.values().sum(),
        deployments,
        active_pipelines: state.tasks.active_count(),
        in_progress: state.progress.in_progress().await,
        websocket_subscribers: state.subscribers.total_subscribers().await,
        reserved_ports: state.ports.reserved_count(),
        port_range: {
            let range = state.ports.range();
            format!("{}-{}", range.start, range.end)
        },
        uptime: uptime_secs(&state),
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::test_support::{self, FakeSource};

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_banner_and_health() {
        let (state, _dir) = test_support::state(FakeSource::instant());
        let app = super::super::router(state);

        let (status, json) = get_json(app.clone(), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));

        let (status, json) = get_json(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_metrics_counts() {
        let (state, _dir) = test_support::state(FakeSource::instant());
        let (status, json) = get_json(super::super::router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_deployments"], 0);
        assert_eq!(json["reserved_ports"], 0);
    }

    #[tokio::test]
    async fn test_metrics_disabled() {
        let (state, _dir) =
            test_support::state_with(FakeSource::instant(), |config| config.enable_metrics = false);
        let (status, json) = get_json(super::super::router(state), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "not_found");
    }
}
