//! API 模块
//!
//! HTTP handlers 和路由组装

pub mod deploy;
pub mod health;
pub mod ws;

use axum::http::HeaderValue;
use axum::Router;
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::state::AppState;

/// 构建完整的 API 路由
///
/// 健康检查挂在根路径，部署与 WebSocket 路由挂在 API_PREFIX 下
pub fn router(state: Arc<AppState>) -> Router {
    let scoped = Router::new().merge(deploy::router()).merge(ws::router());

    let prefix = state.config.api_prefix.as_str();
    let app = Router::new().merge(health::router());
    let app = if prefix.is_empty() {
        app.merge(scoped)
    } else {
        app.nest(prefix, scoped)
    };

    app.layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}

/// CORS：包含 "*" 时放开全部来源
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}
