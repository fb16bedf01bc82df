//! Model Deploy Agent - 模型部署控制面
//!
//! 接收部署请求，下载模型，生成并托管推理服务子进程，
//! 通过 REST 和 WebSocket 暴露部署状态与推理入口。

pub mod error;
pub mod middleware;
pub mod infra;
pub mod domain;
pub mod config;
pub mod state;
pub mod api;
pub mod services;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::env::constants::VERSION;
use crate::config::EnvConfig;
use crate::state::AppState;

/// 命令行覆盖的运行参数
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// 覆盖 BACKEND_PORT
    pub port_override: Option<u16>,
}

/// 初始化日志
///
/// RUST_LOG 未设置时默认 `model_deploy_agent=info,tower_http=info`
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("model_deploy_agent=info,tower_http=info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to initialize tracing: {}", e);
    }
}

/// 启动控制面，直到收到 SIGINT / SIGTERM
pub async fn init_and_run_with_config(runtime: RuntimeConfig) -> anyhow::Result<()> {
    init_tracing(config::env::log_json_from_env());

    let mut config = EnvConfig::from_env();
    if let Some(port) = runtime.port_override {
        config.port = port;
    }
    config
        .create_directories()
        .context("Failed to create storage directories")?;

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(config)?);
    let relay = services::events::spawn_relay(&state);

    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(
        version = VERSION,
        addr = %addr,
        api_prefix = %state.config.api_prefix,
        "Model deploy agent listening"
    );

    // 收到信号后先取消令牌，WebSocket 连接和事件中继随之退出
    let token = state.shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            token.cancel();
        })
        .await;

    info!("Shutting down, stopping deployments");
    state.shutdown().await;
    if let Err(e) = relay.await {
        error!(error = %e, "Event relay task failed");
    }

    served.context("HTTP server error")?;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
