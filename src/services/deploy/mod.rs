//! 部署服务模块
//!
//! 接受部署请求、在后台执行流水线、停止与删除部署

pub mod context;
pub mod dependencies;
pub mod model;
pub mod pipeline;
pub mod server_script;

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::domain::{DeployRequest, DeploymentEvent, DeploymentStatus, LifecycleEvent};
use crate::error::DeployError;
use crate::state::{AppState, DeploymentRecord};

pub use context::DeployContext;

/// 部署已受理
#[derive(Clone, Debug, Serialize)]
pub struct DeployAccepted {
    pub status: &'static str,
    pub deployment_id: String,
    pub message: String,
    pub websocket_url: String,
}

/// 受理部署请求
///
/// 注册 pending 记录和进度 tracker 后立即返回，流水线在后台执行
pub async fn start(
    state: Arc<AppState>,
    request: DeployRequest,
) -> Result<DeployAccepted, DeployError> {
    let deployment_id = request.deployment_id();
    pipeline::validate_deployment_id(&deployment_id)?;

    state
        .registry
        .put(DeploymentRecord::pending(deployment_id.clone(), request.clone()))
        .await?;
    let tracker = state.progress.create(&deployment_id).await;

    info!(
        deployment_id = %deployment_id,
        model_id = ?request.model_reference(),
        model_type = %request.model_type,
        "Deployment accepted"
    );

    let ctx = DeployContext::new(state.clone(), tracker);
    state.tasks.spawn(&deployment_id, execute(ctx, request));

    Ok(DeployAccepted {
        status: "started",
        websocket_url: state.config.websocket_url(&deployment_id),
        message: "Deployment started. Connect to WebSocket for progress updates.".to_string(),
        deployment_id,
    })
}

/// 后台执行流水线
///
/// 失败写入 tracker 并把注册表记录标记为 failed
pub async fn execute(ctx: DeployContext, request: DeployRequest) {
    if let Err(e) = pipeline::run(&ctx, &request).await {
        let message = e.to_string();
        error!(
            deployment_id = %ctx.deployment_id,
            kind = e.kind(),
            error = %message,
            "Deployment failed"
        );
        ctx.fail(&message);
        ctx.state
            .registry
            .mark_failed(&ctx.deployment_id, &message)
            .await;
    }
}

/// 停止部署（保留记录）
///
/// 仍在流水线中的部署会先中止流水线，已启动的子进程随任务一起被回收
pub async fn stop(state: &AppState, deployment_id: &str) -> Result<DeploymentRecord, DeployError> {
    let previous = state
        .registry
        .get(deployment_id)
        .await
        .ok_or_else(|| DeployError::DeploymentNotFound(deployment_id.to_string()))?
        .status;

    if previous == DeploymentStatus::Pending && state.tasks.abort(deployment_id) {
        info!(deployment_id, "Aborted in-flight deployment pipeline");
    }

    let record = state
        .registry
        .stop(deployment_id, state.supervisor.stop_grace())
        .await?;

    if previous == DeploymentStatus::Pending {
        if let Some(tracker) = state.progress.get(deployment_id).await {
            if !tracker.status().is_terminal() {
                let snapshot = tracker.fail("Deployment stopped before completion");
                state.publish(DeploymentEvent::Progress(snapshot));
            }
        }
    }
    if !previous.is_terminal() {
        state.publish(DeploymentEvent::Lifecycle(LifecycleEvent::DeploymentStopped {
            deployment_id: deployment_id.to_string(),
        }));
    }
    Ok(record)
}

/// 删除部署：中止流水线，移出注册表，停止进程
pub async fn remove(state: &AppState, deployment_id: &str) -> Result<(), DeployError> {
    if !state.registry.contains(deployment_id).await {
        return Err(DeployError::DeploymentNotFound(deployment_id.to_string()));
    }

    if state.tasks.abort(deployment_id) {
        info!(deployment_id, "Aborted in-flight deployment pipeline");
    }
    state
        .registry
        .remove(deployment_id, state.supervisor.stop_grace())
        .await?;
    state.progress.remove(deployment_id).await;

    state.publish(DeploymentEvent::Lifecycle(LifecycleEvent::DeploymentRemoved {
        deployment_id: deployment_id.to_string(),
    }));
    Ok(())
}
