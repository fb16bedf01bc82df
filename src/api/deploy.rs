//! 部署管理 API
//!
//! 包含 /deploy, /deployments/* 端点（挂载在 API_PREFIX 下）

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use chrono::{DateTime, Utc};

use crate::config::env::constants::{DEFAULT_LOG_TAIL, MAX_LOG_TAIL};
use crate::domain::{DeployRequest, DeploymentStatus, DeploymentSummary, UsageInstructions};
use crate::error::{ApiError, ApiResult};
use crate::infra::process::read_tail;
use crate::middleware::RequireApiKey;
use crate::services;
use crate::services::inference::InferenceInput;
use crate::state::{AppState, DeploymentRecord};

/// 部署列表响应
#[derive(Debug, Serialize)]
pub struct DeploymentListResponse {
    pub status: &'static str,
    pub count: usize,
    pub deployments: Vec<DeploymentSummary>,
}

/// 模型信息
#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub source: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub device: String,
    pub cache_location: String,
}

/// 推理服务进程信息
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub base_url: String,
    pub task: &'static str,
    pub log_path: String,
}

/// 部署详情
#[derive(Debug, Serialize)]
pub struct DeploymentDetail {
    pub deployment_id: String,
    pub model_id: Option<String>,
    pub model_type: String,
    pub status: DeploymentStatus,
    pub endpoint_url: String,
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub usage_instructions: UsageInstructions,
    pub model_info: ModelInfo,
}

/// 通用操作响应
#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub status: &'static str,
    pub message: String,
}

/// 推理响应
#[derive(Debug, Serialize)]
pub struct InferenceResponse {
    pub status: &'static str,
    pub result: serde_json::Value,
    pub deployment_id: String,
    pub model_id: Option<String>,
}

/// 日志查询参数
#[derive(Debug, Deserialize)]
pub struct LogQuery {
    /// 返回的行数，默认 200
    #[serde(default = "default_tail")]
    pub tail: usize,
}

fn default_tail() -> usize {
    DEFAULT_LOG_TAIL
}

/// 日志响应
#[derive(Debug, Serialize)]
pub struct LogResponse {
    pub deployment_id: String,
    pub log_path: String,
    pub count: usize,
    pub lines: Vec<String>,
}

/// 创建部署管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy", post(deploy_model))
        .route("/deployments", get(list_deployments))
        .route(
            "/deployments/:id",
            get(get_deployment).delete(delete_deployment),
        )
        .route("/deployments/:id/stop", post(stop_deployment))
        .route("/deployments/:id/status", get(get_deployment_status))
        .route("/deployments/:id/logs", get(get_deployment_logs))
        .route("/deployments/:id/inference", post(run_inference))
}

fn summarize(state: &AppState, record: &DeploymentRecord) -> DeploymentSummary {
    DeploymentSummary {
        deployment_id: record.deployment_id.clone(),
        model_id: record.model_id.clone(),
        status: record.status,
        endpoint_url: state.config.inference_url(&record.deployment_id),
        created_at: record.created_at,
    }
}

/// 部署模型
///
/// POST /deploy
/// 需要 API Key（启用时）
///
/// 立即返回，流水线在后台执行，进度通过 WebSocket 推送
async fn deploy_model(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeployRequest>,
) -> ApiResult<impl IntoResponse> {
    let accepted = services::deploy::start(state, request).await?;
    Ok(Json(accepted))
}

/// GET /deployments
async fn list_deployments(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let deployments: Vec<DeploymentSummary> = state
        .registry
        .list()
        .await
        .iter()
        .map(|record| summarize(&state, record))
        .collect();

    Json(DeploymentListResponse {
        status: "success",
        count: deployments.len(),
        deployments,
    })
}

/// GET /deployments/:id
///
/// 状态反映进程的实际存活情况
async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .registry
        .get(&deployment_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Deployment '{}'", deployment_id)))?;

    let endpoint = state.config.inference_url(&deployment_id);
    let model_id = record.model_id.clone().unwrap_or_default();
    let server = match (&record.process, &record.pipeline) {
        (Some(process), Some(pipeline)) => Some(ServerInfo {
            pid: process.pid(),
            started_at: process.started_at(),
            base_url: pipeline.base_url().to_string(),
            task: pipeline.pipeline().task(),
            log_path: process.log_path().display().to_string(),
        }),
        _ => None,
    };

    Ok(Json(DeploymentDetail {
        usage_instructions: UsageInstructions::for_endpoint(&endpoint, record.kind),
        model_info: ModelInfo {
            source: format!("HuggingFace Hub: {}", model_id),
            model_type: record.request.model_type.clone(),
            device: record.request.hardware.device.to_ascii_lowercase(),
            cache_location: state.config.storage.hf_cache_dir.display().to_string(),
        },
        deployment_id: record.deployment_id,
        model_id: record.model_id,
        model_type: record.request.model_type,
        status: record.status,
        endpoint_url: endpoint,
        port: record.port,
        server,
        created_at: record.created_at,
        error: record.error,
    }))
}

/// DELETE /deployments/:id
///
/// 停止推理服务并移除记录
async fn delete_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    services::deploy::remove(&state, &deployment_id).await?;
    info!(deployment_id = %deployment_id, "Deployment removed");

    Ok(Json(ActionResponse {
        status: "success",
        message: format!("Deployment {} removed successfully", deployment_id),
    }))
}

/// POST /deployments/:id/stop
///
/// 幂等：已停止的部署再次停止也返回成功
async fn stop_deployment(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = services::deploy::stop(&state, &deployment_id).await?;

    Ok(Json(serde_json::json!({
        "status": "success",
        "message": format!("Deployment {} stopped", deployment_id),
        "deployment": summarize(&state, &record),
    })))
}

/// GET /deployments/:id/status
async fn get_deployment_status(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state
        .progress
        .snapshot(&deployment_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Deployment '{}'", deployment_id)))?;
    Ok(Json(snapshot))
}

/// GET /deployments/:id/logs?tail=N
async fn get_deployment_logs(
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .registry
        .get(&deployment_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Deployment '{}'", deployment_id)))?;

    let tail = query.tail.clamp(1, MAX_LOG_TAIL);
    // 进程已停止时日志文件仍保留在 LOGS_PATH 下
    let (log_path, lines) = match &record.process {
        Some(process) => (process.log_path().to_path_buf(), process.tail_log(tail)),
        None => {
            let path = state
                .config
                .storage
                .logs_path
                .join(format!("{}.log", deployment_id));
            let lines = read_tail(&path, tail);
            (path, lines)
        }
    };

    Ok(Json(LogResponse {
        deployment_id,
        log_path: log_path.display().to_string(),
        count: lines.len(),
        lines,
    }))
}

/// POST /deployments/:id/inference
///
/// 需要 API Key（启用时）
async fn run_inference(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(deployment_id): Path<String>,
    Json(input): Json<InferenceInput>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .registry
        .get(&deployment_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Deployment '{}'", deployment_id)))?;

    let pipeline = match (&record.status, &record.pipeline) {
        (DeploymentStatus::Running, Some(pipeline)) => pipeline.clone(),
        _ => {
            return Err(ApiError::service_unavailable(format!(
                "Deployment '{}' is not running (status: {})",
                deployment_id,
                record.status.as_str()
            )))
        }
    };

    let result = pipeline
        .infer(&input, state.config.timeouts.inference)
        .await
        .map_err(|e| {
            warn!(deployment_id = %deployment_id, error = %e, "Inference failed");
            ApiError::from(e)
        })?;

    Ok(Json(InferenceResponse {
        status: "success",
        result,
        deployment_id,
        model_id: record.model_id,
    }))
}
