//! 统一错误处理
//!
//! - `DeployError`：部署生命周期的领域错误
//! - `ApiError`：实现 `IntoResponse`，把领域错误映射为 HTTP 状态码

use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// 部署生命周期错误
#[derive(Debug, Error)]
pub enum DeployError {
    /// 部署请求字段缺失或无效
    #[error("Invalid deployment configuration: {0}")]
    ConfigurationInvalid(String),

    /// 模型下载或加载失败（含超时）
    #[error("Model artifact unavailable: {0}")]
    ArtifactUnavailable(String),

    /// 推理服务进程启动后立即退出
    #[error("Inference server failed to start: {detail} (log: {})", .log_path.display())]
    ServerStartFailed { log_path: PathBuf, detail: String },

    /// 端口范围耗尽
    #[error("No available ports for model serving in range {start}-{end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("Deployment '{0}' not found")]
    DeploymentNotFound(String),

    #[error("Deployment '{0}' already exists")]
    DeploymentExists(String),

    #[error("Inference timed out after {0} seconds")]
    InferenceTimeout(u64),

    #[error("Inference failed: {0}")]
    InferenceFailed(String),

    #[error("Internal pipeline error: {0}")]
    PipelineInternal(String),
}

impl DeployError {
    /// 错误类别标识
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::ConfigurationInvalid(_) => "configuration_invalid",
            DeployError::ArtifactUnavailable(_) => "artifact_unavailable",
            DeployError::ServerStartFailed { .. } => "server_start_failed",
            DeployError::NoPortAvailable { .. } => "no_port_available",
            DeployError::DeploymentNotFound(_) => "deployment_not_found",
            DeployError::DeploymentExists(_) => "deployment_exists",
            DeployError::InferenceTimeout(_) => "inference_timeout",
            DeployError::InferenceFailed(_) => "inference_failed",
            DeployError::PipelineInternal(_) => "pipeline_internal",
        }
    }
}

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 409 - 冲突（如：部署 ID 已存在）
    Conflict(String),
    /// 500 - 内部错误
    Internal(String),
    /// 503 - 服务不可用
    ServiceUnavailable(String),
    /// 领域错误，保留类别标识
    Deploy(DeployError),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    /// HTTP 状态码
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Deploy(err) => match err {
                DeployError::ConfigurationInvalid(_) => StatusCode::BAD_REQUEST,
                DeployError::DeploymentNotFound(_) => StatusCode::NOT_FOUND,
                DeployError::DeploymentExists(_) => StatusCode::CONFLICT,
                DeployError::NoPortAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        ApiError::Deploy(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_type, message) = match self {
            ApiError::Unauthorized => ("unauthorized", "Invalid or missing API key".to_string()),
            ApiError::NotFound(resource) => ("not_found", format!("{} not found", resource)),
            ApiError::BadRequest(msg) => ("bad_request", msg),
            ApiError::Conflict(msg) => ("conflict", msg),
            ApiError::Internal(msg) => ("internal_error", msg),
            ApiError::ServiceUnavailable(msg) => ("service_unavailable", msg),
            ApiError::Deploy(err) => (err.kind(), err.to_string()),
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
            ApiError::ServiceUnavailable(m) => write!(f, "Service unavailable: {}", m),
            ApiError::Deploy(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;
