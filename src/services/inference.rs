//! 推理适配器
//!
//! 每个部署持有一个 `BoundPipeline`：适配器变体决定请求体的形状，
//! 实际计算由该部署的推理服务子进程完成（`POST /predict`）。
//! 同一部署的推理调用通过单许可信号量串行执行。

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::domain::ModelKind;
use crate::error::DeployError;
use crate::services::deploy::model::LoadedModel;

/// 文本生成默认最大长度
const DEFAULT_MAX_LENGTH: u32 = 100;

/// 推理输入
///
/// `text` / `input` 二选一，其余字段原样透传给推理服务
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InferenceInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u32>,
    #[serde(flatten)]
    pub options: HashMap<String, Value>,
}

/// 推理适配器
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InferencePipeline {
    Text,
    Generic,
}

impl InferencePipeline {
    /// 根据模型类别和架构选择适配器
    ///
    /// 标记为文本但架构不能生成文本时退回 Generic
    pub fn build(kind: ModelKind, model: &LoadedModel) -> Self {
        match kind {
            ModelKind::Text => match model.is_generative() {
                Some(false) => {
                    warn!(
                        model_id = %model.model_id,
                        architecture = ?model.architecture(),
                        "Architecture cannot generate text, using generic pipeline"
                    );
                    InferencePipeline::Generic
                }
                _ => InferencePipeline::Text,
            },
            ModelKind::Generic => InferencePipeline::Generic,
        }
    }

    /// 写入推理服务脚本的 transformers task
    pub fn task(&self) -> &'static str {
        match self {
            InferencePipeline::Text => "text-generation",
            InferencePipeline::Generic => "feature-extraction",
        }
    }

    /// 构造 `/predict` 请求体
    pub fn payload(&self, input: &InferenceInput) -> Result<Value, DeployError> {
        let mut body = match self {
            InferencePipeline::Text => {
                let text = input
                    .text
                    .clone()
                    .or_else(|| input.input.as_ref().and_then(|v| v.as_str().map(String::from)))
                    .ok_or_else(|| {
                        DeployError::InferenceFailed("Text pipeline requires 'text'".to_string())
                    })?;
                json!({
                    "text": text,
                    "max_length": input.max_length.unwrap_or(DEFAULT_MAX_LENGTH),
                })
            }
            InferencePipeline::Generic => {
                let value = input
                    .input
                    .clone()
                    .or_else(|| input.text.clone().map(Value::String))
                    .ok_or_else(|| {
                        DeployError::InferenceFailed(
                            "Generic pipeline requires 'input' or 'text'".to_string(),
                        )
                    })?;
                json!({ "input": value })
            }
        };

        if let Value::Object(map) = &mut body {
            for (key, value) in &input.options {
                map.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Ok(body)
    }
}

/// 绑定到某个推理服务进程的适配器
#[derive(Debug)]
pub struct BoundPipeline {
    pipeline: InferencePipeline,
    base_url: String,
    http: reqwest::Client,
    slot: Semaphore,
}

impl BoundPipeline {
    pub fn new(pipeline: InferencePipeline, port: u16, http: reqwest::Client) -> Self {
        Self {
            pipeline,
            base_url: format!("http://127.0.0.1:{}", port),
            http,
            slot: Semaphore::new(1),
        }
    }

    pub fn pipeline(&self) -> InferencePipeline {
        self.pipeline
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 执行一次推理
    ///
    /// 排队等待不计入超时
    pub async fn infer(&self, input: &InferenceInput, timeout: Duration) -> Result<Value, DeployError> {
        let body = self.pipeline.payload(input)?;

        let _permit = self
            .slot
            .acquire()
            .await
            .map_err(|_| DeployError::PipelineInternal("inference slot closed".to_string()))?;

        match tokio::time::timeout(timeout, self.forward(&body)).await {
            Ok(result) => result,
            Err(_) => Err(DeployError::InferenceTimeout(timeout.as_secs())),
        }
    }

    async fn forward(&self, body: &Value) -> Result<Value, DeployError> {
        let url = format!("{}/predict", self.base_url);
        debug!(url = %url, "Forwarding inference request");

        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| DeployError::InferenceFailed(format!("request failed: {}", e)))?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DeployError::InferenceFailed(format!(
                "inference server returned {}: {}",
                status, raw
            )));
        }

        let value: Value = serde_json::from_str(&raw)
            .map_err(|e| DeployError::InferenceFailed(format!("invalid JSON: {} ({})", e, raw)))?;

        // 推理服务返回 {predictions, model, device, inference_time_ms}
        Ok(match value {
            Value::Object(mut map) if map.contains_key("predictions") => {
                map.remove("predictions").unwrap_or(Value::Null)
            }
            other => other,
        })
    }
}
