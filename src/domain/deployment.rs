//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 部署生命周期状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Stopped,
    Failed,
}

impl DeploymentStatus {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Stopped | DeploymentStatus::Failed)
    }
}

/// 推理适配器类别
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// 文本生成（nlp / text）
    Text,
    /// 其它类型（cv / audio / multimodal ...）
    Generic,
}

impl ModelKind {
    /// 根据 model_type 标签选择类别
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "nlp" | "text" => ModelKind::Text,
            _ => ModelKind::Generic,
        }
    }
}

/// 模型引用（嵌套写法）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default = "default_model_source")]
    pub model_source: String,
}

/// 硬件提示
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HardwareConfig {
    #[serde(default = "default_device")]
    pub device: String,
    /// GPU 显存（GB）
    #[serde(default)]
    pub gpu_memory: Option<u64>,
    #[serde(default)]
    pub cpu_threads: Option<u32>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            gpu_memory: None,
            cpu_threads: None,
        }
    }
}

/// 依赖列表，支持 `["pkg"]` 和 `{"packages": ["pkg"]}` 两种写法
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Dependencies {
    List(Vec<String>),
    Packages {
        #[serde(default)]
        packages: Vec<String>,
    },
}

impl Default for Dependencies {
    fn default() -> Self {
        Dependencies::List(Vec::new())
    }
}

impl Dependencies {
    pub fn packages(&self) -> &[String] {
        match self {
            Dependencies::List(list) => list,
            Dependencies::Packages { packages } => packages,
        }
    }
}

/// 部署请求
///
/// 同时接受 `{"model": {"model_id": ..}}` 与扁平的 `{"model_id": ..}`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default)]
    pub deployment_name: Option<String>,
    #[serde(default = "default_model_type")]
    pub model_type: String,
}

impl DeployRequest {
    /// 模型引用（嵌套优先），空白字符串视为缺失
    pub fn model_reference(&self) -> Option<&str> {
        self.model
            .as_ref()
            .and_then(|m| m.model_id.as_deref())
            .or(self.model_id.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// 模型来源
    pub fn model_source(&self) -> &str {
        self.model
            .as_ref()
            .map(|m| m.model_source.as_str())
            .unwrap_or("huggingface")
    }

    /// 部署 ID：使用 deployment_name，否则生成 8 位随机 ID
    pub fn deployment_id(&self) -> String {
        self.deployment_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                let mut id = uuid::Uuid::new_v4().simple().to_string();
                id.truncate(8);
                id
            })
    }

    pub fn kind(&self) -> ModelKind {
        ModelKind::from_tag(&self.model_type)
    }
}

/// 部署摘要（列表项）
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentSummary {
    pub deployment_id: String,
    pub model_id: Option<String>,
    pub status: DeploymentStatus,
    pub endpoint_url: String,
    pub created_at: DateTime<Utc>,
}

/// 使用说明
#[derive(Clone, Debug, Serialize)]
pub struct UsageInstructions {
    pub description: String,
    pub endpoint: String,
    pub method: &'static str,
    pub content_type: &'static str,
    pub example_curl: String,
    pub example_python: String,
}

impl UsageInstructions {
    /// 根据模型类别生成调用示例
    pub fn for_endpoint(endpoint: &str, kind: ModelKind) -> Self {
        let body = match kind {
            ModelKind::Text => r#"{"text": "Hello, how are you?"}"#,
            ModelKind::Generic => r#"{"input": "your input data"}"#,
        };

        let example_curl = format!(
            "curl -X POST {endpoint} \\\n  -H \"Content-Type: application/json\" \\\n  -d '{body}'\n"
        );
        let example_python = format!(
            "import requests\n\nresponse = requests.post(\n    '{endpoint}',\n    json={body}\n)\nprint(response.json())\n"
        );

        Self {
            description: "Your model is deployed and ready to accept inference requests".to_string(),
            endpoint: endpoint.to_string(),
            method: "POST",
            content_type: "application/json",
            example_curl,
            example_python,
        }
    }
}

fn default_model_source() -> String {
    "huggingface".to_string()
}

fn default_device() -> String {
    "auto".to_string()
}

fn default_model_type() -> String {
    "nlp".to_string()
}
