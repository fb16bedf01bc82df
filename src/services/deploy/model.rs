//! 模型加载
//!
//! 读取已下载文件中的 `config.json`，统计权重大小并校验上限。
//! 文件读取在 blocking 线程池中进行，整个加载受超时约束。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::DeployError;
use crate::infra::ModelArtifact;

/// `config.json` 中用到的字段
#[derive(Debug, Default, Deserialize)]
struct ModelConfigFile {
    #[serde(default)]
    architectures: Vec<String>,
    #[serde(default)]
    model_type: Option<String>,
}

/// 已加载的模型元数据
#[derive(Clone, Debug)]
pub struct LoadedModel {
    pub model_id: String,
    pub dir: PathBuf,
    pub architectures: Vec<String>,
    pub model_type: Option<String>,
    pub size_bytes: u64,
}

impl LoadedModel {
    /// 主架构名
    pub fn architecture(&self) -> Option<&str> {
        self.architectures.first().map(String::as_str)
    }

    /// 是否为可生成文本的架构
    ///
    /// 架构未知时返回 None
    pub fn is_generative(&self) -> Option<bool> {
        if self.architectures.is_empty() {
            return None;
        }
        Some(self.architectures.iter().any(|a| {
            a.ends_with("ForCausalLM")
                || a.ends_with("LMHeadModel")
                || a.ends_with("ForConditionalGeneration")
        }))
    }
}

/// 加载模型（带超时）
pub async fn load(
    artifact: ModelArtifact,
    max_size_bytes: u64,
    timeout: Duration,
) -> Result<LoadedModel, DeployError> {
    let model_id = artifact.model_id.clone();
    let task = tokio::task::spawn_blocking(move || load_blocking(artifact, max_size_bytes));

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(DeployError::PipelineInternal(format!(
            "Model loading task failed: {}",
            join_err
        ))),
        Err(_) => Err(DeployError::ArtifactUnavailable(format!(
            "Model loading timed out after {} seconds for '{}'",
            timeout.as_secs(),
            model_id
        ))),
    }
}

fn load_blocking(artifact: ModelArtifact, max_size_bytes: u64) -> Result<LoadedModel, DeployError> {
    let size_bytes = artifact.total_size();
    if size_bytes > max_size_bytes {
        return Err(DeployError::ArtifactUnavailable(format!(
            "Model '{}' is {:.2} GB, exceeding the {:.2} GB limit",
            artifact.model_id,
            gib(size_bytes),
            gib(max_size_bytes)
        )));
    }

    let config_path = artifact.dir.join("config.json");
    let config: ModelConfigFile = match std::fs::read_to_string(&config_path) {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
            DeployError::ArtifactUnavailable(format!(
                "Invalid config.json for '{}': {}",
                artifact.model_id, e
            ))
        })?,
        Err(e) => {
            debug!(path = %config_path.display(), error = %e, "No config.json, using defaults");
            ModelConfigFile::default()
        }
    };

    info!(
        model_id = %artifact.model_id,
        architecture = ?config.architectures.first(),
        size_mb = size_bytes / (1024 * 1024),
        "Model loaded"
    );

    Ok(LoadedModel {
        model_id: artifact.model_id,
        dir: artifact.dir,
        architectures: config.architectures,
        model_type: config.model_type,
        size_bytes,
    })
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn artifact(dir: &Path, config: Option<&str>, weights: usize) -> ModelArtifact {
        let mut files = Vec::new();
        if let Some(config) = config {
            let path = dir.join("config.json");
            std::fs::write(&path, config).unwrap();
            files.push(path);
        }
        let weights_path = dir.join("model.safetensors");
        std::fs::write(&weights_path, vec![0u8; weights]).unwrap();
        files.push(weights_path);

        ModelArtifact {
            model_id: "demo/model".to_string(),
            dir: dir.to_path_buf(),
            files,
        }
    }

    #[tokio::test]
    async fn test_load_reads_config() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = artifact(
            dir.path(),
            Some(r#"{"architectures": ["GPT2LMHeadModel"], "model_type": "gpt2"}"#),
            64,
        );

        let model = load(artifact, 1 << 20, Duration::from_secs(5)).await.unwrap();
        assert_eq!(model.architecture(), Some("GPT2LMHeadModel"));
        assert_eq!(model.model_type.as_deref(), Some("gpt2"));
        assert_eq!(model.is_generative(), Some(true));
        assert!(model.size_bytes >= 64);
    }

    #[tokio::test]
    async fn test_load_without_config() {
        let dir = tempfile::tempdir().unwrap();
        let model = load(artifact(dir.path(), None, 8), 1 << 20, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(model.architectures.is_empty());
        assert_eq!(model.is_generative(), None);
    }

    #[tokio::test]
    async fn test_load_rejects_oversized_model() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(artifact(dir.path(), Some("{}"), 4096), 1024, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::ArtifactUnavailable(msg) if msg.contains("limit")));
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(artifact(dir.path(), Some("not json"), 8), 1 << 20, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "artifact_unavailable");
    }
}
