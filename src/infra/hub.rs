//! 模型仓库客户端
//!
//! 从 Hugging Face Hub 拉取模型文件到本地缓存。`ArtifactSource` 抽象了获取方式，
//! 部署流水线只依赖该 trait。

use std::path::PathBuf;

use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder};
use tracing::{debug, info, warn};

use crate::domain::ModelKind;
use crate::error::DeployError;

/// 需要拉取的文件扩展名（权重 / 配置 / 分词器）
const ARTIFACT_EXTENSIONS: &[&str] = &[
    "json",
    "safetensors",
    "bin",
    "model",
    "txt",
    "tiktoken",
];

/// 已获取到本地的模型文件
#[derive(Clone, Debug)]
pub struct ModelArtifact {
    pub model_id: String,
    /// 文件所在目录（缓存中的 snapshot 目录）
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

impl ModelArtifact {
    /// 所有文件大小之和（字节）
    pub fn total_size(&self) -> u64 {
        self.files
            .iter()
            .filter_map(|f| std::fs::metadata(f).ok())
            .map(|m| m.len())
            .sum()
    }
}

/// 模型文件来源
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn acquire(&self, model_id: &str, kind: ModelKind) -> Result<ModelArtifact, DeployError>;
}

/// Hugging Face Hub 来源
pub struct HubArtifactSource {
    api: Api,
}

impl HubArtifactSource {
    pub fn new(cache_dir: PathBuf, token: Option<String>) -> anyhow::Result<Self> {
        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir)
            .with_token(token)
            .with_progress(false)
            .build()?;
        Ok(Self { api })
    }
}

/// 是否需要拉取该文件
fn wanted(filename: &str, kind: ModelKind) -> bool {
    // 子目录里的文件（onnx/、coreml/ 等导出格式）不需要
    if filename.contains('/') {
        return false;
    }
    let Some((_, ext)) = filename.rsplit_once('.') else {
        return false;
    };
    // 文本模型用 tokenizer，不需要 processor 配置
    if kind == ModelKind::Text && filename == "preprocessor_config.json" {
        return false;
    }
    // 训练器状态，推理用不到
    if filename == "training_args.bin" {
        return false;
    }
    ARTIFACT_EXTENSIONS.contains(&ext)
}

/// 从仓库文件列表中挑出要拉取的文件
///
/// 同时发布两种权重格式时只取 safetensors
fn select_files<'a>(names: impl IntoIterator<Item = &'a str>, kind: ModelKind) -> Vec<String> {
    let picked: Vec<&str> = names.into_iter().filter(|n| wanted(n, kind)).collect();
    let has_safetensors = picked.iter().any(|n| n.ends_with(".safetensors"));
    picked
        .into_iter()
        .filter(|n| !(has_safetensors && n.ends_with(".bin")))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl ArtifactSource for HubArtifactSource {
    async fn acquire(&self, model_id: &str, kind: ModelKind) -> Result<ModelArtifact, DeployError> {
        let unavailable = |e: hf_hub::api::tokio::ApiError| {
            DeployError::ArtifactUnavailable(format!(
                "Failed to download model '{}': {}",
                model_id, e
            ))
        };

        let repo = self.api.model(model_id.to_string());
        let info = repo.info().await.map_err(unavailable)?;

        let names = select_files(info.siblings.iter().map(|s| s.rfilename.as_str()), kind);

        if !names.iter().any(|n| n == "config.json") {
            warn!(model_id, "Repository has no config.json");
        }

        info!(model_id, files = names.len(), "Downloading model files");

        let mut files = Vec::with_capacity(names.len());
        for name in &names {
            let path = repo.get(name).await.map_err(unavailable)?;
            debug!(model_id, file = %name, "Downloaded");
            files.push(path);
        }

        let dir = files
            .first()
            .and_then(|p| p.parent())
            .map(PathBuf::from)
            .ok_or_else(|| {
                DeployError::ArtifactUnavailable(format!(
                    "Model '{}' has no downloadable files",
                    model_id
                ))
            })?;

        Ok(ModelArtifact {
            model_id: model_id.to_string(),
            dir,
            files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wanted_files() {
        assert!(wanted("config.json", ModelKind::Text));
        assert!(wanted("model.safetensors", ModelKind::Text));
        assert!(wanted("pytorch_model.bin", ModelKind::Text));
        assert!(wanted("tokenizer.model", ModelKind::Text));
        assert!(!wanted("README.md", ModelKind::Text));
        assert!(!wanted(".gitattributes", ModelKind::Text));
        assert!(!wanted("onnx/model.onnx", ModelKind::Generic));
        assert!(!wanted("LICENSE", ModelKind::Generic));
        assert!(!wanted("preprocessor_config.json", ModelKind::Text));
        assert!(wanted("preprocessor_config.json", ModelKind::Generic));
        assert!(!wanted("training_args.bin", ModelKind::Text));
    }

    #[test]
    fn test_select_prefers_safetensors() {
        let listing = [
            "config.json",
            "pytorch_model.bin",
            "model.safetensors",
            "tf_model.h5",
            "training_args.bin",
            "merges.txt",
        ];
        assert_eq!(
            select_files(listing, ModelKind::Text),
            vec!["config.json", "model.safetensors", "merges.txt"]
        );

        // 只有 .bin 权重时保留
        let legacy = ["config.json", "pytorch_model.bin", "training_args.bin", "vocab.txt"];
        assert_eq!(
            select_files(legacy, ModelKind::Text),
            vec!["config.json", "pytorch_model.bin", "vocab.txt"]
        );
    }

    #[test]
    fn test_total_size() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("config.json");
        let b = dir.path().join("model.safetensors");
        std::fs::write(&a, "{}").unwrap();
        std::fs::write(&b, vec![0u8; 1024]).unwrap();

        let artifact = ModelArtifact {
            model_id: "demo/model".to_string(),
            dir: dir.path().to_path_buf(),
            files: vec![a, b],
        };
        assert_eq!(artifact.total_size(), 1026);
    }
}
