//! 测试辅助：临时目录配置、假模型来源、假解释器

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::config::EnvConfig;
use crate::domain::ModelKind;
use crate::error::DeployError;
use crate::infra::{ArtifactSource, ModelArtifact, PortProbe};
use crate::state::AppState;

/// 假模型来源
pub struct FakeSource {
    delay: Duration,
    fail: Option<String>,
}

impl FakeSource {
    pub fn instant() -> Self {
        Self {
            delay: Duration::ZERO,
            fail: None,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { delay, fail: None }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            fail: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl ArtifactSource for FakeSource {
    async fn acquire(&self, model_id: &str, _kind: ModelKind) -> Result<ModelArtifact, DeployError> {
        tokio::time::sleep(self.delay).await;
        if let Some(message) = &self.fail {
            return Err(DeployError::ArtifactUnavailable(message.clone()));
        }

        let dir = std::env::temp_dir().join(format!("fake-model-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).map_err(|e| DeployError::PipelineInternal(e.to_string()))?;
        let config = dir.join("config.json");
        std::fs::write(&config, r#"{"architectures": ["GPT2LMHeadModel"], "model_type": "gpt2"}"#)
            .map_err(|e| DeployError::PipelineInternal(e.to_string()))?;

        Ok(ModelArtifact {
            model_id: model_id.to_string(),
            dir,
            files: vec![config],
        })
    }
}

/// 写一个可执行的 shell 脚本
pub fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().to_string()
}

/// 指向临时目录的配置，解释器是一个常驻的 sleep 脚本
pub fn config(dir: &Path) -> EnvConfig {
    let mut config = EnvConfig::from_env();
    config.api_prefix = "/api/v1".to_string();
    config.cors_origins = vec!["*".to_string()];
    config.storage.model_storage_path = dir.join("models");
    config.storage.logs_path = dir.join("logs");
    config.storage.hf_cache_dir = dir.join("cache");
    config.serving.python_path = write_script(dir, "fake-python", "exec sleep 30");
    config.serving.startup_grace = Duration::from_millis(200);
    config.serving.stop_grace = Duration::from_secs(2);
    config.serving.port_probe = PortProbe::Bind;
    config.serving.port_range = free_port_range(20);
    config.api_key = None;
    config.enable_metrics = true;
    config.create_directories().unwrap();
    config
}

/// 使用默认测试配置构建状态
pub fn state(source: FakeSource) -> (Arc<AppState>, TempDir) {
    state_with(source, |_| {})
}

/// 构建状态，允许调整配置
pub fn state_with(
    source: FakeSource,
    tweak: impl FnOnce(&mut EnvConfig),
) -> (Arc<AppState>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    tweak(&mut config);
    let state = AppState::with_source(config, Arc::new(source)).unwrap();
    (Arc::new(state), dir)
}

fn free_port_range(len: u16) -> std::ops::Range<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base = listener.local_addr().unwrap().port();
    drop(listener);
    let start = base.min(65000);
    start..start + len
}

/// 等待部署进度进入终态
pub async fn wait_terminal(state: &AppState, deployment_id: &str) -> crate::domain::ProgressSnapshot {
    for _ in 0..100 {
        if let Some(snapshot) = state.progress.snapshot(deployment_id).await {
            if snapshot.status.is_terminal() {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("deployment {} did not finish", deployment_id);
}
