//! 应用状态

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::env::constants::EVENT_CHANNEL_CAPACITY;
use crate::config::EnvConfig;
use crate::domain::DeploymentEvent;
use crate::infra::{ArtifactSource, HubArtifactSource, PortAllocator, ProcessSupervisor};

use super::notifier::SubscriberHub;
use super::progress::ProgressBoard;
use super::registry::DeploymentRegistry;
use super::tasks::PipelineTasks;

/// 应用状态
pub struct AppState {
    // ========== 核心配置 ==========
    /// 环境配置
    pub config: EnvConfig,
    /// 服务启动时间
    pub started_at: DateTime<Utc>,

    // ========== 部署管理 ==========
    /// 部署注册表
    pub registry: DeploymentRegistry,
    /// 进度表
    pub progress: ProgressBoard,
    /// 流水线任务表
    pub tasks: PipelineTasks,
    /// 端口分配器（注册表共享同一实例）
    pub ports: Arc<PortAllocator>,
    /// 推理服务进程启动器
    pub supervisor: ProcessSupervisor,
    /// 模型文件来源
    pub artifacts: Arc<dyn ArtifactSource>,

    // ========== 事件推送 ==========
    /// 部署事件通道（流水线 -> 订阅者中继）
    pub events: broadcast::Sender<DeploymentEvent>,
    /// WebSocket 订阅者
    pub subscribers: SubscriberHub,

    // ========== 外部调用 ==========
    /// 访问推理服务子进程的 HTTP 客户端
    pub http: reqwest::Client,
    /// 关闭信号
    pub shutdown: CancellationToken,
}

impl AppState {
    /// 使用 Hugging Face Hub 作为模型来源
    pub fn new(config: EnvConfig) -> anyhow::Result<Self> {
        let source = HubArtifactSource::new(
            config.storage.hf_cache_dir.clone(),
            config.storage.hf_token.clone(),
        )?;
        Self::with_source(config, Arc::new(source))
    }

    /// 使用指定的模型来源
    pub fn with_source(
        config: EnvConfig,
        artifacts: Arc<dyn ArtifactSource>,
    ) -> anyhow::Result<Self> {
        tracing::info!(
            host = %config.host,
            port = config.port,
            api_prefix = %config.api_prefix,
            serve_ports = ?config.serving.port_range,
            port_probe = ?config.serving.port_probe,
            model_storage = %config.storage.model_storage_path.display(),
            api_key = config.api_key.is_some(),
            "Loaded configuration"
        );

        let ports = Arc::new(PortAllocator::new(
            config.serving.port_range.clone(),
            config.serving.port_probe,
        ));
        let supervisor =
            ProcessSupervisor::new(config.serving.startup_grace, config.serving.stop_grace);
        let http = reqwest::Client::builder()
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .build()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            started_at: Utc::now(),
            registry: DeploymentRegistry::new(ports.clone()),
            progress: ProgressBoard::new(),
            tasks: PipelineTasks::new(),
            ports,
            supervisor,
            artifacts,
            events,
            subscribers: SubscriberHub::new(),
            http,
            shutdown: CancellationToken::new(),
            config,
        })
    }

    /// 发布部署事件（没有接收者时忽略）
    pub fn publish(&self, event: DeploymentEvent) {
        let _ = self.events.send(event);
    }

    /// 关闭：中止流水线，停止所有推理服务
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.shutdown();
        self.registry.stop_all(self.supervisor.stop_grace()).await;
        tracing::info!("All deployments stopped");
    }
}
