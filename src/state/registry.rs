//! 部署注册表
//!
//! deployment_id -> DeploymentRecord 的内存映射，是列表/查询/停止操作的唯一数据来源。
//! 运行中的记录持有子进程句柄和端口预留；进程退出在查询时被动发现。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::{DeployRequest, DeploymentStatus, ModelKind};
use crate::error::DeployError;
use crate::infra::{PortAllocator, ServerProcess};
use crate::services::inference::BoundPipeline;

/// 部署记录
#[derive(Clone, Debug)]
pub struct DeploymentRecord {
    pub deployment_id: String,
    pub request: DeployRequest,
    pub model_id: Option<String>,
    pub kind: ModelKind,
    pub port: Option<u16>,
    /// 仅在 running 时非空
    pub process: Option<Arc<ServerProcess>>,
    pub pipeline: Option<Arc<BoundPipeline>>,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl DeploymentRecord {
    /// 新建 pending 记录
    pub fn pending(deployment_id: String, request: DeployRequest) -> Self {
        Self {
            model_id: request.model_reference().map(str::to_string),
            kind: request.kind(),
            deployment_id,
            request,
            port: None,
            process: None,
            pipeline: None,
            status: DeploymentStatus::Pending,
            created_at: Utc::now(),
            error: None,
        }
    }

    /// 清除运行期资源，返回持有的端口
    fn detach(&mut self, status: DeploymentStatus) -> Option<u16> {
        self.status = status;
        self.process = None;
        self.pipeline = None;
        self.port.take()
    }
}

/// 部署注册表
pub struct DeploymentRegistry {
    records: RwLock<HashMap<String, DeploymentRecord>>,
    ports: Arc<PortAllocator>,
}

impl DeploymentRegistry {
    pub fn new(ports: Arc<PortAllocator>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ports,
        }
    }

    /// 插入新记录，ID 已存在时返回 DeploymentExists
    pub async fn put(&self, record: DeploymentRecord) -> Result<(), DeployError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.deployment_id) {
            return Err(DeployError::DeploymentExists(record.deployment_id));
        }
        records.insert(record.deployment_id.clone(), record);
        Ok(())
    }

    /// 查询单个记录（刷新存活状态）
    pub async fn get(&self, deployment_id: &str) -> Option<DeploymentRecord> {
        self.refresh(Some(deployment_id)).await;
        let records = self.records.read().await;
        records.get(deployment_id).cloned()
    }

    /// 列出所有记录（刷新存活状态），按创建时间排序
    pub async fn list(&self) -> Vec<DeploymentRecord> {
        self.refresh(None).await;
        let records = self.records.read().await;
        let mut all: Vec<DeploymentRecord> = records.values().cloned().collect();
        all.sort_by_key(|r| r.created_at);
        all
    }

    pub async fn contains(&self, deployment_id: &str) -> bool {
        self.records.read().await.contains_key(deployment_id)
    }

    /// 为 pending 记录分配端口
    ///
    /// 记录已不存在或已停止时立即释放端口
    pub async fn assign_port(&self, deployment_id: &str) -> Result<u16, DeployError> {
        let port = self.ports.clone().allocate_blocking().await?;
        let mut records = self.records.write().await;
        match records.get_mut(deployment_id) {
            Some(record) if record.status == DeploymentStatus::Pending => {
                record.port = Some(port);
                Ok(port)
            }
            Some(_) => {
                self.ports.release(port);
                Err(DeployError::PipelineInternal(format!(
                    "deployment '{}' was stopped during startup",
                    deployment_id
                )))
            }
            None => {
                self.ports.release(port);
                Err(DeployError::DeploymentNotFound(deployment_id.to_string()))
            }
        }
    }

    /// 标记为运行中
    ///
    /// 记录在流水线执行期间被删除时返回 DeploymentNotFound，被停止时返回 PipelineInternal，
    /// 两种情况下调用方都负责停止进程
    pub async fn mark_running(
        &self,
        deployment_id: &str,
        process: Arc<ServerProcess>,
        pipeline: Arc<BoundPipeline>,
    ) -> Result<(), DeployError> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(deployment_id)
            .ok_or_else(|| DeployError::DeploymentNotFound(deployment_id.to_string()))?;
        if record.status != DeploymentStatus::Pending {
            return Err(DeployError::PipelineInternal(format!(
                "deployment '{}' was stopped during startup",
                deployment_id
            )));
        }
        record.process = Some(process);
        record.pipeline = Some(pipeline);
        record.status = DeploymentStatus::Running;
        record.error = None;
        Ok(())
    }

    /// 标记为失败并释放端口
    ///
    /// 只作用于 pending 记录，已停止的记录保持 stopped
    pub async fn mark_failed(&self, deployment_id: &str, error: &str) {
        let port = {
            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(deployment_id) else {
                return;
            };
            if record.status != DeploymentStatus::Pending {
                return;
            }
            record.error = Some(error.to_string());
            record.detach(DeploymentStatus::Failed)
        };
        if let Some(port) = port {
            self.ports.release(port);
        }
    }

    /// 停止部署但保留记录（幂等）
    ///
    /// pending 记录直接转为 stopped 并释放已分配的端口，中止流水线由调用方负责
    pub async fn stop(
        &self,
        deployment_id: &str,
        grace: Duration,
    ) -> Result<DeploymentRecord, DeployError> {
        let (process, port, snapshot) = {
            let mut records = self.records.write().await;
            let record = records
                .get_mut(deployment_id)
                .ok_or_else(|| DeployError::DeploymentNotFound(deployment_id.to_string()))?;

            if !matches!(
                record.status,
                DeploymentStatus::Running | DeploymentStatus::Pending
            ) {
                return Ok(record.clone());
            }
            let process = record.process.clone();
            let port = record.detach(DeploymentStatus::Stopped);
            (process, port, record.clone())
        };

        if let Some(process) = process {
            process.stop(grace).await;
        }
        if let Some(port) = port {
            self.ports.release(port);
        }
        info!(deployment_id, "Deployment stopped");
        Ok(snapshot)
    }

    /// 删除记录：先移出注册表，再停止进程、释放端口
    pub async fn remove(
        &self,
        deployment_id: &str,
        grace: Duration,
    ) -> Result<DeploymentRecord, DeployError> {
        let mut record = self
            .records
            .write()
            .await
            .remove(deployment_id)
            .ok_or_else(|| DeployError::DeploymentNotFound(deployment_id.to_string()))?;

        if let Some(process) = record.process.take() {
            process.stop(grace).await;
        }
        if let Some(port) = record.port.take() {
            self.ports.release(port);
        }
        record.pipeline = None;
        info!(deployment_id, "Deployment removed");
        Ok(record)
    }

    /// 停止所有运行中的部署
    pub async fn stop_all(&self, grace: Duration) {
        let running: Vec<String> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|r| r.status == DeploymentStatus::Running)
                .map(|r| r.deployment_id.clone())
                .collect()
        };

        let stops = running.iter().map(|id| self.stop(id, grace));
        for result in futures_util::future::join_all(stops).await {
            if let Err(e) = result {
                warn!(error = %e, "Failed to stop deployment during shutdown");
            }
        }
    }

    /// 各状态的部署数量
    pub async fn count_by_status(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for record in self.list().await {
            *counts.entry(record.status.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// 惰性存活检查：进程已退出的 running 记录转为 stopped
    async fn refresh(&self, only: Option<&str>) {
        let candidates: Vec<(String, Arc<ServerProcess>)> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|r| only.map_or(true, |id| r.deployment_id == id))
                .filter(|r| r.status == DeploymentStatus::Running)
                .filter_map(|r| r.process.clone().map(|p| (r.deployment_id.clone(), p)))
                .collect()
        };

        let mut exited = Vec::new();
        for (id, process) in candidates {
            if !process.is_alive().await {
                exited.push((id, process));
            }
        }
        if exited.is_empty() {
            return;
        }

        let mut released = Vec::new();
        {
            let mut records = self.records.write().await;
            for (id, process) in exited {
                let Some(record) = records.get_mut(&id) else {
                    continue;
                };
                // 期间可能已被停止或替换
                let same = record
                    .process
                    .as_ref()
                    .is_some_and(|p| Arc::ptr_eq(p, &process));
                if record.status == DeploymentStatus::Running && same {
                    warn!(deployment_id = %id, "Inference server exited unexpectedly");
                    if let Some(port) = record.detach(DeploymentStatus::Stopped) {
                        released.push(port);
                    }
                }
            }
        }
        for port in released {
            self.ports.release(port);
        }
    }
}
