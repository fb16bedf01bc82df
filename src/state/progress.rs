//! 部署进度跟踪
//!
//! 每个部署一个 `ProgressTracker`，由部署流水线独占写入，状态查询和 WebSocket 读取快照。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::RwLock;

use crate::config::env::constants::TOTAL_PHASES;
use crate::domain::{ProgressSnapshot, ProgressStatus};

/// 部分更新，未设置的字段保持不变
#[derive(Clone, Debug, Default)]
pub struct ProgressUpdate {
    pub status: Option<ProgressStatus>,
    pub percent: Option<u8>,
    pub message: Option<String>,
    /// 设置时完成阶段计数 +1
    pub phase: Option<String>,
}

impl ProgressUpdate {
    pub fn status(mut self, status: ProgressStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }
}

#[derive(Debug)]
struct ProgressInner {
    status: ProgressStatus,
    percent: u8,
    message: String,
    current_step: String,
    completed_steps: u32,
    errors: Vec<String>,
}

/// 单个部署的进度记录
#[derive(Debug)]
pub struct ProgressTracker {
    deployment_id: String,
    started: Instant,
    inner: Mutex<ProgressInner>,
}

impl ProgressTracker {
    pub fn new(deployment_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            started: Instant::now(),
            inner: Mutex::new(ProgressInner {
                status: ProgressStatus::Initializing,
                percent: 0,
                message: "Deployment initialized".to_string(),
                current_step: String::new(),
                completed_steps: 0,
                errors: Vec::new(),
            }),
        }
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// 应用部分更新，返回更新后的快照
    ///
    /// 进入 failed 后不再推进阶段；百分比不回退
    pub fn update(&self, update: ProgressUpdate) -> ProgressSnapshot {
        {
            let mut inner = self.lock();
            let failed = inner.status == ProgressStatus::Failed;

            if let Some(status) = update.status {
                if !failed {
                    inner.status = status;
                }
            }
            if let Some(percent) = update.percent {
                inner.percent = inner.percent.max(percent.min(100));
            }
            if let Some(message) = update.message {
                inner.message = message;
            }
            if let Some(phase) = update.phase {
                if !failed {
                    inner.current_step = phase;
                    inner.completed_steps = (inner.completed_steps + 1).min(TOTAL_PHASES);
                }
            }
        }
        self.snapshot()
    }

    /// 记录错误并转为 failed，current_step 保持在失败的阶段
    pub fn fail(&self, error: impl Into<String>) -> ProgressSnapshot {
        {
            let mut inner = self.lock();
            let error = error.into();
            inner.message = format!("Deployment failed: {}", error);
            inner.errors.push(error);
            inner.status = ProgressStatus::Failed;
        }
        self.snapshot()
    }

    pub fn status(&self) -> ProgressStatus {
        self.lock().status
    }

    /// 当前快照
    pub fn snapshot(&self) -> ProgressSnapshot {
        let inner = self.lock();
        ProgressSnapshot {
            deployment_id: self.deployment_id.clone(),
            status: inner.status,
            progress: inner.percent,
            message: inner.message.clone(),
            current_step: inner.current_step.clone(),
            completed_steps: inner.completed_steps,
            total_steps: TOTAL_PHASES,
            elapsed_time: self.started.elapsed().as_secs_f64(),
            errors: inner.errors.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressInner> {
        // 临界区内没有 panic 路径，中毒时沿用内部数据
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 所有部署的进度表
pub struct ProgressBoard {
    trackers: RwLock<HashMap<String, Arc<ProgressTracker>>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self {
            trackers: RwLock::new(HashMap::new()),
        }
    }

    /// 为新部署创建 tracker（覆盖同 ID 的旧记录）
    pub async fn create(&self, deployment_id: &str) -> Arc<ProgressTracker> {
        let tracker = Arc::new(ProgressTracker::new(deployment_id));
        self.trackers
            .write()
            .await
            .insert(deployment_id.to_string(), tracker.clone());
        tracker
    }

    pub async fn get(&self, deployment_id: &str) -> Option<Arc<ProgressTracker>> {
        self.trackers.read().await.get(deployment_id).cloned()
    }

    pub async fn snapshot(&self, deployment_id: &str) -> Option<ProgressSnapshot> {
        self.get(deployment_id).await.map(|t| t.snapshot())
    }

    pub async fn remove(&self, deployment_id: &str) {
        self.trackers.write().await.remove(deployment_id);
    }

    /// 未到终态的部署数量
    pub async fn in_progress(&self) -> usize {
        self.trackers
            .read()
            .await
            .values()
            .filter(|t| !t.status().is_terminal())
            .count()
    }
}

impl Default for ProgressBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_update_keeps_other_fields() {
        let tracker = ProgressTracker::new("d1");
        tracker.update(
            ProgressUpdate::default()
                .status(ProgressStatus::Validating)
                .percent(10)
                .message("Validating configuration...")
                .phase("Configuration validation"),
        );

        let snap = tracker.update(ProgressUpdate::default().percent(15));
        assert_eq!(snap.status, ProgressStatus::Validating);
        assert_eq!(snap.progress, 15);
        assert_eq!(snap.message, "Validating configuration...");
        assert_eq!(snap.current_step, "Configuration validation");
        assert_eq!(snap.completed_steps, 1);
        assert_eq!(snap.total_steps, 6);
    }

    #[test]
    fn test_percent_never_decreases() {
        let tracker = ProgressTracker::new("d1");
        tracker.update(ProgressUpdate::default().percent(60));
        let snap = tracker.update(ProgressUpdate::default().percent(20));
        assert_eq!(snap.progress, 60);
        let snap = tracker.update(ProgressUpdate::default().percent(250));
        assert_eq!(snap.progress, 100);
    }

    #[test]
    fn test_failure_is_absorbing() {
        let tracker = ProgressTracker::new("d1");
        tracker.update(
            ProgressUpdate::default()
                .status(ProgressStatus::Downloading)
                .percent(20)
                .phase("Model download"),
        );
        let snap = tracker.fail("Model download timed out after 1 seconds");
        assert_eq!(snap.status, ProgressStatus::Failed);
        assert_eq!(snap.errors.len(), 1);
        assert_eq!(snap.current_step, "Model download");

        let snap = tracker.update(
            ProgressUpdate::default()
                .status(ProgressStatus::Loading)
                .phase("Model loading"),
        );
        assert_eq!(snap.status, ProgressStatus::Failed);
        assert_eq!(snap.current_step, "Model download");
        assert_eq!(snap.completed_steps, 1);
    }

    #[tokio::test]
    async fn test_board_tracks_in_progress() {
        let board = ProgressBoard::new();
        let a = board.create("a").await;
        board.create("b").await;
        assert_eq!(board.in_progress().await, 2);

        a.fail("boom");
        assert_eq!(board.in_progress().await, 1);
        assert_eq!(
            board.snapshot("a").await.unwrap().status,
            ProgressStatus::Failed
        );

        board.remove("a").await;
        assert!(board.snapshot("a").await.is_none());
    }
}
