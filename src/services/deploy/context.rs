//! 部署上下文
//!
//! 流水线通过上下文写进度：先更新 tracker，再把快照推到事件通道，
//! 由事件中继转发给 WebSocket 订阅者。

use std::sync::Arc;

use tracing::debug;

use crate::domain::{DeployPhase, DeploymentEvent, LifecycleEvent, ProgressSnapshot};
use crate::state::{AppState, ProgressTracker, ProgressUpdate};

/// 部署执行上下文
#[derive(Clone)]
pub struct DeployContext {
    pub deployment_id: String,
    pub state: Arc<AppState>,
    pub tracker: Arc<ProgressTracker>,
}

impl DeployContext {
    pub fn new(state: Arc<AppState>, tracker: Arc<ProgressTracker>) -> Self {
        Self {
            deployment_id: tracker.deployment_id().to_string(),
            state,
            tracker,
        }
    }

    /// 应用部分更新并推送快照
    pub fn report(&self, update: ProgressUpdate) -> ProgressSnapshot {
        let snapshot = self.tracker.update(update);
        self.publish(snapshot.clone());
        snapshot
    }

    /// 进入新阶段
    pub fn enter(&self, phase: DeployPhase, message: impl Into<String>) {
        debug!(
            deployment_id = %self.deployment_id,
            phase = phase.status().as_str(),
            "Entering phase"
        );
        self.report(
            ProgressUpdate::default()
                .status(phase.status())
                .percent(phase.percent())
                .message(message)
                .phase(phase.step_name()),
        );
    }

    /// 阶段内的中间检查点
    pub fn checkpoint(&self, percent: u8, message: impl Into<String>) {
        self.report(ProgressUpdate::default().percent(percent).message(message));
    }

    /// 记录失败
    pub fn fail(&self, error: &str) -> ProgressSnapshot {
        let snapshot = self.tracker.fail(error);
        self.publish(snapshot.clone());
        snapshot
    }

    /// 推送生命周期事件
    pub fn lifecycle(&self, event: LifecycleEvent) {
        self.state.publish(DeploymentEvent::Lifecycle(event));
    }

    fn publish(&self, snapshot: ProgressSnapshot) {
        self.state.publish(DeploymentEvent::Progress(snapshot));
    }
}
