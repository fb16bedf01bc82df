//! 部署进度模型

use serde::Serialize;

/// 进度状态
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Initializing,
    Validating,
    Downloading,
    Loading,
    CreatingPipeline,
    StartingServer,
    Completed,
    Failed,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Initializing => "initializing",
            ProgressStatus::Validating => "validating",
            ProgressStatus::Downloading => "downloading",
            ProgressStatus::Loading => "loading",
            ProgressStatus::CreatingPipeline => "creating_pipeline",
            ProgressStatus::StartingServer => "starting_server",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStatus::Completed | ProgressStatus::Failed)
    }
}

/// 部署流水线阶段
///
/// 百分比是固定检查点，不是实际测量值
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeployPhase {
    Validating,
    Downloading,
    Loading,
    CreatingPipeline,
    StartingServer,
    Completed,
}

impl DeployPhase {
    pub const ALL: [DeployPhase; 6] = [
        DeployPhase::Validating,
        DeployPhase::Downloading,
        DeployPhase::Loading,
        DeployPhase::CreatingPipeline,
        DeployPhase::StartingServer,
        DeployPhase::Completed,
    ];

    pub fn status(&self) -> ProgressStatus {
        match self {
            DeployPhase::Validating => ProgressStatus::Validating,
            DeployPhase::Downloading => ProgressStatus::Downloading,
            DeployPhase::Loading => ProgressStatus::Loading,
            DeployPhase::CreatingPipeline => ProgressStatus::CreatingPipeline,
            DeployPhase::StartingServer => ProgressStatus::StartingServer,
            DeployPhase::Completed => ProgressStatus::Completed,
        }
    }

    pub fn percent(&self) -> u8 {
        match self {
            DeployPhase::Validating => 10,
            DeployPhase::Downloading => 20,
            DeployPhase::Loading => 60,
            DeployPhase::CreatingPipeline => 75,
            DeployPhase::StartingServer => 85,
            DeployPhase::Completed => 100,
        }
    }

    /// 显示名称
    pub fn step_name(&self) -> &'static str {
        match self {
            DeployPhase::Validating => "Configuration validation",
            DeployPhase::Downloading => "Model download",
            DeployPhase::Loading => "Model loading",
            DeployPhase::CreatingPipeline => "Pipeline creation",
            DeployPhase::StartingServer => "Server startup",
            DeployPhase::Completed => "Deployment complete",
        }
    }
}

/// 进度快照（WebSocket / 状态查询返回的 JSON）
#[derive(Clone, Debug, Serialize)]
pub struct ProgressSnapshot {
    pub deployment_id: String,
    pub status: ProgressStatus,
    pub progress: u8,
    pub message: String,
    pub current_step: String,
    pub completed_steps: u32,
    pub total_steps: u32,
    /// 已耗时（秒）
    pub elapsed_time: f64,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_checkpoints_increase() {
        let percents: Vec<u8> = DeployPhase::ALL.iter().map(|p| p.percent()).collect();
        assert_eq!(percents, vec![10, 20, 60, 75, 85, 100]);
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&ProgressStatus::CreatingPipeline).unwrap();
        assert_eq!(json, "\"creating_pipeline\"");
        assert_eq!(
            DeployPhase::StartingServer.status().as_str(),
            "starting_server"
        );
        assert!(ProgressStatus::Failed.is_terminal());
        assert!(!ProgressStatus::Loading.is_terminal());
    }
}
