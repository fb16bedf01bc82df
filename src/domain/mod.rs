//! 领域模型模块
//!
//! 纯数据结构，不依赖 axum/tokio

pub mod deployment;
pub mod event;
pub mod progress;

// Re-exports for convenience
pub use deployment::{
    Dependencies, DeployRequest, DeploymentStatus, DeploymentSummary, HardwareConfig, ModelKind,
    ModelRef, UsageInstructions,
};
pub use event::{DeploymentEvent, LifecycleEvent};
pub use progress::{DeployPhase, ProgressSnapshot, ProgressStatus};
