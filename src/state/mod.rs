//! 共享状态模块

pub mod app_state;
pub mod notifier;
pub mod progress;
pub mod registry;
pub mod tasks;

pub use app_state::AppState;
pub use notifier::SubscriberHub;
pub use progress::{ProgressBoard, ProgressTracker, ProgressUpdate};
pub use registry::{DeploymentRecord, DeploymentRegistry};
pub use tasks::PipelineTasks;
