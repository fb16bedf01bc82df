//! 推送给订阅者的部署事件

use serde::Serialize;

use super::progress::ProgressSnapshot;

/// 生命周期事件
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    DeploymentStarted { deployment_id: String, port: u16 },
    DeploymentStopped { deployment_id: String },
    DeploymentRemoved { deployment_id: String },
}

/// 部署事件
///
/// 进度快照按原样序列化，生命周期事件带 `type` 字段
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum DeploymentEvent {
    Progress(ProgressSnapshot),
    Lifecycle(LifecycleEvent),
}

impl DeploymentEvent {
    pub fn deployment_id(&self) -> &str {
        match self {
            DeploymentEvent::Progress(snapshot) => &snapshot.deployment_id,
            DeploymentEvent::Lifecycle(LifecycleEvent::DeploymentStarted { deployment_id, .. })
            | DeploymentEvent::Lifecycle(LifecycleEvent::DeploymentStopped { deployment_id })
            | DeploymentEvent::Lifecycle(LifecycleEvent::DeploymentRemoved { deployment_id }) => {
                deployment_id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_event_json() {
        let event = DeploymentEvent::Lifecycle(LifecycleEvent::DeploymentStarted {
            deployment_id: "d1".to_string(),
            port: 8100,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deployment_started");
        assert_eq!(json["port"], 8100);
        assert_eq!(event.deployment_id(), "d1");
    }
}
