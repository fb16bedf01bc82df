//! 部署事件中继
//!
//! 流水线只往 `AppState::events` 发送事件；中继任务订阅该通道，
//! 按 deployment_id 转发给 WebSocket 订阅者。

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state::AppState;

/// 启动中继任务
///
/// 接收端在返回前创建，之后发布的事件都不会丢失（除非积压超过通道容量）
pub fn spawn_relay(state: &Arc<AppState>) -> JoinHandle<()> {
    let mut rx = state.events.subscribe();
    let state = state.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => {
                        let deployment_id = event.deployment_id().to_string();
                        let delivered = state.subscribers.broadcast(&deployment_id, &event).await;
                        debug!(deployment_id = %deployment_id, delivered, "Event relayed");
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged = n, "Event relay lagged, events dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Event relay stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeploymentEvent, LifecycleEvent};
    use crate::test_support;

    #[tokio::test]
    async fn test_relay_forwards_to_subscribers() {
        let (state, _dir) = test_support::state(test_support::FakeSource::instant());
        let relay = spawn_relay(&state);
        let (_, mut rx) = state.subscribers.subscribe("d1").await;

        state.publish(DeploymentEvent::Lifecycle(LifecycleEvent::DeploymentStopped {
            deployment_id: "d1".to_string(),
        }));

        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(json["type"], "deployment_stopped");

        state.shutdown.cancel();
        relay.await.unwrap();
    }
}
