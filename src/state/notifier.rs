//! 订阅者广播
//!
//! deployment_id -> 订阅者列表。每个 WebSocket 连接注册一个 mpsc 发送端，
//! 广播时逐个投递，投递失败的订阅者在本轮结束后统一移除。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::config::env::constants::SUBSCRIBER_CHANNEL_CAPACITY;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// 订阅者中心
pub struct SubscriberHub {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 订阅某个部署，返回订阅 ID 和接收端
    pub async fn subscribe(&self, deployment_id: &str) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .await
            .entry(deployment_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        debug!(deployment_id, subscriber = id, "Subscriber added");
        (id, rx)
    }

    /// 取消订阅
    pub async fn unsubscribe(&self, deployment_id: &str, subscriber_id: u64) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(list) = subscribers.get_mut(deployment_id) {
            list.retain(|s| s.id != subscriber_id);
            if list.is_empty() {
                subscribers.remove(deployment_id);
            }
        }
        debug!(deployment_id, subscriber = subscriber_id, "Subscriber removed");
    }

    /// 向部署的所有订阅者广播
    ///
    /// 返回成功投递的数量
    pub async fn broadcast<T: Serialize>(&self, deployment_id: &str, event: &T) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(deployment_id, error = %e, "Failed to serialize event");
                return 0;
            }
        };

        let (delivered, failed) = {
            let subscribers = self.subscribers.read().await;
            let Some(list) = subscribers.get(deployment_id) else {
                return 0;
            };

            let mut delivered = 0;
            let mut failed = Vec::new();
            for subscriber in list {
                match subscriber.tx.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => failed.push(subscriber.id),
                }
            }
            (delivered, failed)
        };

        if !failed.is_empty() {
            warn!(
                deployment_id,
                pruned = failed.len(),
                "Removing subscribers that failed to receive"
            );
            let mut subscribers = self.subscribers.write().await;
            if let Some(list) = subscribers.get_mut(deployment_id) {
                list.retain(|s| !failed.contains(&s.id));
                if list.is_empty() {
                    subscribers.remove(deployment_id);
                }
            }
        }

        delivered
    }

    pub async fn subscriber_count(&self, deployment_id: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(deployment_id)
            .map_or(0, Vec::len)
    }

    pub async fn total_subscribers(&self) -> usize {
        self.subscribers.read().await.values().map(Vec::len).sum()
    }
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new()
    }
}
