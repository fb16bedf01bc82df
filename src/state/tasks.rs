//! 部署流水线任务表
//!
//! 记录每个部署后台任务的 JoinHandle，删除部署或关闭服务时可以中止未完成的流水线。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct PipelineTasks {
    handles: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PipelineTasks {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// 启动后台任务
    pub fn spawn<F>(&self, deployment_id: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        let mut handles = self.lock();
        handles.retain(|_, h| !h.is_finished());
        if let Some(previous) = handles.insert(deployment_id.to_string(), handle) {
            previous.abort();
        }
    }

    /// 中止某个部署的流水线，返回是否确实中止了运行中的任务
    pub fn abort(&self, deployment_id: &str) -> bool {
        match self.lock().remove(deployment_id) {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                debug!(deployment_id, "Pipeline task aborted");
                true
            }
            _ => false,
        }
    }

    /// 中止所有未完成的流水线
    pub fn shutdown(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = self.lock().drain().collect();
        let mut aborted = 0;
        for (_, handle) in handles {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        info!(aborted, "Pipeline tasks shut down");
    }

    pub fn active_count(&self) -> usize {
        self.lock().values().filter(|h| !h.is_finished()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PipelineTasks {
    fn default() -> Self {
        Self::new()
    }
}
