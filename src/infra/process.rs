//! 推理服务子进程管理
//!
//! 每个部署对应一个独立的 Python 子进程，stdout/stderr 写入该部署的日志文件。
//! 启动后等待一个宽限期，若子进程已经退出则视为启动失败。

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DeployError;

/// 启动参数
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub log_path: PathBuf,
    pub envs: HashMap<String, String>,
}

/// 子进程启动器
#[derive(Clone, Debug)]
pub struct ProcessSupervisor {
    startup_grace: Duration,
    stop_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(startup_grace: Duration, stop_grace: Duration) -> Self {
        Self {
            startup_grace,
            stop_grace,
        }
    }

    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    /// 启动子进程
    ///
    /// 宽限期结束时子进程必须仍然存活
    pub async fn start(&self, spec: &LaunchSpec) -> Result<ServerProcess, DeployError> {
        if let Some(parent) = spec.log_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| start_failed(spec, e))?;
        }
        let stdout = File::create(&spec.log_path).map_err(|e| start_failed(spec, e))?;
        let stderr = stdout.try_clone().map_err(|e| start_failed(spec, e))?;

        info!(
            program = %spec.program,
            args = ?spec.args,
            log = %spec.log_path.display(),
            "Starting inference server"
        );

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(&spec.work_dir)
            .envs(&spec.envs)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| start_failed(spec, e))?;

        tokio::time::sleep(self.startup_grace).await;

        match child.try_wait() {
            Ok(Some(status)) => {
                let tail = read_tail(&spec.log_path, 20).join("\n");
                let detail = if tail.is_empty() {
                    format!("process exited with {}", status)
                } else {
                    format!("process exited with {}: {}", status, tail)
                };
                warn!(log = %spec.log_path.display(), "Inference server exited during startup");
                Err(DeployError::ServerStartFailed {
                    log_path: spec.log_path.clone(),
                    detail,
                })
            }
            Ok(None) => {
                let pid = child.id();
                info!(pid = ?pid, "Inference server is up");
                Ok(ServerProcess {
                    pid,
                    child: Mutex::new(Some(child)),
                    log_path: spec.log_path.clone(),
                    started_at: Utc::now(),
                })
            }
            Err(e) => Err(start_failed(spec, e)),
        }
    }
}

fn start_failed(spec: &LaunchSpec, e: std::io::Error) -> DeployError {
    DeployError::ServerStartFailed {
        log_path: spec.log_path.clone(),
        detail: e.to_string(),
    }
}

/// 运行中的推理服务进程
#[derive(Debug)]
pub struct ServerProcess {
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    log_path: PathBuf,
    started_at: DateTime<Utc>,
}

impl ServerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// 子进程是否仍在运行；已退出时回收句柄
    pub async fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = ?self.pid, %status, "Inference server exited");
                *guard = None;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "Failed to query inference server status");
                true
            }
        }
    }

    /// 停止子进程（幂等）
    ///
    /// 先发送 SIGTERM，超过宽限期仍未退出则强制 kill
    pub async fn stop(&self, grace: Duration) {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return;
        };

        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        terminate(&mut child);

        tokio::select! {
            status = child.wait() => {
                info!(pid = ?self.pid, status = ?status.ok(), "Inference server stopped");
            }
            _ = tokio::time::sleep(grace) => {
                warn!(pid = ?self.pid, "Inference server did not exit in {:?}, killing", grace);
                if let Err(e) = child.kill().await {
                    warn!(pid = ?self.pid, error = %e, "Failed to kill inference server");
                }
            }
        }
    }

    /// 日志文件最后 n 行
    pub fn tail_log(&self, n: usize) -> Vec<String> {
        read_tail(&self.log_path, n)
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = %e, "SIGTERM failed");
                let _ = child.start_kill();
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// 读取文件最后 n 行，文件不存在时返回空
///
/// 非 UTF-8 字节替换为 U+FFFD
pub fn read_tail(path: &Path, n: usize) -> Vec<String> {
    let Ok(bytes) = std::fs::read(path) else {
        return Vec::new();
    };
    let content = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn spec(dir: &Path, program: String) -> LaunchSpec {
        LaunchSpec {
            program,
            args: vec![],
            work_dir: dir.to_path_buf(),
            log_path: dir.join("logs").join("server.log"),
            envs: HashMap::from([("MODEL_DEVICE".to_string(), "cpu".to_string())]),
        }
    }

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(Duration::from_millis(300), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_start_and_stop_long_running() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "serve.sh", "echo \"device=$MODEL_DEVICE\"\nexec sleep 30");

        let process = supervisor().start(&spec(dir.path(), program)).await.unwrap();
        assert!(process.pid().is_some());
        assert!(process.is_alive().await);
        assert_eq!(process.tail_log(5), vec!["device=cpu".to_string()]);

        process.stop(Duration::from_secs(2)).await;
        assert!(!process.is_alive().await);
        // 再次停止无副作用
        process.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_immediate_exit_is_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(dir.path(), "crash.sh", "echo 'ImportError: no module' >&2\nexit 1");

        let err = supervisor()
            .start(&spec(dir.path(), program))
            .await
            .unwrap_err();
        match err {
            DeployError::ServerStartFailed { log_path, detail } => {
                assert!(log_path.ends_with("server.log"));
                assert!(detail.contains("ImportError"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let err = supervisor()
            .start(&spec(dir.path(), "/nonexistent/python3".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "server_start_failed");
    }

    #[test]
    fn test_read_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.log");
        std::fs::write(&path, "1\n2\n3\n4\n").unwrap();
        assert_eq!(read_tail(&path, 2), vec!["3", "4"]);
        assert_eq!(read_tail(&path, 10).len(), 4);
        assert!(read_tail(&dir.path().join("missing.log"), 5).is_empty());

        let binary = dir.path().join("binary.log");
        std::fs::write(&binary, b"loading\n\xff\xfe weights\nTraceback: boom\n").unwrap();
        let lines = read_tail(&binary, 2);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" weights"));
        assert_eq!(lines[1], "Traceback: boom");
    }
}
