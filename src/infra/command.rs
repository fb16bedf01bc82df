//! 命令执行器
//!
//! 用于部署期间的一次性命令（创建 venv、pip 安装依赖），支持超时控制。

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error};

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn command: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// 非零退出，附带 stderr 末尾
    #[error("Command exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}

impl CommandRunner {
    /// 执行简单命令（无流式输出）
    pub async fn run_simple(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<Output, CommandError> {
        debug!(program, ?args, "Running command");

        let child = Command::new(program)
            .args(args)
            .current_dir(work_dir)
            .kill_on_drop(true)
            .output();

        tokio::select! {
            result = child => {
                result.map_err(CommandError::SpawnFailed)
            }
            _ = tokio::time::sleep(timeout) => {
                error!(program, "Command timed out after {:?}", timeout);
                Err(CommandError::Timeout(timeout))
            }
        }
    }

    /// 执行命令，非零退出视为错误
    pub async fn run_checked(
        program: &str,
        args: &[&str],
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<Output, CommandError> {
        let output = Self::run_simple(program, args, work_dir, timeout).await?;
        if output.status.success() {
            return Ok(output);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(10)..].join("\n");
        Err(CommandError::Failed {
            code: output.status.code(),
            stderr: tail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checked_command_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let output = CommandRunner::run_checked(
            "sh",
            &["-c", "pwd; echo installed"],
            dir.path(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("installed"));
        assert!(stdout.contains(&*dir.path().file_name().unwrap().to_string_lossy()));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_spawn_error() {
        let result = CommandRunner::run_simple(
            "python-that-does-not-exist",
            &["-m", "venv", "venv"],
            Path::new("/tmp"),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(CommandError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_slow_install_times_out() {
        let started = std::time::Instant::now();
        let result = CommandRunner::run_checked(
            "sleep",
            &["10"],
            Path::new("/tmp"),
            Duration::from_millis(150),
        )
        .await;
        assert!(matches!(result, Err(CommandError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_failed_install_keeps_stderr_tail() {
        let script = "for i in $(seq 1 15); do echo \"line $i\" >&2; done; exit 3";
        let result = CommandRunner::run_checked(
            "sh",
            &["-c", script],
            Path::new("/tmp"),
            Duration::from_secs(5),
        )
        .await;

        match result {
            Err(CommandError::Failed { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr.lines().count(), 10);
                assert!(stderr.starts_with("line 6"));
                assert!(stderr.ends_with("line 15"));
            }
            other => panic!("unexpected: {:?}", other.map(|o| o.status)),
        }
    }
}
