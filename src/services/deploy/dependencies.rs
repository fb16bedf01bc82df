//! 推理服务依赖安装
//!
//! 依赖列表非空时在部署目录下创建 venv 并 pip 安装，之后用 venv 中的解释器启动服务。

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::info;

use crate::error::DeployError;
use crate::infra::{CommandError, CommandRunner};

/// 准备解释器，返回用于启动推理服务的 python 路径
pub async fn prepare_interpreter(
    python: &str,
    deploy_dir: &Path,
    packages: &[String],
    log_path: &Path,
    timeout: Duration,
) -> Result<String, DeployError> {
    if packages.is_empty() {
        return Ok(python.to_string());
    }

    let fail = |stage: &str, e: CommandError| DeployError::ServerStartFailed {
        log_path: log_path.to_path_buf(),
        detail: format!("{} failed: {}", stage, e),
    };

    let deadline = Instant::now() + timeout;
    let venv_dir = deploy_dir.join("venv");
    let venv = venv_dir.to_string_lossy().to_string();

    info!(venv = %venv, "Creating virtual environment");
    CommandRunner::run_checked(
        python,
        &["-m", "venv", "--system-site-packages", venv.as_str()],
        deploy_dir,
        remaining(deadline),
    )
    .await
    .map_err(|e| fail("venv creation", e))?;

    let venv_python = venv_python(&venv_dir).to_string_lossy().to_string();

    info!(packages = ?packages, "Installing dependencies");
    let mut args = vec!["-m", "pip", "install", "--disable-pip-version-check"];
    args.extend(packages.iter().map(String::as_str));
    CommandRunner::run_checked(&venv_python, &args, deploy_dir, remaining(deadline))
        .await
        .map_err(|e| fail("dependency installation", e))?;

    Ok(venv_python)
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

#[cfg(unix)]
fn venv_python(venv_dir: &Path) -> PathBuf {
    venv_dir.join("bin").join("python")
}

#[cfg(not(unix))]
fn venv_python(venv_dir: &Path) -> PathBuf {
    venv_dir.join("Scripts").join("python.exe")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn test_no_packages_uses_base_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let python = prepare_interpreter(
            "python3",
            dir.path(),
            &[],
            &dir.path().join("d.log"),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(python, "python3");
    }

    #[tokio::test]
    async fn test_failed_install_is_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-python");
        std::fs::write(&fake, "#!/bin/sh\necho 'venv unavailable' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = prepare_interpreter(
            fake.to_str().unwrap(),
            dir.path(),
            &["requests".to_string()],
            &dir.path().join("d.log"),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        match err {
            DeployError::ServerStartFailed { detail, .. } => {
                assert!(detail.contains("venv creation"));
                assert!(detail.contains("venv unavailable"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
