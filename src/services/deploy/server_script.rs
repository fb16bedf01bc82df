//! 推理服务脚本生成

use std::path::{Path, PathBuf};

use crate::error::DeployError;

const TEMPLATE: &str = include_str!("model_server.py");

/// 生成的脚本文件名
pub const SCRIPT_NAME: &str = "model_server.py";

/// 脚本参数
pub struct ServerScript<'a> {
    pub deployment_id: &'a str,
    pub model_id: &'a str,
    pub model_path: &'a Path,
    pub task: &'a str,
    pub port: u16,
    pub workers: u32,
}

impl ServerScript<'_> {
    /// 渲染模板
    pub fn render(&self) -> String {
        TEMPLATE
            .replace("{{DEPLOYMENT_ID}}", &py_escape(self.deployment_id))
            .replace("{{MODEL_ID}}", &py_escape(self.model_id))
            .replace(
                "{{MODEL_PATH}}",
                &py_escape(&self.model_path.to_string_lossy()),
            )
            .replace("{{TASK}}", &py_escape(self.task))
            .replace("{{PORT}}", &self.port.to_string())
            .replace("{{WORKERS}}", &self.workers.max(1).to_string())
    }

    /// 写入 `<dir>/model_server.py`，返回脚本路径
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, DeployError> {
        std::fs::create_dir_all(dir).map_err(|e| {
            DeployError::PipelineInternal(format!(
                "Failed to create {}: {}",
                dir.display(),
                e
            ))
        })?;
        let path = dir.join(SCRIPT_NAME);
        std::fs::write(&path, self.render()).map_err(|e| {
            DeployError::PipelineInternal(format!(
                "Failed to write {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(path)
    }
}

/// 转义为 Python 双引号字符串的内容
///
/// JSON 字符串转义序列是 Python 字符串转义的子集
fn py_escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(model_path: &Path) -> ServerScript<'_> {
        ServerScript {
            deployment_id: "d1",
            model_id: "demo/model",
            model_path,
            task: "text-generation",
            port: 8101,
            workers: 0,
        }
    }

    #[test]
    fn test_render_replaces_all_placeholders() {
        let path = PathBuf::from("/cache/models--demo--model/snapshots/abc");
        let rendered = script(&path).render();
        assert!(!rendered.contains("{{"));
        assert!(rendered.contains(r#"MODEL_ID = "demo/model""#));
        assert!(rendered.contains(r#"TASK = "text-generation""#));
        assert!(rendered.contains("PORT = 8101"));
        assert!(rendered.contains("WORKERS = 1"));
        for endpoint in ["\"/\"", "\"/health\"", "\"/predict\"", "\"/model/info\"", "\"/model/reload\""] {
            assert!(rendered.contains(endpoint), "missing {}", endpoint);
        }
    }

    #[test]
    fn test_render_escapes_quotes() {
        let path = PathBuf::from("/tmp/we\"ird\\dir");
        let rendered = script(&path).render();
        assert!(rendered.contains(r#"MODEL_PATH = "/tmp/we\"ird\\dir""#));
    }

    #[test]
    fn test_write_to() {
        let dir = tempfile::tempdir().unwrap();
        let path = PathBuf::from("/models/x");
        let written = script(&path).write_to(&dir.path().join("d1")).unwrap();
        assert!(written.ends_with("d1/model_server.py"));
        let content = std::fs::read_to_string(written).unwrap();
        assert!(content.contains("DEPLOYMENT_ID = \"d1\""));
    }
}
