//! 部署流水线
//!
//! validating → downloading → loading → creating_pipeline → starting_server → completed
//!
//! 每个阶段开始时更新进度检查点，任一阶段出错立即返回，由调用方记录失败。

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::EnvConfig;
use crate::domain::{DeployPhase, DeployRequest, LifecycleEvent, ModelKind};
use crate::error::DeployError;
use crate::infra::LaunchSpec;
use crate::services::inference::{BoundPipeline, InferencePipeline};

use super::context::DeployContext;
use super::dependencies::prepare_interpreter;
use super::model;
use super::server_script::ServerScript;

const DEVICES: &[&str] = &["auto", "cpu", "cuda", "mps"];

/// 校验通过的部署参数
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedDeploy {
    pub model_id: String,
    pub kind: ModelKind,
    pub packages: Vec<String>,
}

/// 部署 ID 只允许 `[A-Za-z0-9_.-]`
pub fn validate_deployment_id(id: &str) -> Result<(), DeployError> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DeployError::ConfigurationInvalid(format!(
            "Invalid deployment name '{}': use letters, digits, '_', '.' or '-'",
            id
        )))
    }
}

/// 模型 ID 形如 `name` 或 `org/name`
fn validate_model_id(model_id: &str) -> Result<(), DeployError> {
    let segment_ok = |s: &str| {
        !s.is_empty()
            && !s.starts_with('.')
            && !s.contains("..")
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    };
    let parts: Vec<&str> = model_id.split('/').collect();
    if model_id.len() <= 96 && parts.len() <= 2 && parts.iter().all(|p| segment_ok(p)) {
        Ok(())
    } else {
        Err(DeployError::ConfigurationInvalid(format!(
            "Invalid model reference '{}': expected 'name' or 'organization/name'",
            model_id
        )))
    }
}

/// 校验部署请求
pub fn validate(request: &DeployRequest, config: &EnvConfig) -> Result<ValidatedDeploy, DeployError> {
    let model_id = request.model_reference().ok_or_else(|| {
        DeployError::ConfigurationInvalid("Model reference (model_id) is required".to_string())
    })?;
    validate_model_id(model_id)?;

    let source = request.model_source();
    if !source.eq_ignore_ascii_case("huggingface") {
        return Err(DeployError::ConfigurationInvalid(format!(
            "Unsupported model source '{}'",
            source
        )));
    }

    let hardware = &request.hardware;
    let device = hardware.device.to_ascii_lowercase();
    if !DEVICES.contains(&device.as_str()) {
        return Err(DeployError::ConfigurationInvalid(format!(
            "Unsupported device '{}': expected one of {}",
            hardware.device,
            DEVICES.join(", ")
        )));
    }
    if let Some(gpu_memory) = hardware.gpu_memory {
        let max = config.limits.max_memory_per_model_gb;
        if gpu_memory == 0 || gpu_memory > max {
            return Err(DeployError::ConfigurationInvalid(format!(
                "gpu_memory must be between 1 and {} GB",
                max
            )));
        }
    }
    if hardware.cpu_threads == Some(0) {
        return Err(DeployError::ConfigurationInvalid(
            "cpu_threads must be at least 1".to_string(),
        ));
    }

    let mut packages = Vec::new();
    for spec in request.dependencies.packages() {
        let spec = spec.trim();
        if spec.is_empty() || spec.starts_with('-') {
            return Err(DeployError::ConfigurationInvalid(format!(
                "Invalid dependency specification '{}'",
                spec
            )));
        }
        packages.push(spec.to_string());
    }

    Ok(ValidatedDeploy {
        model_id: model_id.to_string(),
        kind: request.kind(),
        packages,
    })
}

/// 推理服务子进程的环境变量
fn hardware_env(request: &DeployRequest, config: &EnvConfig) -> HashMap<String, String> {
    let mut envs = HashMap::new();
    envs.insert(
        "MODEL_DEVICE".to_string(),
        request.hardware.device.to_ascii_lowercase(),
    );
    if let Some(threads) = request.hardware.cpu_threads {
        envs.insert("OMP_NUM_THREADS".to_string(), threads.to_string());
    }
    if let Some(gpu_memory) = request.hardware.gpu_memory {
        envs.insert("MODEL_GPU_MEMORY_GB".to_string(), gpu_memory.to_string());
    }
    envs.insert(
        "HF_HUB_CACHE".to_string(),
        config.storage.hf_cache_dir.to_string_lossy().to_string(),
    );
    envs.insert("HF_HUB_OFFLINE".to_string(), "1".to_string());
    envs.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    envs
}

/// 执行完整流水线，返回推理端点 URL
pub async fn run(ctx: &DeployContext, request: &DeployRequest) -> Result<String, DeployError> {
    let state = &ctx.state;
    let config = &state.config;
    let id = ctx.deployment_id.as_str();

    // 1. 校验
    ctx.enter(DeployPhase::Validating, "Validating deployment configuration...");
    let validated = validate(request, config)?;

    // 2. 下载
    ctx.enter(
        DeployPhase::Downloading,
        format!("Downloading model '{}' from HuggingFace Hub...", validated.model_id),
    );
    let download = config.timeouts.download;
    let artifact = tokio::time::timeout(
        download,
        state.artifacts.acquire(&validated.model_id, validated.kind),
    )
    .await
    .map_err(|_| {
        DeployError::ArtifactUnavailable(format!(
            "Model download timed out after {} seconds. The model '{}' may be too large or the connection is slow.",
            download.as_secs(),
            validated.model_id
        ))
    })??;
    ctx.checkpoint(55, "Model downloaded successfully!");

    // 3. 加载
    ctx.enter(DeployPhase::Loading, "Loading model into memory...");
    let loaded = model::load(
        artifact,
        config.limits.max_model_size_bytes(),
        config.timeouts.load,
    )
    .await?;

    // 4. 推理适配器
    ctx.enter(DeployPhase::CreatingPipeline, "Creating inference pipeline...");
    let pipeline = InferencePipeline::build(validated.kind, &loaded);

    // 5. 启动推理服务
    ctx.enter(DeployPhase::StartingServer, "Starting inference server...");
    let port = state.registry.assign_port(id).await?;
    let deploy_dir = config.storage.model_storage_path.join(id);
    let log_path = config.storage.logs_path.join(format!("{}.log", id));

    let script_path = ServerScript {
        deployment_id: id,
        model_id: &validated.model_id,
        model_path: &loaded.dir,
        task: pipeline.task(),
        port,
        workers: config.serving.workers,
    }
    .write_to(&deploy_dir)?;

    if !validated.packages.is_empty() {
        ctx.checkpoint(
            DeployPhase::StartingServer.percent(),
            format!("Installing {} dependencies...", validated.packages.len()),
        );
    }
    let python = prepare_interpreter(
        &config.serving.python_path,
        &deploy_dir,
        &validated.packages,
        &log_path,
        config.timeouts.dependency_install,
    )
    .await?;

    let spec = LaunchSpec {
        program: python,
        args: vec![script_path.to_string_lossy().to_string()],
        work_dir: deploy_dir,
        log_path,
        envs: hardware_env(request, config),
    };
    let process = Arc::new(state.supervisor.start(&spec).await?);
    let bound = Arc::new(BoundPipeline::new(pipeline, port, state.http.clone()));

    if let Err(e) = state
        .registry
        .mark_running(id, process.clone(), bound)
        .await
    {
        // 流水线执行期间部署已被删除或停止，端口已随记录释放
        warn!(deployment_id = %id, "Deployment no longer pending, stopping server");
        process.stop(state.supervisor.stop_grace()).await;
        return Err(e);
    }
    ctx.lifecycle(LifecycleEvent::DeploymentStarted {
        deployment_id: id.to_string(),
        port,
    });

    // 6. 完成
    let endpoint = config.inference_url(id);
    ctx.enter(
        DeployPhase::Completed,
        format!("Model deployed successfully! Available at {}", endpoint),
    );
    info!(
        deployment_id = %id,
        model_id = %validated.model_id,
        port,
        pid = ?process.pid(),
        "Deployment completed"
    );
    Ok(endpoint)
}
