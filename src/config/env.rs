//! 环境变量配置加载

use std::env;
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::infra::port_allocator::PortProbe;

/// 环境配置
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// 监听地址
    pub host: String,
    /// 服务监听端口
    pub port: u16,
    /// 返回给客户端的 URL 中使用的主机名
    pub public_host: String,
    /// 部署相关路由前缀
    pub api_prefix: String,
    /// CORS 允许的来源（包含 "*" 时放开全部）
    pub cors_origins: Vec<String>,
    /// 存储与目录配置
    pub storage: StorageConfig,
    /// 各阶段超时配置
    pub timeouts: TimeoutConfig,
    /// 推理服务子进程配置
    pub serving: ServingConfig,
    /// 资源上限
    pub limits: LimitConfig,
    /// WebSocket 心跳间隔
    pub heartbeat_interval: Duration,
    /// API Key（设置后启用 x-api-key 校验）
    pub api_key: Option<String>,
    /// 是否暴露 /metrics
    pub enable_metrics: bool,
}

/// 目录配置
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// 每个部署的工作目录根路径
    pub model_storage_path: PathBuf,
    /// 子进程日志目录
    pub logs_path: PathBuf,
    /// HuggingFace 缓存目录
    pub hf_cache_dir: PathBuf,
    /// HuggingFace token
    pub hf_token: Option<String>,
}

/// 超时配置
#[derive(Clone, Debug)]
pub struct TimeoutConfig {
    pub download: Duration,
    pub load: Duration,
    pub inference: Duration,
    pub dependency_install: Duration,
}

/// 推理服务子进程配置
#[derive(Clone, Debug)]
pub struct ServingConfig {
    /// 子进程端口范围（左闭右开）
    pub port_range: Range<u16>,
    /// 端口探测方式
    pub port_probe: PortProbe,
    /// Python 解释器
    pub python_path: String,
    /// 生成服务的 worker 数
    pub workers: u32,
    /// 启动后存活检查前的等待时间
    pub startup_grace: Duration,
    /// 优雅停止窗口
    pub stop_grace: Duration,
}

/// 资源上限
#[derive(Clone, Debug)]
pub struct LimitConfig {
    pub max_model_size_gb: u64,
    pub max_memory_per_model_gb: u64,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Self {
        let host = env::var("BACKEND_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_or("BACKEND_PORT", 8000);
        let public_host = env::var("PUBLIC_HOST").unwrap_or_else(|_| "localhost".to_string());
        let api_prefix = normalize_prefix(
            &env::var("API_PREFIX").unwrap_or_else(|_| "/api/v1".to_string()),
        );

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api_key_enabled = parse_bool("API_KEY_ENABLED", false);
        let api_key = env::var("API_KEY").ok().filter(|s| !s.is_empty());
        let api_key = match (api_key_enabled, api_key) {
            (true, Some(key)) => Some(key),
            (true, None) => {
                warn!("API_KEY_ENABLED=true but API_KEY is empty, API key check disabled");
                None
            }
            (false, _) => None,
        };

        Self {
            host,
            port,
            public_host,
            api_prefix,
            cors_origins,
            storage: StorageConfig::from_env(),
            timeouts: TimeoutConfig::from_env(),
            serving: ServingConfig::from_env(),
            limits: LimitConfig::from_env(),
            heartbeat_interval: Duration::from_secs(parse_or("WS_HEARTBEAT_INTERVAL", 30)),
            api_key,
            enable_metrics: parse_bool("ENABLE_METRICS", true),
        }
    }

    /// 控制面对外的 HTTP 基础地址
    pub fn public_base_url(&self) -> String {
        format!("http://{}:{}", self.public_host, self.port)
    }

    /// 指定部署的 WebSocket 地址
    pub fn websocket_url(&self, deployment_id: &str) -> String {
        format!(
            "ws://{}:{}{}/ws/{}",
            self.public_host, self.port, self.api_prefix, deployment_id
        )
    }

    /// 指定部署的推理 API 地址
    pub fn inference_url(&self, deployment_id: &str) -> String {
        format!(
            "{}{}/deployments/{}/inference",
            self.public_base_url(),
            self.api_prefix,
            deployment_id
        )
    }

    /// 创建所需目录
    pub fn create_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.storage.model_storage_path)?;
        std::fs::create_dir_all(&self.storage.logs_path)?;
        std::fs::create_dir_all(&self.storage.hf_cache_dir)?;
        Ok(())
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            model_storage_path: path_or("MODEL_STORAGE_PATH", "./deployed_models"),
            logs_path: path_or("LOGS_PATH", "./logs"),
            hf_cache_dir: path_or("HUGGINGFACE_CACHE_DIR", "./huggingface_cache"),
            hf_token: env::var("HUGGINGFACE_TOKEN").ok().filter(|s| !s.is_empty()),
        }
    }
}

impl TimeoutConfig {
    pub fn from_env() -> Self {
        Self {
            download: Duration::from_secs(parse_or("MAX_DOWNLOAD_TIMEOUT", 1800)),
            load: Duration::from_secs(parse_or("MODEL_LOAD_TIMEOUT", 600)),
            inference: Duration::from_secs(parse_or("MODEL_INFERENCE_TIMEOUT", 120)),
            dependency_install: Duration::from_secs(parse_or("DEPENDENCY_INSTALL_TIMEOUT", 900)),
        }
    }
}

impl ServingConfig {
    pub fn from_env() -> Self {
        let start: u16 = parse_or("MODEL_SERVE_PORT_START", 8100);
        let end: u16 = parse_or("MODEL_SERVE_PORT_END", 8200);
        let port_range = if start < end {
            start..end
        } else {
            warn!(start, end, "Invalid model serve port range, using 8100-8200");
            8100..8200
        };

        Self {
            port_range,
            port_probe: parse_or("PORT_PROBE", PortProbe::Bind),
            python_path: env::var("PYTHON_PATH").unwrap_or_else(|_| "python3".to_string()),
            workers: parse_or("MAX_WORKERS", 1u32).max(1),
            startup_grace: Duration::from_millis(parse_or("SERVER_STARTUP_GRACE_MS", 2000)),
            stop_grace: Duration::from_secs(parse_or("SERVER_STOP_GRACE_SECS", 5)),
        }
    }
}

impl LimitConfig {
    pub fn from_env() -> Self {
        Self {
            max_model_size_gb: parse_or("MAX_MODEL_SIZE_GB", 10),
            max_memory_per_model_gb: parse_or("MAX_MEMORY_PER_MODEL_GB", 8),
        }
    }

    pub fn max_model_size_bytes(&self) -> u64 {
        self.max_model_size_gb.saturating_mul(1024 * 1024 * 1024)
    }
}

/// LOG_FORMAT=json 时输出 JSON 日志
///
/// 在初始化 tracing 之前读取，因此独立于 `EnvConfig::from_env`
pub fn log_json_from_env() -> bool {
    env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// 解析环境变量，失败时使用默认值
fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %v, "Unparseable environment value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn path_or(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env::var(key).unwrap_or_else(|_| default.to_string()))
}

/// 规范化路由前缀："api/v1/" -> "/api/v1"，"/" -> ""
fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// 常量
pub mod constants {
    /// 部署流水线阶段总数
    pub const TOTAL_PHASES: u32 = 6;

    /// 进度事件广播通道容量
    pub const EVENT_CHANNEL_CAPACITY: usize = 256;

    /// 单个 WebSocket 订阅者的发送队列容量
    pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

    /// 日志尾部默认行数
    pub const DEFAULT_LOG_TAIL: usize = 200;

    /// 日志尾部最大行数
    pub const MAX_LOG_TAIL: usize = 5000;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
