//! Model Deploy Agent - 模型部署控制面
//!
//! Usage:
//! - Normal mode: `model-deploy-agent`
//! - With custom port: `model-deploy-agent --port 9000`
//!
//! 其余配置通过环境变量设置（BACKEND_HOST, API_PREFIX, MODEL_STORAGE_PATH ...）

use model_deploy_agent::RuntimeConfig;

/// 解析命令行参数
fn parse_args() -> RuntimeConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = RuntimeConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                config.port_override = args[i + 1].parse().ok();
                if config.port_override.is_none() {
                    eprintln!("Ignoring invalid port: {}", args[i + 1]);
                }
                i += 2;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("model-deploy-agent {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    config
}

fn print_help() {
    println!("Model Deploy Agent - 模型部署控制面");
    println!();
    println!("USAGE:");
    println!("    model-deploy-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>    Override the listening port (BACKEND_PORT)");
    println!("    -V, --version    Print version");
    println!("    -h, --help       Print help information");
    println!();
    println!("ENVIRONMENT:");
    println!("    BACKEND_HOST, BACKEND_PORT, API_PREFIX, CORS_ORIGINS");
    println!("    MODEL_STORAGE_PATH, LOGS_PATH, HUGGINGFACE_CACHE_DIR, HUGGINGFACE_TOKEN");
    println!("    MODEL_SERVE_PORT_START, MODEL_SERVE_PORT_END, PYTHON_PATH");
    println!("    API_KEY_ENABLED, API_KEY, ENABLE_METRICS, LOG_FORMAT, RUST_LOG");
}

fn main() {
    let config = parse_args();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(model_deploy_agent::init_and_run_with_config(config)) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
