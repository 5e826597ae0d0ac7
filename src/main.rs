use clap::Parser;
use std::process::ExitCode;
use stream_worker::config::{AppConfig, Args};
use stream_worker::render::ChromiumBackend;
use stream_worker::supervisor::{self, Orchestrator};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 解析配置，启动编排器并在关闭流程结束后退出
///
/// 只有配置错误以非零状态码退出；启动失败、信号、到期都以 0 退出，
/// 具体原因通过上报的状态区分。
#[tokio::main]
async fn main() -> ExitCode {
    // 初始化日志系统，默认 info 级别
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 解析命令行参数与环境变量
    let args = Args::parse();

    // 缺少密钥时在占用任何资源之前退出
    let config = match AppConfig::resolve(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("ERROR: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let backend = ChromiumBackend::new(config.browser_executable.clone());
    let mut orchestrator = Orchestrator::new(config, Box::new(backend));

    // 信号与到期走同一条关闭路径
    if let Err(e) = supervisor::forward_signals(orchestrator.trigger_sender()) {
        error!("Failed to install signal handlers: {}", e);
    }

    let state = orchestrator.run().await;
    info!("Worker finished ({})", state);
    ExitCode::SUCCESS
}
