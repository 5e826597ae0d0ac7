use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// 配置错误：在任何资源被占用之前直接终止进程
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("YOUTUBE_STREAM_KEY is required (set it via --stream-key or the environment)")]
    MissingStreamKey,

    #[error("unknown quality profile '{0}' (expected 720p or 1080p)")]
    InvalidProfile(String),

    #[error("failed to read config file {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path:?}: {source}")]
    ParseFile {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// 启动阶段的资源获取错误
///
/// 这些错误会中止后续启动步骤，并走完整的关闭流程释放已占用的资源。
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("content server failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("renderer failed to launch: {0:#}")]
    RenderLaunch(anyhow::Error),

    #[error("navigation to {url} did not complete within {timeout:?}")]
    NavigationTimeout { url: String, timeout: Duration },

    #[error("navigation to {url} failed: {source:#}")]
    Navigation { url: String, source: anyhow::Error },
}
