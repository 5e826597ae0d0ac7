use crate::error::ConfigError;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// 本地内容服务器端口 (固定，不可配置)
pub const LOCAL_PORT: u16 = 8080;

const DEFAULT_INGEST_URL: &str = "rtmp://a.rtmp.youtube.com/live2";
const DEFAULT_OVERLAY_TITLE: &str = "YouTube Radio 24/7";
const DEFAULT_DURATION_HOURS: f64 = 5.5;
const DEFAULT_FFMPEG_BINARY: &str = "ffmpeg";

/// Stream Worker - 定时直播推流进程
///
/// 每个选项依次从命令行、环境变量、配置文件读取，最后回落到默认值。
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// YAML 配置文件路径 (可选)
    #[arg(short, long, env = "WORKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// 推流密钥 (必填，建议只通过环境变量传入)
    #[arg(long, env = "YOUTUBE_STREAM_KEY", hide_env_values = true)]
    pub stream_key: Option<String>,

    /// 推流服务器地址 (不含密钥)
    #[arg(long = "ingest-url", env = "STREAM_URL")]
    pub ingest_url: Option<String>,

    /// 播放列表地址，原样传递给渲染页面
    #[arg(long, env = "PLAYLIST_URL")]
    pub playlist_url: Option<String>,

    /// 叠加层标题
    #[arg(long = "title", env = "OVERLAY_TITLE")]
    pub overlay_title: Option<String>,

    /// 推流时长 (小时)，空值或非数字回落到默认值
    #[arg(long, env = "STREAM_DURATION_HOURS")]
    pub duration_hours: Option<String>,

    /// 状态上报服务地址
    #[arg(long, env = "BACKEND_API_URL")]
    pub status_endpoint: Option<String>,

    /// 画质档位 (720p / 1080p)
    #[arg(long, env = "STREAM_PROFILE")]
    pub profile: Option<String>,

    /// FFmpeg 可执行文件
    #[arg(long = "ffmpeg", env = "FFMPEG_BINARY")]
    pub ffmpeg_binary: Option<String>,

    /// Chrome/Chromium 可执行文件 (默认自动探测)
    #[arg(long = "browser", env = "CHROME_EXECUTABLE")]
    pub browser_executable: Option<PathBuf>,

    /// 自定义叠加层 HTML 文件 (默认使用内嵌页面)
    #[arg(long, env = "OVERLAY_FILE")]
    pub overlay_file: Option<PathBuf>,
}

/// 配置文件内容，所有字段可选
///
/// 推流密钥刻意不支持写入文件。
#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub ingest_url: Option<String>,
    pub playlist_url: Option<String>,
    pub overlay_title: Option<String>,
    pub duration_hours: Option<f64>,
    pub status_endpoint: Option<String>,
    pub profile: Option<ProfileName>,
    pub ffmpeg_binary: Option<String>,
    pub browser_executable: Option<PathBuf>,
    pub overlay_file: Option<PathBuf>,
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// 推流密钥
///
/// `Debug` / `Display` 均输出掩码，密钥只能通过 [`StreamKey::expose`] 取出。
#[derive(Clone, PartialEq, Eq)]
pub struct StreamKey(String);

impl StreamKey {
    pub const MASK: &'static str = "****";

    /// 空白字符串视为未设置
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// 将文本中出现的密钥替换为掩码
    pub fn redact(&self, text: &str) -> String {
        text.replace(&self.0, Self::MASK)
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamKey({})", Self::MASK)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::MASK)
    }
}

/// 推流目标：`<ingest_base_url>/<stream_key>`
#[derive(Clone)]
pub struct IngestTarget {
    base: String,
    key: StreamKey,
}

impl IngestTarget {
    pub fn new(base: &str, key: StreamKey) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            key,
        }
    }

    /// 完整地址，包含密钥，只能交给子进程
    pub fn url(&self) -> String {
        format!("{}/{}", self.base, self.key.expose())
    }

    pub fn redacted(&self) -> String {
        format!("{}/{}", self.base, StreamKey::MASK)
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }
}

impl fmt::Debug for IngestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Display for IngestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
pub enum ProfileName {
    #[default]
    #[serde(rename = "720p")]
    #[value(name = "720p")]
    Hd720,
    #[serde(rename = "1080p")]
    #[value(name = "1080p")]
    Hd1080,
}

/// 画质档位，同时作用于渲染窗口和采集编码参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// 目标码率 (kbps)
    pub video_bitrate_k: u32,
    /// 码率上限 (kbps)
    pub max_bitrate_k: u32,
    /// 码率控制缓冲 (kbit)
    pub buffer_size_k: u32,
    /// 关键帧间隔 (帧)
    pub gop: u32,
}

impl QualityProfile {
    pub const HD_720: QualityProfile = QualityProfile {
        name: "720p",
        width: 1280,
        height: 720,
        frame_rate: 24,
        video_bitrate_k: 2000,
        max_bitrate_k: 2500,
        buffer_size_k: 4000,
        gop: 48,
    };

    pub const HD_1080: QualityProfile = QualityProfile {
        name: "1080p",
        width: 1920,
        height: 1080,
        frame_rate: 24,
        video_bitrate_k: 4000,
        max_bitrate_k: 4500,
        buffer_size_k: 8000,
        gop: 48,
    };

    pub fn from_name(name: ProfileName) -> Self {
        match name {
            ProfileName::Hd720 => Self::HD_720,
            ProfileName::Hd1080 => Self::HD_1080,
        }
    }

    /// `1280x720` 形式，供 ffmpeg `-video_size` 使用
    pub fn video_size(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// 各阶段的固定时长，运维侧不可配置
#[derive(Debug, Clone, Copy)]
pub struct Timings {
    /// 页面导航超时
    pub navigation_timeout: Duration,
    /// 导航完成后等待页面动画稳定
    pub settle_delay: Duration,
    /// 渲染就绪后、启动编码前的额外等待
    pub warmup_delay: Duration,
    /// 监控循环的最长休眠间隔
    pub supervise_interval: Duration,
    /// 单次状态上报的请求超时
    pub status_timeout: Duration,
    /// 发送 SIGTERM 后等待编码进程退出的时长
    pub capture_grace: Duration,
    /// 等待浏览器关闭的时长
    pub browser_close: Duration,
    /// 内容服务器关闭时等待在途请求的时长
    pub server_drain: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_secs(2),
            warmup_delay: Duration::from_secs(3),
            supervise_interval: Duration::from_secs(5 * 60),
            status_timeout: Duration::from_secs(10),
            capture_grace: Duration::from_secs(10),
            browser_close: Duration::from_secs(10),
            server_drain: Duration::from_secs(5),
        }
    }
}

/// 启动时解析一次的只读配置快照
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub stream_key: StreamKey,
    pub ingest_base_url: String,
    pub playlist_url: Option<String>,
    pub overlay_title: String,
    pub duration_hours: f64,
    pub status_endpoint: Option<String>,
    pub local_port: u16,
    pub profile: QualityProfile,
    pub ffmpeg_binary: String,
    pub browser_executable: Option<PathBuf>,
    pub overlay_file: Option<PathBuf>,
    pub timings: Timings,
}

impl AppConfig {
    /// 合并命令行/环境变量与配置文件
    ///
    /// # 错误处理
    /// - 缺少推流密钥时立即返回，不读取配置文件
    /// - 配置文件不可读或格式错误时返回错误
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let stream_key = args
            .stream_key
            .clone()
            .and_then(StreamKey::new)
            .ok_or(ConfigError::MissingStreamKey)?;

        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let ingest_base_url = non_empty(args.ingest_url.clone())
            .or(non_empty(file.ingest_url))
            .unwrap_or_else(|| DEFAULT_INGEST_URL.to_string());
        let overlay_title = non_empty(args.overlay_title.clone())
            .or(non_empty(file.overlay_title))
            .unwrap_or_else(|| DEFAULT_OVERLAY_TITLE.to_string());
        let duration_hours = match non_empty(args.duration_hours.clone()) {
            Some(raw) => parse_duration(&raw),
            None => checked_duration(file.duration_hours),
        };
        let profile = match non_empty(args.profile.clone()) {
            Some(raw) => ProfileName::from_str(raw.trim(), true)
                .map_err(|_| ConfigError::InvalidProfile(raw))?,
            None => file.profile.unwrap_or_default(),
        };

        Ok(Self {
            stream_key,
            ingest_base_url,
            playlist_url: non_empty(args.playlist_url.clone()).or(non_empty(file.playlist_url)),
            overlay_title,
            duration_hours,
            status_endpoint: non_empty(args.status_endpoint.clone())
                .or(non_empty(file.status_endpoint)),
            local_port: LOCAL_PORT,
            profile: QualityProfile::from_name(profile),
            ffmpeg_binary: non_empty(args.ffmpeg_binary.clone())
                .or(non_empty(file.ffmpeg_binary))
                .unwrap_or_else(|| DEFAULT_FFMPEG_BINARY.to_string()),
            browser_executable: args.browser_executable.clone().or(file.browser_executable),
            overlay_file: args.overlay_file.clone().or(file.overlay_file),
            timings: Timings::default(),
        })
    }

    pub fn ingest_target(&self) -> IngestTarget {
        IngestTarget::new(&self.ingest_base_url, self.stream_key.clone())
    }

    /// 推流总时长
    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.duration_hours * 3600.0).unwrap_or(Duration::MAX)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_duration(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(hours) => checked_duration(Some(hours)),
        Err(_) => {
            warn!(
                "Invalid stream duration '{}', falling back to {} hours",
                raw, DEFAULT_DURATION_HOURS
            );
            DEFAULT_DURATION_HOURS
        }
    }
}

fn checked_duration(hours: Option<f64>) -> f64 {
    match hours {
        Some(h) if h.is_finite() && h > 0.0 => h,
        Some(h) => {
            warn!(
                "Invalid stream duration {} hours, falling back to {}",
                h, DEFAULT_DURATION_HOURS
            );
            DEFAULT_DURATION_HOURS
        }
        None => DEFAULT_DURATION_HOURS,
    }
}
