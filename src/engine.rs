use crate::config::{IngestTarget, QualityProfile, StreamKey};
use anyhow::Context;
use futures::StreamExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{error, info, warn};

/// 采集的虚拟显示器
pub const DISPLAY: &str = ":99";
/// PulseAudio 默认音频输出
pub const AUDIO_SOURCE: &str = "default";

/// 可用内存低于该值 (KB) 时告警
const LOW_MEMORY_KB: u64 = 256 * 1024;
const MAX_LINE: usize = 64 * 1024;

/// 编码子进程通过消息通道投递给编排器的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// 一行输出，已去除密钥
    Output { stream: &'static str, line: String },
    /// 进程结束，`None` 表示被信号终止
    Exited { code: Option<i32>, status: String },
}

/// 构造固定的 ffmpeg 参数：虚拟显示器 + PulseAudio 采集，x264/AAC 编码，FLV 推流
pub fn capture_args(profile: &QualityProfile, ingest_url: &str) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(48);
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    // 输入：X11 屏幕采集
    push(&["-f", "x11grab"]);
    push(&["-video_size", profile.video_size().as_str()]);
    push(&["-framerate", profile.frame_rate.to_string().as_str()]);
    push(&["-i", DISPLAY]);

    // 输入：PulseAudio
    push(&["-f", "pulse", "-i", AUDIO_SOURCE]);

    // 视频编码：低延迟、限制码率
    push(&["-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency"]);
    push(&["-b:v", format!("{}k", profile.video_bitrate_k).as_str()]);
    push(&["-maxrate", format!("{}k", profile.max_bitrate_k).as_str()]);
    push(&["-bufsize", format!("{}k", profile.buffer_size_k).as_str()]);
    push(&["-pix_fmt", "yuv420p"]);
    push(&["-g", profile.gop.to_string().as_str()]);
    push(&["-threads", "2"]);

    // 音频编码
    push(&["-c:a", "aac", "-b:a", "128k", "-ar", "44100", "-ac", "2"]);

    // 输出
    push(&["-f", "flv", ingest_url]);
    args
}

/// 只保留进度和错误相关的 stderr 行
pub fn is_notable(line: &str) -> bool {
    line.contains("frame=") || line.to_ascii_lowercase().contains("error")
}

/// 记录当前内存和负载，内存不足只告警
pub fn log_resources() {
    match sys_info::mem_info() {
        Ok(mem) if mem.avail < LOW_MEMORY_KB => warn!(
            "Low system memory: {} MB available of {} MB",
            mem.avail / 1024,
            mem.total / 1024
        ),
        Ok(mem) => info!(
            "System memory: {} MB available of {} MB",
            mem.avail / 1024,
            mem.total / 1024
        ),
        Err(e) => warn!("Failed to check memory usage: {}", e),
    }
    if let Ok(load) = sys_info::loadavg() {
        info!("Load average: {:.2} {:.2} {:.2}", load.one, load.five, load.fifteen);
    }
}

/// 编码子进程句柄
///
/// 子进程本身由后台监视任务持有，句柄只保存 pid 与退出状态。
pub struct CaptureProcess {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    terminated: bool,
}

impl CaptureProcess {
    /// 启动编码子进程
    ///
    /// # 副作用
    /// - 启动长期运行的子进程
    /// - 启动输出读取与退出监视任务，事件写入 `events`
    ///
    /// # 错误处理
    /// - 启动失败时返回错误，错误信息中不包含推流地址
    pub fn spawn(
        binary: &str,
        profile: &QualityProfile,
        ingest: &IngestTarget,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> anyhow::Result<Self> {
        info!(
            "Starting FFmpeg stream to {} ({} {}fps, {}k)",
            ingest, profile.name, profile.frame_rate, profile.video_bitrate_k
        );

        let mut cmd = Command::new(binary);
        cmd.args(capture_args(profile, &ingest.url()));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", binary))?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(
                stdout,
                "stdout",
                ingest.key().clone(),
                false,
                events.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(
                stderr,
                "stderr",
                ingest.key().clone(),
                true,
                events.clone(),
            ));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let _ = exit_tx.send(Some(status));
                    let _ = events.send(CaptureEvent::Exited {
                        code: status.code(),
                        status: status.to_string(),
                    });
                }
                Err(e) => error!("FFmpeg monitor error: {}", e),
            }
        });

        info!("FFmpeg streaming started (pid {:?})", pid);
        Ok(Self {
            pid,
            exit_rx,
            terminated: false,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// 发送 SIGTERM 请求优雅退出，最多等待 `grace`，不强制 kill
    pub async fn terminate(&mut self, grace: Duration) -> anyhow::Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        if self.has_exited() {
            info!("FFmpeg already exited, nothing to terminate");
            return Ok(());
        }

        let pid = self.pid.context("FFmpeg pid unavailable")?;
        send_terminate(pid)?;

        let mut exit_rx = self.exit_rx.clone();
        let exited = tokio::time::timeout(grace, exit_rx.wait_for(|s| s.is_some()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

        if exited {
            info!("FFmpeg stopped after SIGTERM");
        } else {
            warn!("FFmpeg (pid {}) still running {:?} after SIGTERM", pid, grace);
        }
        Ok(())
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(pid).context("pid out of range")?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).context("failed to send SIGTERM")?;
    Ok(())
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> anyhow::Result<()> {
    anyhow::bail!("graceful termination is only supported on unix")
}

// ffmpeg 的进度行以 \r 结尾，按 \r 与 \n 同时切分
async fn pump_output<R>(
    reader: R,
    stream: &'static str,
    key: StreamKey,
    filter: bool,
    events: mpsc::UnboundedSender<CaptureEvent>,
) where
    R: AsyncRead + Unpin,
{
    let codec = AnyDelimiterCodec::new_with_max_length(b"\r\n".to_vec(), Vec::new(), MAX_LINE);
    let mut frames = FramedRead::new(reader, codec);

    while let Some(frame) = frames.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(AnyDelimiterCodecError::Io(e)) => {
                warn!("FFmpeg {} read error: {}", stream, e);
                break;
            }
            Err(e) => {
                warn!("FFmpeg {} output skipped: {}", stream, e);
                continue;
            }
        };
        let raw = String::from_utf8_lossy(&bytes);
        let line = raw.trim();
        if line.is_empty() || (filter && !is_notable(line)) {
            continue;
        }
        let event = CaptureEvent::Output {
            stream,
            line: key.redact(line),
        };
        if events.send(event).is_err() {
            break;
        }
    }
}
