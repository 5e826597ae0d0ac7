use crate::config::AppConfig;
use crate::engine::{self, CaptureEvent, CaptureProcess};
use crate::error::StartupError;
use crate::render::{self, RenderBackend, RenderSession};
use crate::state::{LifecycleState, ShutdownCause};
use crate::status::{StatusReporter, StreamStatus};
use crate::web::{overlay::OverlayAsset, ContentServer};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Level};

/// 截止时间的上限，避免超长时长导致 Instant 溢出
const MAX_RUN: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// 推流截止时间，开播时计算一次
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    wall: Option<DateTime<Utc>>,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        let duration = duration.min(MAX_RUN);
        let wall = TimeDelta::from_std(duration)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        Self {
            at: Instant::now() + duration,
            wall,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_reached(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn wall_clock(&self) -> String {
        self.wall
            .map(|w| w.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// 启动被中止的原因
#[derive(Debug)]
enum Abort {
    Failed(StartupError),
    Signal(&'static str),
}

impl From<StartupError> for Abort {
    fn from(e: StartupError) -> Self {
        Abort::Failed(e)
    }
}

/// 生命周期编排器
///
/// 独占内容服务器、渲染实例和编码进程三个资源，按顺序启动，在截止时间或
/// 终止信号到来前保持运行，最后按固定顺序关闭。
///
/// # 任务流程：
/// - 启动内容服务器，等待端口绑定
/// - 启动渲染端并导航到叠加层页面 (有界超时 + 固定稳定等待)
/// - 启动编码进程 (失败不致命)
/// - 上报 `streaming`，计算截止时间
/// - 进入定时等待循环，直到截止时间或收到信号
/// - 依次停止编码进程、渲染端、内容服务器，上报最终状态
///
/// 监控循环不检查子进程健康状况，编码进程异常退出只记录日志，
/// 推流一直持续到截止时间或外部信号。
pub struct Orchestrator {
    config: Arc<AppConfig>,
    backend: Box<dyn RenderBackend>,
    reporter: StatusReporter,
    state: LifecycleState,

    server: Option<ContentServer>,
    render: Option<Box<dyn RenderSession>>,
    capture: Option<CaptureProcess>,

    events_tx: mpsc::UnboundedSender<CaptureEvent>,
    events_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    triggers_tx: mpsc::UnboundedSender<&'static str>,
    triggers_rx: mpsc::UnboundedReceiver<&'static str>,

    shut_down: bool,
}

impl Orchestrator {
    pub fn new(config: AppConfig, backend: Box<dyn RenderBackend>) -> Self {
        let reporter = StatusReporter::new(
            config.status_endpoint.as_deref(),
            config.timings.status_timeout,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (triggers_tx, triggers_rx) = mpsc::unbounded_channel();

        Self {
            config: Arc::new(config),
            backend,
            reporter,
            state: LifecycleState::Starting,
            server: None,
            render: None,
            capture: None,
            events_tx,
            events_rx,
            triggers_tx,
            triggers_rx,
            shut_down: false,
        }
    }

    /// 终止信号的投递入口，信号名称写入即触发关闭
    pub fn trigger_sender(&self) -> mpsc::UnboundedSender<&'static str> {
        self.triggers_tx.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// 完整运行一次：启动、监控、关闭
    ///
    /// 无论以何种方式结束，返回前关闭流程都已执行完毕。
    pub async fn run(&mut self) -> LifecycleState {
        self.banner();

        let cause = match self.start().await {
            Ok(deadline) => self.supervise(deadline).await,
            Err(Abort::Signal(name)) => {
                info!("Received {} during startup, aborting", name);
                ShutdownCause::Signal(name)
            }
            Err(Abort::Failed(e)) => {
                error!(component = "orchestrator", "Fatal error: {}", e);
                ShutdownCause::Fatal(e.to_string())
            }
        };

        self.shutdown(cause).await;
        self.state
    }

    fn banner(&self) {
        info!("═══════════════════════════════════════════");
        info!("  Stream Worker");
        info!("═══════════════════════════════════════════");
        info!("Streaming to: {}", self.config.ingest_base_url);
        info!("Duration: {} hours", self.config.duration_hours);
        info!("Overlay title: {}", self.config.overlay_title);
        info!(
            "Profile: {} ({}x{} @{}fps)",
            self.config.profile.name,
            self.config.profile.width,
            self.config.profile.height,
            self.config.profile.frame_rate
        );
        if !self.reporter.is_enabled() {
            info!("Status reporting disabled");
        }
    }

    async fn start(&mut self) -> Result<Deadline, Abort> {
        let timings = self.config.timings;

        // 1. 内容服务器
        let asset = OverlayAsset::from_override(self.config.overlay_file.clone());
        let server = ContentServer::start(self.config.local_port, asset).await?;
        let base = server.base_url();
        self.server = Some(server);
        self.check_signal()?;

        // 2. 渲染端
        let url = render::overlay_url(
            &base,
            &self.config.overlay_title,
            self.config.playlist_url.as_deref(),
        )?;
        let session = self
            .backend
            .launch(&self.config.profile)
            .await
            .map_err(StartupError::RenderLaunch)?;
        let session = self.render.insert(session);
        render::navigate(session.as_mut(), &url, timings.navigation_timeout).await?;
        tokio::time::sleep(timings.settle_delay).await;
        info!("Overlay loaded successfully");
        self.check_signal()?;

        tokio::time::sleep(timings.warmup_delay).await;
        self.check_signal()?;

        // 3. 编码进程，失败只记录
        engine::log_resources();
        match CaptureProcess::spawn(
            &self.config.ffmpeg_binary,
            &self.config.profile,
            &self.config.ingest_target(),
            self.events_tx.clone(),
        ) {
            Ok(process) => self.capture = Some(process),
            Err(e) => error!(
                component = "capture",
                "FFmpeg failed to start, keeping pipeline alive: {:#}", e
            ),
        }

        // 4. 上报
        self.transition(LifecycleState::Streaming);
        self.reporter.report(StreamStatus::Streaming).await;

        // 5. 截止时间
        let deadline = Deadline::after(self.config.duration());
        info!("Stream is LIVE!");
        info!("Will run until: {}", deadline.wall_clock());
        Ok(deadline)
    }

    fn check_signal(&mut self) -> Result<(), Abort> {
        match self.triggers_rx.try_recv() {
            Ok(name) => Err(Abort::Signal(name)),
            Err(_) => Ok(()),
        }
    }

    /// 定时等待循环，只关心截止时间和终止信号
    async fn supervise(&mut self, deadline: Deadline) -> ShutdownCause {
        let interval = self.config.timings.supervise_interval;

        loop {
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                info!("Duration reached, initiating graceful shutdown...");
                return ShutdownCause::Deadline;
            }

            info!(
                "{} minutes remaining...",
                (remaining.as_secs_f64() / 60.0).round()
            );
            engine::log_resources();

            let wake = (Instant::now() + interval).min(deadline.instant());
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => break,
                    Some(name) = self.triggers_rx.recv() => {
                        info!("Received {}, initiating graceful shutdown...", name);
                        return ShutdownCause::Signal(name);
                    }
                    Some(event) = self.events_rx.recv() => log_capture_event(&event, false),
                }
            }
        }
    }

    /// 关闭所有资源
    ///
    /// 只有第一次调用生效。每一步的失败都只记录日志，后续步骤照常执行。
    pub async fn shutdown(&mut self, cause: ShutdownCause) {
        if self.shut_down {
            debug!("Shutdown already performed, ignoring ({})", cause);
            return;
        }
        self.shut_down = true;

        info!("Shutting down ({})...", cause);
        if cause.is_fatal() && self.state != LifecycleState::Errored {
            self.transition(LifecycleState::Errored);
        }
        self.transition(LifecycleState::Stopping);
        let timings = self.config.timings;

        // 1. 编码进程
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.terminate(timings.capture_grace).await {
                error!(component = "capture", "Failed to stop FFmpeg: {:#}", e);
            }
        }
        while let Ok(event) = self.events_rx.try_recv() {
            log_capture_event(&event, true);
        }

        // 2. 渲染端
        if let Some(mut session) = self.render.take() {
            match tokio::time::timeout(timings.browser_close, session.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(component = "render", "Failed to close browser: {:#}", e),
                Err(_) => error!(
                    component = "render",
                    "Browser did not close within {:?}", timings.browser_close
                ),
            }
        }

        // 3. 内容服务器
        if let Some(mut server) = self.server.take() {
            if let Err(e) = server.stop(timings.server_drain).await {
                error!(component = "server", "Failed to stop overlay server: {:#}", e);
            }
        }

        // 4. 最终状态
        let status = if cause.is_fatal() {
            StreamStatus::Error
        } else {
            StreamStatus::Stopped
        };
        self.reporter.report(status).await;

        self.transition(LifecycleState::Stopped);
        info!("Goodbye!");
    }

    fn transition(&mut self, next: LifecycleState) {
        if self.state.can_transition_to(next) {
            info!("Lifecycle: {} -> {}", self.state, next);
            self.state = next;
        } else {
            warn!("Ignoring invalid lifecycle transition {} -> {}", self.state, next);
        }
    }
}

/// 关闭阶段由我们发出的 SIGTERM 导致的退出属于预期，不告警
fn capture_exit_level(code: Option<i32>, stopping: bool) -> Level {
    if stopping || code == Some(0) {
        Level::INFO
    } else {
        Level::WARN
    }
}

fn log_capture_event(event: &CaptureEvent, stopping: bool) {
    match event {
        CaptureEvent::Output { line, .. } => info!("FFmpeg: {}", line),
        CaptureEvent::Exited { code, status } => {
            if capture_exit_level(*code, stopping) == Level::WARN {
                warn!(
                    component = "capture",
                    "FFmpeg process exited unexpectedly ({}), waiting for deadline", status
                );
            } else if stopping {
                info!("FFmpeg process terminated ({})", status);
            } else {
                info!("FFmpeg process exited with code 0");
            }
        }
    }
}

/// 将 SIGINT / SIGTERM 转发给编排器
///
/// 监听在调用时即完成注册，返回后收到的信号不会走默认的立即退出路径。
#[cfg(unix)]
pub fn forward_signals(
    triggers: mpsc::UnboundedSender<&'static str>,
) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = interrupt.recv() => "SIGINT",
                Some(()) = terminate.recv() => "SIGTERM",
                else => break,
            };
            if triggers.send(name).is_err() {
                break;
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn forward_signals(
    triggers: mpsc::UnboundedSender<&'static str>,
) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if triggers.send("CTRL-C").is_err() {
                break;
            }
        }
    }))
}
