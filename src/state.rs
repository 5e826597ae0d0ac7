use std::fmt;

/// 编排器的生命周期状态
///
/// 状态只能单向推进：`Starting -> Streaming -> Stopping -> Stopped`。
/// `Errored` 可从 `Starting` 或 `Streaming` 进入，之后必须经过 `Stopping`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Streaming,
    Stopping,
    Stopped,
    Errored,
}

impl LifecycleState {
    /// 判断从当前状态迁移到 `next` 是否合法
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Starting, Streaming)
                | (Starting, Errored)
                // 启动期间收到终止信号
                | (Starting, Stopping)
                | (Streaming, Stopping)
                | (Streaming, Errored)
                | (Errored, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Stopped
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Streaming => "streaming",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Errored => "errored",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 触发关闭流程的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// 到达运行截止时间
    Deadline,
    /// 收到外部终止信号 (SIGINT / SIGTERM)
    Signal(&'static str),
    /// 启动阶段的致命错误
    Fatal(String),
}

impl ShutdownCause {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShutdownCause::Fatal(_))
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Deadline => f.write_str("deadline reached"),
            ShutdownCause::Signal(name) => write!(f, "received {}", name),
            ShutdownCause::Fatal(msg) => write!(f, "fatal error: {}", msg),
        }
    }
}
