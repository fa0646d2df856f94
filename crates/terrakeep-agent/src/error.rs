use std::time::Duration;

/// Errors surfaced by the supervisor and its command queue.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The process could not be spawned or its stdio could not be acquired.
    #[error("failed to launch server: {0}")]
    Launch(String),

    /// The process never printed its readiness line.
    #[error("server did not become ready: {0}")]
    NotReady(String),

    /// Graceful exit was not observed in time; the process was killed.
    #[error("server did not exit within {}s, killed", .0.as_secs())]
    ShutdownTimeout(Duration),

    #[error("command queue is full ({max} in flight), command dropped")]
    QueueCapacityExceeded { max: usize },

    #[error("command queue is closed, command dropped")]
    QueueClosed,

    /// The process handle is in neither running nor exited state.
    #[error("process entered an unknown state: {0}")]
    UnknownProcessState(String),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,
}

impl SupervisorError {
    /// Stable short code for administration-facing callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Launch(_) => "launch_failed",
            Self::NotReady(_) => "not_ready",
            Self::ShutdownTimeout(_) => "shutdown_timeout",
            Self::QueueCapacityExceeded { .. } => "queue_full",
            Self::QueueClosed => "queue_closed",
            Self::UnknownProcessState(_) => "unknown_state",
            Self::AlreadyRunning => "already_running",
            Self::NotRunning => "not_running",
        }
    }
}
