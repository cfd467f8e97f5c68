use thiserror::Error;

use taskline_link::LinkError;

/// Errors raised by the mediator, runner and application client.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("runner busy ({active_tasks} active, {queue_length} queued)")]
    RunnerBusy { active_tasks: u32, queue_length: u32 },

    #[error("no runner available: {0}")]
    RunnerNotAvailable(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<DispatchError>,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("runner is shutting down")]
    ShuttingDown,

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

impl DispatchError {
    /// Capacity signals are not failures; the caller may retry elsewhere.
    pub fn is_capacity_signal(&self) -> bool {
        matches!(self, Self::RunnerBusy { .. } | Self::RunnerNotAvailable(_))
    }
}
