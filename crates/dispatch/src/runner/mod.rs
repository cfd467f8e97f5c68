//! The runner: a worker-pool server that executes tasks for applications.
//!
//! Each accepted application connection carries exactly one task. The runner
//! re-checks its own capacity before admitting it (the mediator's choice is
//! only a hint), runs up to `max_tasks` tasks at once, queues up to
//! `max_queue` more, and reports every change of `{state, active, queued}` to
//! the mediator.

pub mod executor;
mod server;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskline_link::{Acceptor, Connection};

use crate::error::DispatchError;
use crate::messages::{self, RunnerStatus};

pub use executor::{ExecutionContext, RunnableTask, TaskExecutor};
pub use worker::{TaskState, TaskWorker, WorkerEvent, WorkerOptions};

use server::{Command, ServerLoop};

/// Static description and limits of one runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Address applications use to reach this runner, as told to the mediator.
    pub endpoint: String,
    pub max_tasks: u32,
    /// Queued tasks beyond `max_tasks`; negative means unlimited.
    pub max_queue: i32,
    pub label: Option<String>,
    pub tags: Vec<String>,
    pub platform: String,
    pub os_version: String,
    pub task_timeout_default: Option<Duration>,
    pub cancel_grace: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:7401".to_string(),
            max_tasks: 4,
            max_queue: 16,
            label: None,
            tags: Vec::new(),
            platform: std::env::consts::OS.to_string(),
            os_version: std::env::consts::ARCH.to_string(),
            task_timeout_default: None,
            cancel_grace: Duration::from_secs(5),
        }
    }
}

impl RunnerSettings {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, max_tasks: u32, max_queue: i32) -> Self {
        self.max_tasks = max_tasks;
        self.max_queue = max_queue;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_default = Some(timeout);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }
}

/// Builds and starts a runner.
pub struct RunnerServer {
    id: Uuid,
    settings: RunnerSettings,
    executor: Arc<dyn TaskExecutor>,
}

impl RunnerServer {
    pub fn new(settings: RunnerSettings, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            id: Uuid::new_v4(),
            settings,
            executor,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Start serving connections from `acceptor`.
    ///
    /// With a `mediator` connection the runner registers itself and reports
    /// its status there; without one it runs standalone.
    pub fn spawn<A: Acceptor + 'static>(self, acceptor: A, mediator: Option<Connection>) -> RunnerHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(RunnerStatus::starting());
        let shutdown = CancellationToken::new();

        let server = ServerLoop::new(
            self.id,
            self.settings,
            self.executor,
            messages::shared_registry(),
            mediator,
            commands,
            status_tx,
            shutdown.clone(),
        );
        let task = tokio::spawn(server.run(acceptor));

        RunnerHandle {
            id: self.id,
            commands: commands_tx,
            status,
            shutdown,
            task,
        }
    }
}

/// Control surface of a running runner.
pub struct RunnerHandle {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<RunnerStatus>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), DispatchError>>,
}

impl RunnerHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> RunnerStatus {
        *self.status.borrow()
    }

    /// Receiver that sees every published status.
    pub fn status_updates(&self) -> watch::Receiver<RunnerStatus> {
        self.status.clone()
    }

    /// Stop admitting tasks; running and queued tasks continue.
    pub fn pause(&self) -> Result<(), DispatchError> {
        self.command(Command::Pause)
    }

    pub fn resume(&self) -> Result<(), DispatchError> {
        self.command(Command::Resume)
    }

    fn command(&self, command: Command) -> Result<(), DispatchError> {
        self.commands
            .send(command)
            .map_err(|_| DispatchError::ShuttingDown)
    }

    /// Reject queued tasks, cancel running ones and wait until every
    /// connection is closed.
    pub async fn shutdown(self) -> Result<(), DispatchError> {
        self.shutdown.cancel();
        self.task.await?
    }
}

impl std::fmt::Debug for RunnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}
