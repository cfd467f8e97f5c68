//! The runner's single control loop: admission, promotion, completion and
//! status reporting all happen here, so the worker pool needs no lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use taskline_link::{Acceptor, Connection, MessageChannel, MessageRegistry};

use crate::error::DispatchError;
use crate::messages::{RunnerBusy, RunnerStart, RunnerState, RunnerStatus, CONTROL_CHANNEL, TASK_CHANNEL};

use super::executor::TaskExecutor;
use super::worker::{TaskWorker, WorkerEvent, WorkerOptions};
use super::RunnerSettings;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const ACCEPT_QUEUE: usize = 16;
const SHUTDOWN_REASON: &str = "runner shutting down";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Command {
    Pause,
    Resume,
}

/// Control session with the mediator.
struct MediatorLink {
    connection: Connection,
    control: MessageChannel,
}

pub(super) struct ServerLoop {
    id: Uuid,
    settings: RunnerSettings,
    executor: Arc<dyn TaskExecutor>,
    registry: Arc<MessageRegistry>,
    worker_options: WorkerOptions,
    state: RunnerState,
    active: HashMap<Uuid, TaskWorker>,
    queue: VecDeque<TaskWorker>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<RunnerStatus>,
    mediator: Option<MediatorLink>,
    /// Rejections and finished workers being torn down.
    disposals: JoinSet<()>,
    shutdown: CancellationToken,
}

impl ServerLoop {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        id: Uuid,
        settings: RunnerSettings,
        executor: Arc<dyn TaskExecutor>,
        registry: Arc<MessageRegistry>,
        mediator: Option<Connection>,
        commands: mpsc::UnboundedReceiver<Command>,
        status: watch::Sender<RunnerStatus>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let worker_options = WorkerOptions {
            default_timeout: settings.task_timeout_default,
            cancel_grace: settings.cancel_grace,
        };
        let mediator = mediator.map(|connection| MediatorLink {
            control: MessageChannel::new(
                connection.channel(CONTROL_CHANNEL),
                Arc::clone(&registry),
                connection.config().max_message_size,
            ),
            connection,
        });
        Self {
            id,
            settings,
            executor,
            registry,
            worker_options,
            state: RunnerState::Starting,
            active: HashMap::new(),
            queue: VecDeque::new(),
            events_tx,
            events,
            commands,
            status,
            mediator,
            disposals: JoinSet::new(),
            shutdown,
        }
    }

    #[instrument(name = "runner", skip_all, fields(runner = %self.id, endpoint = %self.settings.endpoint))]
    pub(super) async fn run<A: Acceptor + 'static>(mut self, acceptor: A) -> Result<(), DispatchError> {
        let mut accepted = spawn_accept_loop(acceptor, self.shutdown.child_token());
        self.announce();
        self.state = RunnerState::Ready;
        self.publish();
        info!(
            max_tasks = self.settings.max_tasks,
            max_queue = self.settings.max_queue,
            "runner ready"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(event) = self.events.recv() => self.on_event(event),
                Some(command) = self.commands.recv() => self.on_command(command),
                Some(connection) = accepted.recv() => self.admit(connection),
                Some(_) = self.disposals.join_next(), if !self.disposals.is_empty() => {}
            }
            self.promote();
            self.publish();
        }

        self.drain().await;
        Ok(())
    }

    fn announce(&mut self) {
        let start = RunnerStart {
            runner_id: self.id,
            endpoint: self.settings.endpoint.clone(),
            max_tasks: self.settings.max_tasks,
            max_queue: self.settings.max_queue,
            label: self.settings.label.clone(),
            tags: self.settings.tags.clone(),
            platform: self.settings.platform.clone(),
            os_version: self.settings.os_version.clone(),
        };
        if let Some(link) = &self.mediator {
            if let Err(err) = link.control.send(&start) {
                warn!(error = %err, "could not register with the mediator");
                self.drop_mediator();
            }
        }
    }

    fn current_status(&self) -> RunnerStatus {
        RunnerStatus {
            state: self.state,
            active_tasks: self.active.len() as u32,
            queue_length: self.queue.len() as u32,
        }
    }

    /// Publish the status locally and to the mediator when it changed.
    fn publish(&mut self) {
        let status = self.current_status();
        let changed = self.status.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }
        debug!(
            state = %status.state,
            active = status.active_tasks,
            queued = status.queue_length,
            "runner status changed"
        );
        if let Some(link) = &self.mediator {
            if let Err(err) = link.control.send(&status) {
                warn!(error = %err, "status report to the mediator failed, continuing without it");
                self.drop_mediator();
            }
        }
    }

    fn drop_mediator(&mut self) {
        if let Some(link) = self.mediator.take() {
            self.disposals.spawn(async move {
                let _ = link.connection.dispose().await;
            });
        }
    }

    fn is_full(&self) -> bool {
        let max_queue = self.settings.max_queue;
        self.active.len() as u64 >= u64::from(self.settings.max_tasks)
            && max_queue >= 0
            && self.queue.len() as u64 >= max_queue as u64
    }

    fn admit(&mut self, connection: Connection) {
        if self.state != RunnerState::Ready || self.is_full() {
            let busy = RunnerBusy {
                active_tasks: self.active.len() as u32,
                queue_length: self.queue.len() as u32,
            };
            info!(
                connection = %connection.id(),
                state = %self.state,
                active = busy.active_tasks,
                queued = busy.queue_length,
                "rejecting application, runner busy"
            );
            let messages = MessageChannel::new(
                connection.channel(TASK_CHANNEL),
                Arc::clone(&self.registry),
                connection.config().max_message_size,
            );
            self.disposals.spawn(async move {
                if let Err(err) = messages.send_flushed(&busy).await {
                    debug!(error = %err, "busy notice not delivered");
                }
                let _ = connection.dispose().await;
            });
            return;
        }

        let mut worker = TaskWorker::new(
            connection,
            Arc::clone(&self.registry),
            Arc::clone(&self.executor),
            self.worker_options.clone(),
            self.events_tx.clone(),
        );
        let has_slot = (self.active.len() as u64) < u64::from(self.settings.max_tasks);
        if has_slot && self.queue.is_empty() {
            debug!(task = %worker.id(), "starting task");
            worker.start();
            self.active.insert(worker.id(), worker);
        } else {
            debug!(task = %worker.id(), position = self.queue.len(), "queueing task");
            self.queue.push_back(worker);
        }
    }

    /// Start queued workers while slots are free.
    fn promote(&mut self) {
        if self.state == RunnerState::Stopping {
            return;
        }
        while (self.active.len() as u64) < u64::from(self.settings.max_tasks) {
            let Some(mut worker) = self.queue.pop_front() else {
                break;
            };
            debug!(task = %worker.id(), "starting queued task");
            worker.start();
            self.active.insert(worker.id(), worker);
        }
    }

    fn on_event(&mut self, event: WorkerEvent) {
        let WorkerEvent::Finished { id, state } = event;
        match self.active.remove(&id) {
            Some(worker) => {
                debug!(task = %id, outcome = %state, "releasing task slot");
                self.disposals.spawn(async move {
                    worker.dispose().await;
                });
            }
            None => warn!(task = %id, "completion for an unknown task"),
        }
    }

    fn on_command(&mut self, command: Command) {
        let next = match (command, self.state) {
            (Command::Pause, RunnerState::Ready) => RunnerState::Paused,
            (Command::Resume, RunnerState::Paused) => RunnerState::Ready,
            (command, state) => {
                debug!(?command, %state, "command does not apply");
                return;
            }
        };
        info!(from = %self.state, to = %next, "runner state");
        self.state = next;
    }

    /// Turn away the queue, cancel running tasks and wait for every
    /// connection to close.
    async fn drain(&mut self) {
        self.state = RunnerState::Stopping;
        self.publish();
        info!(
            active = self.active.len(),
            queued = self.queue.len(),
            "runner stopping"
        );

        for worker in self.queue.drain(..) {
            self.disposals.spawn(worker.reject(SHUTDOWN_REASON));
        }
        for worker in self.active.values() {
            worker.cancel(SHUTDOWN_REASON);
        }
        for (_, worker) in self.active.drain() {
            self.disposals.spawn(async move {
                worker.dispose().await;
            });
        }
        while self.disposals.join_next().await.is_some() {}

        if let Some(link) = self.mediator.take() {
            if let Err(err) = link.connection.dispose().await {
                debug!(error = %err, "mediator connection ended with error");
            }
        }
        info!("runner stopped");
    }
}

/// Accept on a dedicated task so an in-progress handshake is never dropped
/// by the control loop's `select!`.
fn spawn_accept_loop<A: Acceptor + 'static>(acceptor: A, stop: CancellationToken) -> mpsc::Receiver<Connection> {
    let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = acceptor.accept() => accepted,
            };
            match accepted {
                Ok(connection) => {
                    if tx.send(connection).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!("accept loop stopped");
    });
    rx
}
