//! One task on one application connection.
//!
//! ```text
//! Created --start--> Running --ok--------> Completed
//!                            --failure---> Errored(category)
//!                            --cancel----> Cancelled
//!                            --deadline--> TimedOut
//! ```
//!
//! Every path ends in exactly one terminal message to the application and
//! exactly one [`WorkerEvent::Finished`] to the runner server.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use taskline_link::{Connection, Envelope, LinkError, MessageChannel, MessageRegistry, WireMessage};

use crate::messages::{
    TaskCancel, TaskCancelled, TaskError, TaskErrorCategory, TaskRequest, TaskResponse,
    TaskTimeout, TASK_CHANNEL,
};

use super::executor::{ExecutionContext, TaskExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Completed,
    Errored(TaskErrorCategory),
    Cancelled,
    TimedOut,
    Disposed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Errored(_) | Self::Cancelled | Self::TimedOut
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Completed => f.write_str("completed"),
            Self::Errored(category) => write!(f, "errored ({category})"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Disposed => f.write_str("disposed"),
        }
    }
}

/// Sent to the runner server when a worker reaches its terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Finished { id: Uuid, state: TaskState },
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Used when the request carries no timeout.
    pub default_timeout: Option<Duration>,
    /// How long a cancelled execution may keep running before it is detached.
    pub cancel_grace: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            default_timeout: None,
            cancel_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Open,
    Claimed,
    Delivered,
}

/// Lets exactly one party send the terminal message.
///
/// The winner of [`claim`](Self::claim) sends and then calls
/// [`deliver`](Self::deliver); losers wait on [`delivered`](Self::delivered)
/// so the connection never closes under a terminal message still being
/// written.
#[derive(Clone)]
struct TerminalGate(Arc<watch::Sender<Terminal>>);

impl TerminalGate {
    fn new() -> Self {
        Self(Arc::new(watch::channel(Terminal::Open).0))
    }

    fn claim(&self) -> bool {
        self.0.send_if_modified(|terminal| {
            if *terminal == Terminal::Open {
                *terminal = Terminal::Claimed;
                true
            } else {
                false
            }
        })
    }

    fn deliver(&self) {
        self.0.send_replace(Terminal::Delivered);
    }

    async fn delivered(&self) {
        let mut terminal = self.0.subscribe();
        let _ = terminal.wait_for(|t| *t == Terminal::Delivered).await;
    }
}

/// Cancellation token plus the first reason given for it.
#[derive(Debug, Default)]
struct CancelSignal {
    token: CancellationToken,
    reason: Mutex<Option<String>>,
}

impl CancelSignal {
    fn trigger(&self, reason: impl Into<String>) {
        {
            let mut current = self
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.is_none() {
                *current = Some(reason.into());
            }
        }
        self.token.cancel();
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| "cancelled".to_string())
    }
}

/// Owns one application connection and the task that arrives on it.
pub struct TaskWorker {
    id: Uuid,
    connection: Connection,
    messages: MessageChannel,
    executor: Arc<dyn TaskExecutor>,
    options: WorkerOptions,
    cancel: Arc<CancelSignal>,
    state: Arc<watch::Sender<TaskState>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    supervisor: Option<JoinHandle<()>>,
}

impl TaskWorker {
    pub fn new(
        connection: Connection,
        registry: Arc<MessageRegistry>,
        executor: Arc<dyn TaskExecutor>,
        options: WorkerOptions,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let messages = MessageChannel::new(
            connection.channel(TASK_CHANNEL),
            registry,
            connection.config().max_message_size,
        );
        Self {
            id: Uuid::new_v4(),
            connection,
            messages,
            executor,
            options,
            cancel: Arc::new(CancelSignal::default()),
            state: Arc::new(watch::channel(TaskState::Created).0),
            events,
            supervisor: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Start the supervisor. Later calls do nothing.
    pub fn start(&mut self) {
        if self.supervisor.is_some() {
            return;
        }
        self.state.send_replace(TaskState::Running);
        let supervisor = Supervisor {
            id: self.id,
            messages: self.messages.clone(),
            executor: Arc::clone(&self.executor),
            options: self.options.clone(),
            cancel: Arc::clone(&self.cancel),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        };
        self.supervisor = Some(tokio::spawn(supervisor.run()));
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.trigger(reason);
    }

    /// Turn away a worker that never started: acknowledge as cancelled and
    /// close the connection.
    pub async fn reject(self, reason: &str) {
        debug!(task = %self.id, reason, "rejecting queued task");
        send_terminal(
            self.id,
            &self.messages,
            &TaskCancelled {
                reason: reason.to_string(),
            },
        )
        .await;
        self.state.send_replace(TaskState::Cancelled);
        self.dispose().await;
    }

    /// Wait for the supervisor, then dispose the connection. Returns the
    /// terminal state.
    pub async fn dispose(mut self) -> TaskState {
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(err) = supervisor.await {
                warn!(task = %self.id, error = %err, "task supervisor failed");
            }
        }
        let terminal = self.state();
        if let Err(err) = self.connection.dispose().await {
            debug!(task = %self.id, error = %err, "application connection ended with error");
        }
        self.state.send_replace(TaskState::Disposed);
        terminal
    }
}

impl fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskWorker")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("connection", &self.connection.id())
            .finish()
    }
}

struct Supervisor {
    id: Uuid,
    messages: MessageChannel,
    executor: Arc<dyn TaskExecutor>,
    options: WorkerOptions,
    cancel: Arc<CancelSignal>,
    state: Arc<watch::Sender<TaskState>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Supervisor {
    #[instrument(name = "task", skip_all, fields(task = %self.id))]
    async fn run(self) {
        let mut finished = FinishedNotice {
            id: self.id,
            state: Arc::clone(&self.state),
            events: self.events.clone(),
            outcome: None,
        };
        let state = self.execute().await;
        info!(outcome = %state, "task finished");
        finished.outcome = Some(state);
    }

    async fn execute(&self) -> TaskState {
        let received = tokio::select! {
            _ = self.cancel.token.cancelled() => {
                self.send(&TaskCancelled { reason: self.cancel.reason() }).await;
                return TaskState::Cancelled;
            }
            received = self.messages.receive() => received,
        };

        let request = match received.map(Envelope::downcast::<TaskRequest>) {
            Ok(Ok(request)) => request,
            Ok(Err(envelope)) => return self.before_request(envelope).await,
            Err(err) => {
                warn!(error = %err, "no task request received");
                self.send(&TaskError::new(
                    TaskErrorCategory::General,
                    format!("no task request received: {err}"),
                ))
                .await;
                return TaskState::Errored(TaskErrorCategory::General);
            }
        };

        let decoded = panic::catch_unwind(AssertUnwindSafe(|| self.executor.decode(&request.payload)))
            .unwrap_or_else(|_| Err("payload decoder panicked".to_string()));
        let task = match decoded {
            Ok(task) => task,
            Err(details) => {
                debug!(details = %details, "task payload could not be decoded");
                self.send(&TaskError::new(TaskErrorCategory::Deserialization, details))
                    .await;
                return TaskState::Errored(TaskErrorCategory::Deserialization);
            }
        };

        let timeout = match request.timeout_ms {
            0 => self.options.default_timeout,
            ms => Some(Duration::from_millis(ms)),
        };
        debug!(application = %request.application_id, ?timeout, "executing task");

        let ctx = ExecutionContext::new(
            self.id,
            request.application_id,
            self.cancel.token.clone(),
            timeout,
        );
        let started = Instant::now();
        let mut execution = tokio::task::spawn_blocking(move || task.run(&ctx));

        let cancel = Arc::clone(&self.cancel);
        let mut listener = self.messages.listen(move |envelope| {
            match envelope.downcast::<TaskCancel>() {
                Ok(TaskCancel { reason }) => {
                    debug!(reason = %reason, "cancel requested by application");
                    cancel.trigger(reason);
                }
                Err(other) => warn!(tag = other.tag(), "ignoring message during execution"),
            }
        });

        let gate = TerminalGate::new();
        let timer = timeout.map(|limit| {
            tokio::spawn(enforce_timeout(
                limit,
                started,
                gate.clone(),
                self.cancel.token.clone(),
                self.messages.clone(),
                self.id,
            ))
        });

        let interrupted = tokio::select! {
            joined = &mut execution => Ok(joined),
            _ = self.cancel.token.cancelled() => Err(Interruption::Cancelled),
            ended = &mut listener => Err(self.listener_ended(ended)),
        };

        let state = match interrupted {
            Ok(joined) => {
                if gate.claim() {
                    let state = self.report(joined).await;
                    gate.deliver();
                    state
                } else {
                    gate.delivered().await;
                    TaskState::TimedOut
                }
            }
            Err(interruption) => {
                // Claim before the grace wait so a deadline passing during it
                // cannot turn a cancellation into a timeout.
                let claimed = gate.claim();
                if tokio::time::timeout(self.options.cancel_grace, &mut execution)
                    .await
                    .is_err()
                {
                    warn!(grace = ?self.options.cancel_grace, "execution ignored cancellation, detaching it");
                }
                if claimed {
                    let state = match interruption {
                        Interruption::Cancelled => {
                            self.send(&TaskCancelled { reason: self.cancel.reason() }).await;
                            TaskState::Cancelled
                        }
                        Interruption::Violation(details) => {
                            self.send(&TaskError::new(TaskErrorCategory::General, details))
                                .await;
                            TaskState::Errored(TaskErrorCategory::General)
                        }
                    };
                    gate.deliver();
                    state
                } else {
                    gate.delivered().await;
                    TaskState::TimedOut
                }
            }
        };

        listener.abort();
        if let Some(timer) = timer {
            timer.abort();
        }
        state
    }

    /// Outcome of an execution that ran to the end, failed or panicked.
    async fn report(&self, joined: Result<Result<Vec<u8>, String>, JoinError>) -> TaskState {
        match joined {
            Ok(Ok(result)) => {
                self.send(&TaskResponse { result }).await;
                TaskState::Completed
            }
            Ok(Err(details)) => {
                self.send(&TaskError::new(TaskErrorCategory::Invocation, details))
                    .await;
                TaskState::Errored(TaskErrorCategory::Invocation)
            }
            Err(join) => {
                let details = if join.is_panic() {
                    "task panicked".to_string()
                } else {
                    format!("task execution failed: {join}")
                };
                warn!(details = %details, "execution thread failed");
                self.send(&TaskError::new(TaskErrorCategory::Invocation, details))
                    .await;
                TaskState::Errored(TaskErrorCategory::Invocation)
            }
        }
    }

    /// The application stopped listening or broke the protocol mid-execution.
    /// Either way the execution is cancelled.
    fn listener_ended(&self, ended: Result<Result<(), LinkError>, JoinError>) -> Interruption {
        match ended {
            Ok(Err(err)) if err.is_protocol_violation() => {
                warn!(error = %err, "protocol violation during execution");
                self.cancel.trigger(format!("protocol violation: {err}"));
                Interruption::Violation(format!("protocol violation during execution: {err}"))
            }
            Ok(Err(err)) => {
                debug!(error = %err, "application connection failed");
                self.cancel.trigger("application went away");
                Interruption::Cancelled
            }
            _ => {
                self.cancel.trigger("application went away");
                Interruption::Cancelled
            }
        }
    }

    /// A message other than `TaskRequest` opened the channel.
    async fn before_request(&self, envelope: Envelope) -> TaskState {
        match envelope.downcast::<TaskCancel>() {
            Ok(TaskCancel { reason }) => {
                debug!(reason = %reason, "cancelled before the request arrived");
                self.send(&TaskCancelled { reason }).await;
                TaskState::Cancelled
            }
            Err(other) => {
                warn!(tag = other.tag(), "expected a task request");
                self.send(&TaskError::new(
                    TaskErrorCategory::General,
                    format!("expected a task request, got '{}'", other.tag()),
                ))
                .await;
                TaskState::Errored(TaskErrorCategory::General)
            }
        }
    }

    async fn send<M: WireMessage>(&self, message: &M) {
        send_terminal(self.id, &self.messages, message).await;
    }
}

/// Why execution stopped before producing a result.
enum Interruption {
    Cancelled,
    Violation(String),
}

/// Reports the worker's end to the runner server even when the supervisor
/// unwinds, so its slot is always released.
struct FinishedNotice {
    id: Uuid,
    state: Arc<watch::Sender<TaskState>>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    outcome: Option<TaskState>,
}

impl Drop for FinishedNotice {
    fn drop(&mut self) {
        let state = self.outcome.unwrap_or_else(|| {
            warn!(task = %self.id, "task supervisor ended without an outcome");
            TaskState::Errored(TaskErrorCategory::General)
        });
        self.state.send_replace(state);
        if self.events.send(WorkerEvent::Finished { id: self.id, state }).is_err() {
            debug!(task = %self.id, "runner server gone, completion not reported");
        }
    }
}

async fn enforce_timeout(
    limit: Duration,
    started: Instant,
    gate: TerminalGate,
    token: CancellationToken,
    messages: MessageChannel,
    task: Uuid,
) {
    tokio::time::sleep(limit).await;
    if !gate.claim() {
        return;
    }
    token.cancel();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(task = %task, elapsed_ms, "task timed out");
    send_terminal(task, &messages, &TaskTimeout { elapsed_ms }).await;
    gate.deliver();
}

/// Send and flush; the application may already be gone.
async fn send_terminal<M: WireMessage>(task: Uuid, messages: &MessageChannel, message: &M) {
    if let Err(err) = messages.send_flushed(message).await {
        log_send_failure(task, M::TAG, &err);
    }
}

fn log_send_failure(task: Uuid, tag: &str, err: &LinkError) {
    debug!(task = %task, tag, error = %err, "terminal message not delivered");
}
