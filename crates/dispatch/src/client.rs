//! Application side: ask the mediator for a runner, submit a task there and
//! wait for its outcome.
//!
//! Execution is at most once. Capacity signals (`RunnerBusy`,
//! `RunnerNotAvailable`) happen before a task was admitted, so [`TaskClient::run`]
//! retries them; a task whose runner vanished is reported as
//! [`JobStatus::Abandoned`] and never resubmitted.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use taskline_link::{Connection, Connector, Envelope, MessageChannel, MessageRegistry};

use crate::error::DispatchError;
use crate::messages::{
    self, RunnerBusy, RunnerNotAvailable, RunnerRequest, RunnerResponse, TaskCancel,
    TaskCancelled, TaskError, TaskRequest, TaskResponse, TaskTimeout, CONTROL_CHANNEL,
    TASK_CHANNEL,
};

/// How often and how patiently [`TaskClient::run`] retries capacity signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSubmission {
    pub payload: Vec<u8>,
    /// `None` leaves the limit to the runner.
    pub timeout: Option<Duration>,
    pub application_id: Uuid,
}

impl TaskSubmission {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            timeout: None,
            application_id: Uuid::new_v4(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_application_id(mut self, id: Uuid) -> Self {
        self.application_id = id;
        self
    }

    fn request(&self) -> TaskRequest {
        TaskRequest {
            payload: self.payload.clone(),
            timeout_ms: self.timeout.map_or(0, |t| (t.as_millis() as u64).max(1)),
            application_id: self.application_id,
        }
    }
}

/// Where a job stands, from the application's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Running,
    Complete,
    Error,
    Cancelled,
    Timeout,
    /// The runner went away without reporting an outcome.
    Abandoned,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub status: JobStatus,
    /// Set when `status` is `Complete`.
    pub result: Option<Vec<u8>>,
    /// Set when `status` is `Error`.
    pub error: Option<TaskError>,
}

impl JobOutcome {
    fn of(status: JobStatus) -> Self {
        Self {
            status,
            result: None,
            error: None,
        }
    }
}

/// One submitted task on its runner connection.
pub struct Job {
    application_id: Uuid,
    endpoint: String,
    connection: Connection,
    messages: MessageChannel,
    outcome: Mutex<Option<JobOutcome>>,
}

impl Job {
    pub fn application_id(&self) -> Uuid {
        self.application_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> JobStatus {
        self.lock_outcome()
            .as_ref()
            .map_or(JobStatus::Running, |outcome| outcome.status)
    }

    fn lock_outcome(&self) -> std::sync::MutexGuard<'_, Option<JobOutcome>> {
        self.outcome
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask the runner to cancel. The outcome still arrives through [`wait`](Self::wait).
    pub async fn cancel(&self, reason: impl Into<String>) -> Result<(), DispatchError> {
        self.messages
            .send_flushed(&TaskCancel {
                reason: reason.into(),
            })
            .await?;
        Ok(())
    }

    /// Wait for the terminal message, then close the connection.
    ///
    /// Calling it again returns the same outcome.
    #[instrument(skip_all, fields(application = %self.application_id, endpoint = %self.endpoint))]
    pub async fn wait(&self) -> Result<JobOutcome, DispatchError> {
        let finished = self.lock_outcome().clone();
        if let Some(outcome) = finished {
            return Ok(outcome);
        }

        let outcome = match self.messages.receive().await {
            Ok(envelope) => terminal_outcome(envelope),
            Err(err) if err.is_connection_failure() => {
                warn!(error = %err, "runner went away without an outcome");
                Ok(JobOutcome::of(JobStatus::Abandoned))
            }
            Err(err) => Err(err.into()),
        };
        if let Err(err) = self.connection.dispose().await {
            debug!(error = %err, "runner connection ended with error");
        }

        let outcome = outcome?;
        debug!(status = %outcome.status, "job finished");
        *self.lock_outcome() = Some(outcome.clone());
        Ok(outcome)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("application_id", &self.application_id)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

fn terminal_outcome(envelope: Envelope) -> Result<JobOutcome, DispatchError> {
    let envelope = match envelope.downcast::<TaskResponse>() {
        Ok(TaskResponse { result }) => {
            return Ok(JobOutcome {
                result: Some(result),
                ..JobOutcome::of(JobStatus::Complete)
            })
        }
        Err(other) => other,
    };
    let envelope = match envelope.downcast::<TaskError>() {
        Ok(error) => {
            return Ok(JobOutcome {
                error: Some(error),
                ..JobOutcome::of(JobStatus::Error)
            })
        }
        Err(other) => other,
    };
    if envelope.is::<TaskCancelled>() {
        return Ok(JobOutcome::of(JobStatus::Cancelled));
    }
    if envelope.is::<TaskTimeout>() {
        return Ok(JobOutcome::of(JobStatus::Timeout));
    }
    match envelope.downcast::<RunnerBusy>() {
        Ok(busy) => Err(DispatchError::RunnerBusy {
            active_tasks: busy.active_tasks,
            queue_length: busy.queue_length,
        }),
        Err(other) => Err(DispatchError::Protocol(format!(
            "expected a task outcome, got '{}'",
            other.tag()
        ))),
    }
}

/// Submits tasks through a mediator.
pub struct TaskClient<C> {
    connector: C,
    mediator: String,
    retry: RetryPolicy,
    registry: Arc<MessageRegistry>,
}

impl<C: Connector> TaskClient<C> {
    pub fn new(connector: C, mediator: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            connector,
            mediator: mediator.into(),
            retry,
            registry: messages::shared_registry(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Ask the mediator for the best runner right now.
    #[instrument(skip_all, fields(mediator = %self.mediator))]
    pub async fn request_runner(&self, request: &RunnerRequest) -> Result<RunnerResponse, DispatchError> {
        let connection = self.connector.connect(&self.mediator).await?;
        let control = MessageChannel::new(
            connection.channel(CONTROL_CHANNEL),
            Arc::clone(&self.registry),
            connection.config().max_message_size,
        );

        let answer = async {
            control.send(request)?;
            Ok::<_, DispatchError>(control.receive().await?)
        }
        .await;
        if let Err(err) = connection.dispose().await {
            debug!(error = %err, "mediator connection ended with error");
        }

        match answer?.downcast::<RunnerResponse>() {
            Ok(response) => {
                debug!(runner = %response.runner_id, endpoint = %response.endpoint, "runner assigned");
                Ok(response)
            }
            Err(other) => match other.downcast::<RunnerNotAvailable>() {
                Ok(RunnerNotAvailable { reason }) => Err(DispatchError::RunnerNotAvailable(reason)),
                Err(other) => Err(DispatchError::Protocol(format!(
                    "expected a runner response, got '{}'",
                    other.tag()
                ))),
            },
        }
    }

    /// Send `submission` to the runner at `endpoint`.
    #[instrument(skip_all, fields(endpoint = %endpoint, application = %submission.application_id))]
    pub async fn submit(&self, endpoint: &str, submission: &TaskSubmission) -> Result<Job, DispatchError> {
        let connection = self.connector.connect(endpoint).await?;
        let messages = MessageChannel::new(
            connection.channel(TASK_CHANNEL),
            Arc::clone(&self.registry),
            connection.config().max_message_size,
        );
        match messages.send_flushed(&submission.request()).await {
            Ok(()) => debug!(bytes = submission.payload.len(), "task submitted"),
            // Runners refuse at accept time and may close before the request
            // lands; their RunnerBusy notice is still readable through `wait`.
            Err(err) if err.is_connection_failure() => {
                debug!(error = %err, "runner closed during submission");
            }
            Err(err) => {
                let _ = connection.dispose().await;
                return Err(err.into());
            }
        }
        Ok(Job {
            application_id: submission.application_id,
            endpoint: endpoint.to_string(),
            connection,
            messages,
            outcome: Mutex::new(None),
        })
    }

    /// Find a runner, submit and wait, retrying while runners report no
    /// capacity.
    pub async fn run(&self, submission: &TaskSubmission, request: &RunnerRequest) -> Result<JobOutcome, DispatchError> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            match self.attempt(submission, request).await {
                Err(err) if err.is_capacity_signal() => {
                    info!(attempt, attempts, reason = %err, "no capacity, retrying");
                    last = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.backoff).await;
                    }
                }
                other => return other,
            }
        }

        Err(DispatchError::RetriesExhausted {
            attempts,
            last: Box::new(
                last.unwrap_or_else(|| DispatchError::RunnerNotAvailable("no attempt made".into())),
            ),
        })
    }

    async fn attempt(&self, submission: &TaskSubmission, request: &RunnerRequest) -> Result<JobOutcome, DispatchError> {
        let runner = self.request_runner(request).await?;
        let job = self.submit(&runner.endpoint, submission).await?;
        job.wait().await
    }
}

impl<C> fmt::Debug for TaskClient<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskClient")
            .field("mediator", &self.mediator)
            .field("retry", &self.retry)
            .finish()
    }
}
