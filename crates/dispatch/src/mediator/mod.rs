//! The mediator: a broker that tracks runner capacity and answers
//! applications asking where to run a task.
//!
//! Every accepted connection becomes a session on its own task. The first
//! control message decides what the session is:
//!
//! - [`RunnerStart`] opens a runner session: the runner is added to the
//!   [`RunnerPool`], kept current by [`RunnerStatus`] reports and removed
//!   when its connection ends.
//! - [`RunnerRequest`] opens an application session: every request is
//!   answered with a [`RunnerResponse`] or [`RunnerNotAvailable`].

pub mod pool;
pub mod select;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use taskline_link::{Acceptor, Connection, Envelope, LinkError, MessageChannel, MessageRegistry};

use crate::error::DispatchError;
use crate::messages::{
    self, RunnerNotAvailable, RunnerRequest, RunnerResponse, RunnerStart, RunnerStatus,
    CONTROL_CHANNEL,
};

pub use pool::{RunnerItem, RunnerPool};
pub use select::select_runner;

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct Mediator {
    pool: Arc<RunnerPool>,
    registry: Arc<MessageRegistry>,
}

impl Mediator {
    pub fn new(pool: Arc<RunnerPool>) -> Self {
        Self {
            pool,
            registry: messages::shared_registry(),
        }
    }

    pub fn pool(&self) -> &Arc<RunnerPool> {
        &self.pool
    }

    /// Current runners, for diagnostics.
    pub fn snapshot(&self) -> Vec<RunnerItem> {
        self.pool.snapshot()
    }

    /// Accept and serve sessions until `shutdown` fires, then close them all.
    #[instrument(skip_all, fields(endpoint = %acceptor.endpoint()))]
    pub async fn serve<A: Acceptor>(&self, acceptor: A, shutdown: CancellationToken) -> Result<(), DispatchError> {
        info!("mediator listening");
        let sessions = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = acceptor.accept() => match accepted {
                    Ok(connection) => {
                        debug!(connection = %connection.id(), "session accepted");
                        sessions.spawn(self.clone().session(connection, shutdown.child_token()));
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        info!(sessions = sessions.len(), "mediator shutting down");
        sessions.close();
        sessions.wait().await;
        Ok(())
    }

    async fn session(self, connection: Connection, stop: CancellationToken) {
        let control = MessageChannel::new(
            connection.channel(CONTROL_CHANNEL),
            Arc::clone(&self.registry),
            connection.config().max_message_size,
        );

        let first = tokio::select! {
            _ = stop.cancelled() => None,
            first = control.receive() => Some(first),
        };

        match first {
            Some(Ok(envelope)) if envelope.is::<RunnerStart>() => {
                if let Ok(start) = envelope.downcast::<RunnerStart>() {
                    self.runner_session(&control, start, &stop).await;
                }
            }
            Some(Ok(envelope)) if envelope.is::<RunnerRequest>() => {
                if let Ok(request) = envelope.downcast::<RunnerRequest>() {
                    self.application_session(&control, request, &stop).await;
                }
            }
            Some(Ok(envelope)) => {
                warn!(
                    connection = %connection.id(),
                    tag = envelope.tag(),
                    "session opened with an unexpected message, closing"
                );
            }
            Some(Err(err)) => log_receive_end(connection.id(), &err),
            None => {}
        }

        if let Err(err) = connection.dispose().await {
            debug!(connection = %connection.id(), error = %err, "session connection ended with error");
        }
    }

    #[instrument(skip_all, fields(runner = %start.runner_id, endpoint = %start.endpoint))]
    async fn runner_session(&self, control: &MessageChannel, start: RunnerStart, stop: &CancellationToken) {
        let runner_id = start.runner_id;
        self.pool.register(&start);

        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = control.receive() => next,
            };
            match next {
                Ok(envelope) => match envelope.downcast::<RunnerStatus>() {
                    Ok(status) => {
                        self.pool.update(runner_id, &status);
                    }
                    Err(other) => {
                        warn!(tag = other.tag(), "unexpected message from runner, closing session");
                        break;
                    }
                },
                Err(err) => {
                    log_receive_end(runner_id, &err);
                    break;
                }
            }
        }

        self.pool.remove(runner_id);
    }

    async fn application_session(&self, control: &MessageChannel, first: RunnerRequest, stop: &CancellationToken) {
        let mut request = first;
        loop {
            if let Err(err) = self.answer(control, &request) {
                debug!(error = %err, "could not answer runner request");
                break;
            }

            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = control.receive() => next,
            };
            request = match next.and_then(Envelope::expect::<RunnerRequest>) {
                Ok(request) => request,
                Err(err) => {
                    log_receive_end(Uuid::nil(), &err);
                    break;
                }
            };
        }
    }

    fn answer(&self, control: &MessageChannel, request: &RunnerRequest) -> Result<(), LinkError> {
        match self.pool.select(request) {
            Some(runner) => {
                debug!(runner = %runner.id, endpoint = %runner.endpoint, "runner selected");
                control.send(&RunnerResponse {
                    runner_id: runner.id,
                    endpoint: runner.endpoint,
                })
            }
            None => {
                debug!(?request, "no runner matches");
                control.send(&RunnerNotAvailable {
                    reason: format!("no ready runner with capacity among {}", self.pool.len()),
                })
            }
        }
    }
}

impl std::fmt::Debug for Mediator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mediator")
            .field("runners", &self.pool.len())
            .finish()
    }
}

fn log_receive_end(peer: Uuid, err: &LinkError) {
    if matches!(err, LinkError::ChannelClosed(_)) {
        debug!(peer = %peer, "session ended");
    } else if err.is_protocol_violation() {
        warn!(peer = %peer, error = %err, "protocol violation, closing session");
    } else {
        debug!(peer = %peer, error = %err, "session ended with error");
    }
}
