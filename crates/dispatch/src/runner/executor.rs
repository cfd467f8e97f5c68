//! The payload-execution seam.
//!
//! The runner never interprets task payloads. A [`TaskExecutor`] turns the
//! opaque bytes of a `TaskRequest` into a [`RunnableTask`], which then runs on
//! a blocking thread with an [`ExecutionContext`]:
//!
//! ```ignore
//! let executor = |payload: &[u8]| -> Result<Box<dyn RunnableTask>, String> {
//!     let input = payload.to_vec();
//!     Ok(Box::new(move |ctx: &ExecutionContext| {
//!         if ctx.is_cancelled() {
//!             return Err("cancelled".to_string());
//!         }
//!         Ok(input)
//!     }))
//! };
//! ```

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What a running task can see about itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    task_id: Uuid,
    application_id: Uuid,
    cancellation: CancellationToken,
    started: Instant,
    deadline: Option<Instant>,
}

impl ExecutionContext {
    pub fn new(
        task_id: Uuid,
        application_id: Uuid,
        cancellation: CancellationToken,
        timeout: Option<Duration>,
    ) -> Self {
        let started = Instant::now();
        Self {
            task_id,
            application_id,
            cancellation,
            started,
            deadline: timeout.map(|t| started + t),
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn application_id(&self) -> Uuid {
        self.application_id
    }

    /// Set by an explicit cancel, a timeout or runner shutdown.
    ///
    /// Long-running tasks should check this periodically; nothing stops a task
    /// that ignores it.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the timeout fires, `None` without a timeout.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// A decoded task, ready to run once.
pub trait RunnableTask: Send + 'static {
    /// Run to completion on the calling (blocking) thread.
    ///
    /// `Err` carries the failure text reported as an invocation error.
    fn run(self: Box<Self>, ctx: &ExecutionContext) -> Result<Vec<u8>, String>;
}

impl<F> RunnableTask for F
where
    F: FnOnce(&ExecutionContext) -> Result<Vec<u8>, String> + Send + 'static,
{
    fn run(self: Box<Self>, ctx: &ExecutionContext) -> Result<Vec<u8>, String> {
        (*self)(ctx)
    }
}

/// Turns payload bytes into runnable tasks.
pub trait TaskExecutor: Send + Sync + 'static {
    /// `Err` carries the failure text reported as a deserialization error.
    fn decode(&self, payload: &[u8]) -> Result<Box<dyn RunnableTask>, String>;
}

impl<F> TaskExecutor for F
where
    F: Fn(&[u8]) -> Result<Box<dyn RunnableTask>, String> + Send + Sync + 'static,
{
    fn decode(&self, payload: &[u8]) -> Result<Box<dyn RunnableTask>, String> {
        self(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(timeout: Option<Duration>) -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4(), Uuid::new_v4(), CancellationToken::new(), timeout)
    }

    #[test]
    fn closures_are_tasks() {
        let task: Box<dyn RunnableTask> = Box::new(|ctx: &ExecutionContext| {
            Ok::<_, String>(ctx.task_id().as_bytes().to_vec())
        });
        let ctx = context(None);
        assert_eq!(task.run(&ctx).unwrap(), ctx.task_id().as_bytes().to_vec());
    }

    #[test]
    fn closures_are_executors() {
        let executor = |payload: &[u8]| -> Result<Box<dyn RunnableTask>, String> {
            if payload.is_empty() {
                return Err("empty payload".into());
            }
            let copy = payload.to_vec();
            Ok(Box::new(move |_: &ExecutionContext| Ok::<_, String>(copy)))
        };
        assert_eq!(executor.decode(b"").err().unwrap(), "empty payload");
        let task = executor.decode(b"abc").unwrap();
        assert_eq!(task.run(&context(None)).unwrap(), b"abc");
    }

    #[test]
    fn cancellation_is_visible() {
        let ctx = context(None);
        assert!(!ctx.is_cancelled());
        ctx.cancellation_token().cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn remaining_time_needs_a_timeout() {
        assert!(context(None).remaining().is_none());
        let remaining = context(Some(Duration::from_secs(60))).remaining().unwrap();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
    }
}
