pub mod client;
pub mod config;
pub mod error;
pub mod mediator;
pub mod messages;
pub mod runner;

pub use client::{Job, JobOutcome, JobStatus, RetryPolicy, TaskClient, TaskSubmission};
pub use config::{ClientConfig, MediatorConfig, RunnerConfig, TasklineConfig, TlsSettings};
pub use error::DispatchError;
pub use mediator::{select_runner, Mediator, RunnerItem, RunnerPool};
pub use messages::{
    RunnerRequest, RunnerState, RunnerStatus, TaskError, TaskErrorCategory, CONTROL_CHANNEL,
    TASK_CHANNEL,
};
pub use runner::{
    ExecutionContext, RunnableTask, RunnerHandle, RunnerServer, RunnerSettings, TaskExecutor,
    TaskState,
};
