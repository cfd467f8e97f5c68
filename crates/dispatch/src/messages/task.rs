//! Task submission, cancellation and the four terminal messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskline_link::WireMessage;

use super::tags;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Serialized task, opaque to the transport.
    #[serde(with = "taskline_link::message::bin")]
    pub payload: Vec<u8>,
    /// Wall-clock limit; 0 uses the runner's default.
    pub timeout_ms: u64,
    pub application_id: Uuid,
}

impl WireMessage for TaskRequest {
    const TAG: &'static str = tags::TASK_REQUEST;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCancel {
    pub reason: String,
}

impl WireMessage for TaskCancel {
    const TAG: &'static str = tags::TASK_CANCEL;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResponse {
    #[serde(with = "taskline_link::message::bin")]
    pub result: Vec<u8>,
}

impl WireMessage for TaskResponse {
    const TAG: &'static str = tags::TASK_RESPONSE;
}

/// Which phase of a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorCategory {
    /// Protocol or runner trouble around the task.
    General,
    /// The payload could not be turned into a runnable task.
    Deserialization,
    /// The task itself failed or panicked.
    Invocation,
}

impl fmt::Display for TaskErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::General => "general",
            Self::Deserialization => "deserialization",
            Self::Invocation => "invocation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub category: TaskErrorCategory,
    pub details: String,
}

impl TaskError {
    pub fn new(category: TaskErrorCategory, details: impl Into<String>) -> Self {
        Self {
            category,
            details: details.into(),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.category, self.details)
    }
}

impl WireMessage for TaskError {
    const TAG: &'static str = tags::TASK_ERROR;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimeout {
    pub elapsed_ms: u64,
}

impl WireMessage for TaskTimeout {
    const TAG: &'static str = tags::TASK_TIMEOUT;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCancelled {
    pub reason: String,
}

impl WireMessage for TaskCancelled {
    const TAG: &'static str = tags::TASK_CANCELLED;
}
