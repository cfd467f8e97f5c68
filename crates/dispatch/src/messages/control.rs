//! Runner registration, status and runner-selection messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskline_link::WireMessage;

use super::tags;

/// Runner lifecycle as seen by the mediator.
///
/// `Starting → Ready ⇄ Paused → Stopping`; a runner is dropped from the pool
/// once its connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Starting,
    Ready,
    Paused,
    Stopping,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Opens a runner session with the mediator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStart {
    pub runner_id: Uuid,
    /// Where applications connect to reach this runner.
    pub endpoint: String,
    pub max_tasks: u32,
    /// Queue bound; negative means unlimited.
    pub max_queue: i32,
    pub label: Option<String>,
    pub tags: Vec<String>,
    pub platform: String,
    pub os_version: String,
}

impl WireMessage for RunnerStart {
    const TAG: &'static str = tags::RUNNER_START;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub state: RunnerState,
    pub active_tasks: u32,
    pub queue_length: u32,
}

impl RunnerStatus {
    pub fn starting() -> Self {
        Self {
            state: RunnerState::Starting,
            active_tasks: 0,
            queue_length: 0,
        }
    }
}

impl WireMessage for RunnerStatus {
    const TAG: &'static str = tags::RUNNER_STATUS;
}

/// An application asking the mediator where to run a task. Empty filters
/// match every runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerRequest {
    pub platforms: Vec<String>,
    pub label: Option<String>,
    pub tags: Vec<String>,
}

impl RunnerRequest {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platforms.push(platform.into());
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
}

impl WireMessage for RunnerRequest {
    const TAG: &'static str = tags::RUNNER_REQUEST;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerResponse {
    pub runner_id: Uuid,
    pub endpoint: String,
}

impl WireMessage for RunnerResponse {
    const TAG: &'static str = tags::RUNNER_RESPONSE;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerNotAvailable {
    pub reason: String,
}

impl WireMessage for RunnerNotAvailable {
    const TAG: &'static str = tags::RUNNER_NOT_AVAILABLE;
}

/// Admission refused: the runner is full, paused or stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerBusy {
    pub active_tasks: u32,
    pub queue_length: u32,
}

impl WireMessage for RunnerBusy {
    const TAG: &'static str = tags::RUNNER_BUSY;
}
