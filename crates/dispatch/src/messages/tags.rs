//! Message tags for the scheduler protocol.
//!
//! Tags follow the pattern `taskline.<area>.<name>` and are written ahead of
//! every message body, so they must never change once deployed.

// ── Runner ⇄ mediator ─────────────────────────────────────────────────────

/// First message of a runner session: who the runner is and its capacity.
pub const RUNNER_START: &str = "taskline.runner.start";

/// Runner state and load, sent after every change.
pub const RUNNER_STATUS: &str = "taskline.runner.status";

// ── Application ⇄ mediator ────────────────────────────────────────────────

pub const RUNNER_REQUEST: &str = "taskline.mediator.request";
pub const RUNNER_RESPONSE: &str = "taskline.mediator.response";
pub const RUNNER_NOT_AVAILABLE: &str = "taskline.mediator.not_available";

// ── Application ⇄ runner ──────────────────────────────────────────────────

pub const TASK_REQUEST: &str = "taskline.task.request";
pub const TASK_CANCEL: &str = "taskline.task.cancel";

/// Terminal: the task produced a result.
pub const TASK_RESPONSE: &str = "taskline.task.response";

/// Terminal: the task failed.
pub const TASK_ERROR: &str = "taskline.task.error";

/// Terminal: the task ran past its timeout.
pub const TASK_TIMEOUT: &str = "taskline.task.timeout";

/// Terminal: the task was cancelled, or drained from the queue at shutdown.
pub const TASK_CANCELLED: &str = "taskline.task.cancelled";

/// Sent instead of running anything when the runner has no room.
pub const RUNNER_BUSY: &str = "taskline.task.runner_busy";

/// Every tag, for registries and sanity checks.
pub const ALL: &[&str] = &[
    RUNNER_START,
    RUNNER_STATUS,
    RUNNER_REQUEST,
    RUNNER_RESPONSE,
    RUNNER_NOT_AVAILABLE,
    TASK_REQUEST,
    TASK_CANCEL,
    TASK_RESPONSE,
    TASK_ERROR,
    TASK_TIMEOUT,
    TASK_CANCELLED,
    RUNNER_BUSY,
];
