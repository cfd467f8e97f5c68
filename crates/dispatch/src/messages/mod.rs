//! Scheduler protocol spoken between applications, mediator and runners.
//!
//! Every message is a [`WireMessage`](taskline_link::WireMessage) sent over a
//! [`MessageChannel`](taskline_link::MessageChannel); [`registry`] lists all
//! of them for the receiving side.

pub mod control;
pub mod tags;
pub mod task;

use std::sync::Arc;

use taskline_link::MessageRegistry;

pub use control::{
    RunnerBusy, RunnerNotAvailable, RunnerRequest, RunnerResponse, RunnerStart, RunnerState,
    RunnerStatus,
};
pub use task::{
    TaskCancel, TaskCancelled, TaskError, TaskErrorCategory, TaskRequest, TaskResponse,
    TaskTimeout,
};

/// Channel carrying runner and application traffic to the mediator.
pub const CONTROL_CHANNEL: u16 = 0;

/// Channel carrying one task between an application and a runner.
pub const TASK_CHANNEL: u16 = 1;

/// Decoders for every scheduler message.
pub fn registry() -> MessageRegistry {
    MessageRegistry::new()
        .with::<RunnerStart>()
        .with::<RunnerStatus>()
        .with::<RunnerRequest>()
        .with::<RunnerResponse>()
        .with::<RunnerNotAvailable>()
        .with::<RunnerBusy>()
        .with::<TaskRequest>()
        .with::<TaskCancel>()
        .with::<TaskResponse>()
        .with::<TaskError>()
        .with::<TaskTimeout>()
        .with::<TaskCancelled>()
}

pub fn shared_registry() -> Arc<MessageRegistry> {
    Arc::new(registry())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn every_tag_is_registered_once() {
        let registry = registry();
        assert_eq!(registry.len(), tags::ALL.len());
        for tag in tags::ALL {
            assert!(registry.contains(tag), "{tag} missing from registry");
        }
        let unique: HashSet<_> = tags::ALL.iter().collect();
        assert_eq!(unique.len(), tags::ALL.len());
    }

    #[test]
    fn tags_are_namespaced() {
        for tag in tags::ALL {
            assert!(tag.starts_with("taskline."), "{tag}");
            assert_eq!(tag.split('.').count(), 3, "{tag}");
        }
    }

    #[test]
    fn task_request_payload_survives_the_registry() {
        let request = TaskRequest {
            payload: vec![0, 159, 146, 150],
            timeout_ms: 250,
            application_id: uuid::Uuid::new_v4(),
        };
        let body = rmp_serde::to_vec(&request).unwrap();
        let decoded = registry()
            .decode(tags::TASK_REQUEST, &body)
            .unwrap()
            .downcast::<TaskRequest>()
            .unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn error_display_includes_category() {
        let err = TaskError::new(TaskErrorCategory::Deserialization, "bad payload");
        assert_eq!(err.to_string(), "deserialization error: bad payload");
        assert_eq!(RunnerState::Paused.to_string(), "paused");
    }
}
