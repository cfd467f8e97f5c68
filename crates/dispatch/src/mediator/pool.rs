//! The mediator's view of every connected runner.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::messages::{RunnerRequest, RunnerStart, RunnerState, RunnerStatus};

use super::select::select_runner;

/// One runner's descriptor and last reported load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerItem {
    pub id: Uuid,
    pub endpoint: String,
    pub platform: String,
    pub os_version: String,
    pub max_tasks: u32,
    /// Negative means unlimited.
    pub max_queue: i32,
    pub label: Option<String>,
    pub tags: Vec<String>,
    pub state: RunnerState,
    pub active_tasks: u32,
    pub queue_length: u32,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunnerItem {
    pub fn new(start: &RunnerStart) -> Self {
        let now = Utc::now();
        Self {
            id: start.runner_id,
            endpoint: start.endpoint.clone(),
            platform: start.platform.clone(),
            os_version: start.os_version.clone(),
            max_tasks: start.max_tasks,
            max_queue: start.max_queue,
            label: start.label.clone(),
            tags: start.tags.clone(),
            state: RunnerState::Starting,
            active_tasks: 0,
            queue_length: 0,
            registered_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, status: &RunnerStatus) {
        self.state = status.state;
        self.active_tasks = status.active_tasks;
        self.queue_length = status.queue_length;
        self.updated_at = Utc::now();
    }

    /// Task slots not in use; negative when the runner is over-admitted.
    pub fn free_slots(&self) -> i64 {
        i64::from(self.max_tasks) - i64::from(self.active_tasks)
    }

    pub fn unlimited_queue(&self) -> bool {
        self.max_queue < 0
    }

    /// Whether the runner could take one more task right now.
    pub fn has_capacity(&self) -> bool {
        self.active_tasks < self.max_tasks
            || self.unlimited_queue()
            || i64::from(self.queue_length) < i64::from(self.max_queue)
    }
}

/// All known runners behind one coarse lock.
///
/// Written only by each runner's own session; read by application sessions.
#[derive(Debug, Default)]
pub struct RunnerPool {
    runners: Mutex<HashMap<Uuid, RunnerItem>>,
}

impl RunnerPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, RunnerItem>> {
        self.runners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a runner, replacing an earlier session with the same id.
    pub fn register(&self, start: &RunnerStart) -> RunnerItem {
        let item = RunnerItem::new(start);
        if self.lock().insert(item.id, item.clone()).is_some() {
            info!(runner = %item.id, endpoint = %item.endpoint, "runner re-registered");
        } else {
            info!(runner = %item.id, endpoint = %item.endpoint, platform = %item.platform, "runner registered");
        }
        item
    }

    /// Record a status report. Returns `false` for unknown runners.
    pub fn update(&self, id: Uuid, status: &RunnerStatus) -> bool {
        match self.lock().get_mut(&id) {
            Some(item) => {
                item.apply(status);
                debug!(
                    runner = %id,
                    state = %status.state,
                    active = status.active_tasks,
                    queued = status.queue_length,
                    "runner status"
                );
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: Uuid) -> Option<RunnerItem> {
        let removed = self.lock().remove(&id);
        if let Some(item) = &removed {
            info!(runner = %id, endpoint = %item.endpoint, "runner removed");
        }
        removed
    }

    pub fn get(&self, id: Uuid) -> Option<RunnerItem> {
        self.lock().get(&id).cloned()
    }

    /// Every runner, oldest registration first.
    pub fn snapshot(&self) -> Vec<RunnerItem> {
        let mut items: Vec<_> = self.lock().values().cloned().collect();
        items.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Best runner for `request` at this instant. Nothing is reserved.
    pub fn select(&self, request: &RunnerRequest) -> Option<RunnerItem> {
        select_runner(self.lock().values(), request).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
