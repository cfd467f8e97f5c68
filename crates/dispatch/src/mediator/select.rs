//! Runner selection: filter, then rank.

use std::cmp::Ordering;

use crate::messages::{RunnerRequest, RunnerState};

use super::pool::RunnerItem;

/// Pick the best runner for `request`, or `None`.
///
/// Candidates must be `Ready`, match every non-empty filter (platform set,
/// exact label, any shared tag) and have room for one more task. The winner
/// has the most free task slots; ties go to an unlimited queue, then to the
/// shortest queue.
pub fn select_runner<'a, I>(runners: I, request: &RunnerRequest) -> Option<&'a RunnerItem>
where
    I: IntoIterator<Item = &'a RunnerItem>,
{
    runners
        .into_iter()
        .filter(|r| r.state == RunnerState::Ready)
        .filter(|r| request.platforms.is_empty() || request.platforms.contains(&r.platform))
        .filter(|r| match &request.label {
            Some(label) => r.label.as_ref() == Some(label),
            None => true,
        })
        .filter(|r| request.tags.is_empty() || r.tags.iter().any(|t| request.tags.contains(t)))
        .filter(|r| r.has_capacity())
        .min_by(|a, b| rank(a, b))
}

/// `Less` means `a` is the better choice.
fn rank(a: &RunnerItem, b: &RunnerItem) -> Ordering {
    b.free_slots()
        .cmp(&a.free_slots())
        .then_with(|| b.unlimited_queue().cmp(&a.unlimited_queue()))
        .then_with(|| a.queue_length.cmp(&b.queue_length))
        // Keeps the choice stable across HashMap iteration orders.
        .then_with(|| a.registered_at.cmp(&b.registered_at))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn runner(max_tasks: u32, active_tasks: u32, max_queue: i32, queue_length: u32) -> RunnerItem {
        RunnerItem {
            id: Uuid::new_v4(),
            endpoint: format!("runner-{max_tasks}-{active_tasks}"),
            platform: "linux".into(),
            os_version: "6.1".into(),
            max_tasks,
            max_queue,
            label: None,
            tags: Vec::new(),
            state: RunnerState::Ready,
            active_tasks,
            queue_length,
            registered_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn full_runner_without_queue_is_never_selected() {
        let full = runner(2, 2, 0, 0);
        assert!(select_runner([&full], &RunnerRequest::any()).is_none());
    }

    #[test]
    fn most_free_slots_wins() {
        let a = runner(3, 2, 0, 0);
        let b = runner(4, 1, 0, 0);
        let picked = select_runner([&a, &b], &RunnerRequest::any()).unwrap();
        assert_eq!(picked.id, b.id);

        let picked = select_runner([&b, &a], &RunnerRequest::any()).unwrap();
        assert_eq!(picked.id, b.id);
    }

    #[test]
    fn queue_room_breaks_ties() {
        let short = runner(1, 1, 5, 1);
        let long = runner(1, 1, 5, 3);
        let unlimited = runner(1, 1, -1, 9);

        let picked = select_runner([&long, &short], &RunnerRequest::any()).unwrap();
        assert_eq!(picked.id, short.id);

        let picked = select_runner([&long, &short, &unlimited], &RunnerRequest::any()).unwrap();
        assert_eq!(picked.id, unlimited.id);
    }

    #[test]
    fn free_slots_beat_queue_room() {
        let idle = runner(2, 1, 0, 0);
        let unlimited = runner(1, 1, -1, 0);
        let picked = select_runner([&unlimited, &idle], &RunnerRequest::any()).unwrap();
        assert_eq!(picked.id, idle.id);
    }

    #[test]
    fn full_runner_with_queue_room_is_a_candidate() {
        let queued = runner(1, 1, 2, 1);
        assert!(select_runner([&queued], &RunnerRequest::any()).is_some());
        let queue_full = runner(1, 1, 2, 2);
        assert!(select_runner([&queue_full], &RunnerRequest::any()).is_none());
    }

    #[test]
    fn only_ready_runners_are_considered() {
        let mut paused = runner(8, 0, 0, 0);
        paused.state = RunnerState::Paused;
        let mut starting = runner(8, 0, 0, 0);
        starting.state = RunnerState::Starting;
        let mut stopping = runner(8, 0, 0, 0);
        stopping.state = RunnerState::Stopping;
        let ready = runner(1, 0, 0, 0);

        let picked = select_runner([&paused, &starting, &stopping, &ready], &RunnerRequest::any()).unwrap();
        assert_eq!(picked.id, ready.id);
    }

    #[test]
    fn platform_label_and_tag_filters() {
        let mut windows = runner(4, 0, 0, 0);
        windows.platform = "windows".into();
        windows.label = Some("gpu".into());
        windows.tags = vec!["cuda".into(), "big".into()];
        let linux = runner(8, 0, 0, 0);

        let request = RunnerRequest::any().with_platform("windows");
        assert_eq!(select_runner([&windows, &linux], &request).unwrap().id, windows.id);

        let request = RunnerRequest::any().with_label("gpu");
        assert_eq!(select_runner([&windows, &linux], &request).unwrap().id, windows.id);
        let request = RunnerRequest::any().with_label("gp");
        assert!(select_runner([&windows, &linux], &request).is_none());

        let request = RunnerRequest::any().with_tag("small").with_tag("big");
        assert_eq!(select_runner([&windows, &linux], &request).unwrap().id, windows.id);
        let request = RunnerRequest::any().with_tag("small");
        assert!(select_runner([&windows, &linux], &request).is_none());

        let request = RunnerRequest::any().with_platform("macos").with_platform("linux");
        assert_eq!(select_runner([&windows, &linux], &request).unwrap().id, linux.id);
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let none: Vec<RunnerItem> = Vec::new();
        assert!(select_runner(&none, &RunnerRequest::any()).is_none());
    }
}
