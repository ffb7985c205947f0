//! Storage contract tests
//!
//! Every test runs against both backends: the SQLite store and the
//! in-memory store must be behaviorally indistinguishable.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use stepq::time;
use stepq::{
    MemoryStorage, NewTask, SqliteStorage, StepRow, StepStatus, Storage, TaskStatus,
};

async fn with_backends(test: fn(Arc<dyn Storage>) -> BoxFuture<'static, ()>) {
    test(Arc::new(MemoryStorage::new())).await;
    test(Arc::new(
        SqliteStorage::in_memory().await.expect("sqlite store"),
    ))
    .await;
}

fn new_task<'a>(queue: &'a str, job: &'a str, key: &'a str, input: &'a Value) -> NewTask<'a> {
    NewTask {
        queue,
        job,
        key,
        input,
        parent_id: None,
        priority: 0,
        lifo: false,
        delay: None,
    }
}

#[test_log::test(tokio::test)]
async fn test_add_task_dedups_live_key() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({"a": 1});
            let first = store.add_task(new_task("q", "j", "k", &input)).await.unwrap();
            assert!(first.is_some());

            let second = store.add_task(new_task("q", "j", "k", &input)).await.unwrap();
            assert!(second.is_none(), "live key must dedup");

            // A terminal task frees the key for re-dispatch.
            let picked = store.start_next_task("q").await.unwrap().expect("runnable");
            assert!(store
                .resolve_task(picked.task.id, TaskStatus::Completed, Some(&json!(1)))
                .await
                .unwrap());
            let third = store.add_task(new_task("q", "j", "k", &input)).await.unwrap();
            assert!(third.is_some(), "terminal key must be reusable");
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_pick_order_priority_then_fifo() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            for (key, priority) in [("low", 1), ("high", 5), ("mid", 3)] {
                let mut task = new_task("q", "j", key, &input);
                task.priority = priority;
                store.add_task(task).await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }

            let mut picked_keys = Vec::new();
            while let Some(picked) = store.start_next_task("q").await.unwrap() {
                picked_keys.push(picked.task.key.clone());
            }
            assert_eq!(picked_keys, vec!["high", "mid", "low"]);
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_lifo_orders_newest_first() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            for key in ["older", "newer"] {
                let mut task = new_task("q", "j", key, &input);
                task.lifo = true;
                store.add_task(task).await.unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }

            let picked = store.start_next_task("q").await.unwrap().expect("runnable");
            assert_eq!(picked.task.key, "newer");
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_stalled_step_blocks_until_timer() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            let task = store
                .add_task(new_task("q", "j", "k", &input))
                .await
                .unwrap()
                .unwrap();
            let picked = store.start_next_task("q").await.unwrap().expect("runnable");
            assert_eq!(picked.task.id, task.id);

            let mut step = StepRow::new(&task, "system/sleep#0");
            step.status = StepStatus::Stalled;
            step.sleep_until = Some(time::now() + 0.05);
            store.record_step(&step).await.unwrap();
            assert!(store.requeue_task(task.id).await.unwrap());

            // Parked on a timer only: the task reads as stalled.
            let parked = store.get_task_by_id(task.id).await.unwrap().unwrap();
            assert_eq!(parked.status, TaskStatus::Stalled);

            assert!(store.start_next_task("q").await.unwrap().is_none());
            let wake = store.next_future_task("q").await.unwrap().expect("timer");
            assert!(wake > 0.0 && wake <= 0.06, "wake in {wake}s");

            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(store.start_next_task("q").await.unwrap().is_some());
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_waiting_step_matches_events_structurally() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            let task = store
                .add_task(new_task("q", "j", "k", &input))
                .await
                .unwrap()
                .unwrap();

            let mut step = StepRow::new(&task, "system/waitFor#0");
            step.status = StepStatus::Waiting;
            step.wait_for = Some("pipe/p".to_string());
            step.wait_filter = Some(json!({"in": 2, "meta": {}}));
            step.wait_retroactive = Some(false);
            store.record_step(&step).await.unwrap();

            assert!(store.start_next_task("q").await.unwrap().is_none());

            // Leaf mismatch.
            store
                .record_event("q", "pipe/p", &json!({"in": 1, "meta": {"x": 1}}), &json!(1))
                .await
                .unwrap();
            assert!(store.start_next_task("q").await.unwrap().is_none());
            assert!(store.resolve_event(&step).await.unwrap().is_none());

            // Leaf matches but the required object is absent.
            store
                .record_event("q", "pipe/p", &json!({"in": 2}), &json!(2))
                .await
                .unwrap();
            assert!(store.start_next_task("q").await.unwrap().is_none());

            // Full structural match; extra fields are fine.
            store
                .record_event(
                    "q",
                    "pipe/p",
                    &json!({"in": 2, "meta": {"anything": true}, "extra": 9}),
                    &json!({"deliver": 3}),
                )
                .await
                .unwrap();
            let data = store.resolve_event(&step).await.unwrap().expect("match");
            assert_eq!(data, json!({"deliver": 3}));

            let steps = store.list_steps(task.id).await.unwrap();
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].status, StepStatus::Completed);
            assert_eq!(steps[0].data, Some(json!({"deliver": 3})));

            // With the wait satisfied, the task is runnable again.
            assert!(store.start_next_task("q").await.unwrap().is_some());
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_retroactive_flag_gates_old_events() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            store
                .record_event("q", "pipe/p", &json!({"go": true}), &json!("early"))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;

            let task = store
                .add_task(new_task("q", "j", "k", &input))
                .await
                .unwrap()
                .unwrap();

            let mut strict = StepRow::new(&task, "system/waitFor#0");
            strict.status = StepStatus::Waiting;
            strict.wait_for = Some("pipe/p".to_string());
            strict.wait_retroactive = Some(false);
            store.record_step(&strict).await.unwrap();
            assert!(store.resolve_event(&strict).await.unwrap().is_none());

            let mut retro = StepRow::new(&task, "system/waitFor#1");
            retro.status = StepStatus::Waiting;
            retro.wait_for = Some("pipe/p".to_string());
            retro.wait_retroactive = Some(true);
            store.record_step(&retro).await.unwrap();
            assert_eq!(
                store.resolve_event(&retro).await.unwrap(),
                Some(json!("early"))
            );
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_resolve_event_picks_nearest_in_time() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            store
                .record_event("q", "pipe/p", &json!({}), &json!("near"))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;

            let task = store
                .add_task(new_task("q", "j", "k", &input))
                .await
                .unwrap()
                .unwrap();
            let mut step = StepRow::new(&task, "system/waitFor#0");
            step.status = StepStatus::Waiting;
            step.wait_for = Some("pipe/p".to_string());
            step.wait_retroactive = Some(true);
            store.record_step(&step).await.unwrap();

            tokio::time::sleep(Duration::from_millis(60)).await;
            store
                .record_event("q", "pipe/p", &json!({}), &json!("far"))
                .await
                .unwrap();

            // 30ms before creation beats 60ms after.
            assert_eq!(
                store.resolve_event(&step).await.unwrap(),
                Some(json!("near"))
            );
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_wait_timeout_unblocks_pick() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            let task = store
                .add_task(new_task("q", "j", "k", &input))
                .await
                .unwrap()
                .unwrap();

            let mut step = StepRow::new(&task, "system/waitFor#0");
            step.status = StepStatus::Waiting;
            step.wait_for = Some("pipe/p".to_string());
            step.wait_retroactive = Some(false);
            step.sleep_until = Some(time::now() + 0.03);
            store.record_step(&step).await.unwrap();

            assert!(store.start_next_task("q").await.unwrap().is_none());
            let wake = store.next_future_task("q").await.unwrap().expect("timer");
            assert!(wake <= 0.04);

            // The expired timeout makes the task runnable so the
            // interpreter can fail the step.
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(store.start_next_task("q").await.unwrap().is_some());
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_dispatch_delay_plants_timer_step() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            let mut task = new_task("q", "j", "k", &input);
            task.delay = Some(0.05);
            let task = store.add_task(task).await.unwrap().unwrap();

            let steps = store.list_steps(task.id).await.unwrap();
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].step, "system/debounce#0");
            assert_eq!(steps[0].status, StepStatus::Stalled);

            assert!(store.start_next_task("q").await.unwrap().is_none());
            tokio::time::sleep(Duration::from_millis(60)).await;
            assert!(store.start_next_task("q").await.unwrap().is_some());
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_cancel_unstarted_sweep() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            let victim = store
                .add_task(new_task("q", "a", "k1", &input))
                .await
                .unwrap()
                .unwrap();
            let survivor_started = store
                .add_task(new_task("q", "b", "k2", &input))
                .await
                .unwrap()
                .unwrap();
            store.mark_task_started(survivor_started.id).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;

            let cutoff = time::now();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let survivor_newer = store
                .add_task(new_task("q", "a", "k3", &input))
                .await
                .unwrap()
                .unwrap();

            let reason = json!({"type": "debounce"});
            let swept = store
                .cancel_unstarted_tasks(
                    "q",
                    &["a".to_string(), "b".to_string()],
                    cutoff,
                    &reason,
                )
                .await
                .unwrap();
            assert_eq!(swept.len(), 1);
            assert_eq!(swept[0].id, victim.id);
            assert_eq!(swept[0].status, TaskStatus::Cancelled);
            assert_eq!(swept[0].data, Some(reason));

            let started = store.get_task_by_id(survivor_started.id).await.unwrap().unwrap();
            assert_eq!(started.status, TaskStatus::Pending);
            let newer = store.get_task_by_id(survivor_newer.id).await.unwrap().unwrap();
            assert_eq!(newer.status, TaskStatus::Pending);
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_recover_running_tasks() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            let task = store
                .add_task(new_task("q", "j", "k", &input))
                .await
                .unwrap()
                .unwrap();
            let picked = store.start_next_task("q").await.unwrap().expect("runnable");

            let mut step = StepRow::new(&picked.task, "user/work#0");
            step.status = StepStatus::Running;
            step.runs = 1;
            store.record_step(&step).await.unwrap();

            // Simulates a crashed process: the task is stuck running.
            let recovered = store.recover_running_tasks("q").await.unwrap();
            assert_eq!(recovered, 1);

            let task = store.get_task_by_id(task.id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Pending);
            let steps = store.list_steps(task.id).await.unwrap();
            assert_eq!(steps[0].status, StepStatus::Stalled);
            assert_eq!(steps[0].sleep_until, None);

            assert!(store.start_next_task("q").await.unwrap().is_some());
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_resolve_task_respects_cancellation() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            let task = store
                .add_task(new_task("q", "j", "k", &input))
                .await
                .unwrap()
                .unwrap();
            store.start_next_task("q").await.unwrap().expect("runnable");

            let reason = json!({"type": "explicit"});
            let cancelled = store
                .cancel_task("q", "j", "k", &reason)
                .await
                .unwrap()
                .expect("was live");
            assert_eq!(cancelled.status, TaskStatus::Cancelled);

            // The scheduler's terminal write must not clobber it.
            assert!(!store
                .resolve_task(task.id, TaskStatus::Completed, Some(&json!(1)))
                .await
                .unwrap());
            let task = store.get_task_by_id(task.id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Cancelled);
            assert_eq!(task.data, Some(reason));
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_attempt_counter() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            let task = store
                .add_task(new_task("q", "j", "k", &input))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(task.runs, 0);
            assert_eq!(store.record_task_attempt(task.id).await.unwrap(), 1);
            assert_eq!(store.record_task_attempt(task.id).await.unwrap(), 2);
            let task = store.get_task_by_id(task.id).await.unwrap().unwrap();
            assert_eq!(task.runs, 2);
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_latest_event_and_prefix_listing() {
    with_backends(|store| {
        Box::pin(async move {
            store
                .record_event("q", "throttle/g", &json!({"n": 1}), &json!({"n": 1}))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            store
                .record_event("q", "throttle/g", &json!({"n": 2}), &json!({"n": 2}))
                .await
                .unwrap();

            let latest = store.latest_event("q", "throttle/g").await.unwrap().unwrap();
            assert_eq!(latest.input, json!({"n": 2}));

            let listed = store.list_events_by_prefix("q", "throttle/").await.unwrap();
            assert_eq!(listed.len(), 2);
            assert!(listed[0].created_at <= listed[1].created_at);

            assert!(store
                .list_events_by_prefix("q", "job/")
                .await
                .unwrap()
                .is_empty());
        })
    })
    .await;
}

#[test_log::test(tokio::test)]
async fn test_count_running_steps_by_prefix() {
    with_backends(|store| {
        Box::pin(async move {
            let input = json!({});
            let task = store
                .add_task(new_task("q", "j", "k", &input))
                .await
                .unwrap()
                .unwrap();

            let mut a = StepRow::new(&task, "user/fetch#0");
            a.status = StepStatus::Running;
            store.record_step(&a).await.unwrap();
            let mut b = StepRow::new(&task, "user/fetch#1");
            b.status = StepStatus::Completed;
            store.record_step(&b).await.unwrap();
            let mut c = StepRow::new(&task, "user/other#0");
            c.status = StepStatus::Running;
            store.record_step(&c).await.unwrap();

            assert_eq!(store.count_running_steps("q", "user/fetch#").await.unwrap(), 1);
            assert_eq!(store.count_running_steps("q", "user/").await.unwrap(), 2);
            assert_eq!(store.count_running_steps("other", "user/").await.unwrap(), 0);
        })
    })
    .await;
}
