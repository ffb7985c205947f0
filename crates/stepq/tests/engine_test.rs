//! End-to-end engine scenarios
//!
//! The six canonical flows (sleep, memoized loops, filtered waits,
//! throttle with priority, debounce, cross-job cancellation) plus the
//! universal invariants: idempotent dispatch, retry accounting, and
//! restart determinism.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use stepq::prelude::*;
use stepq::{input_key, Queue, StepStatus, TaskStatus};

struct AnyObject;

impl Validator for AnyObject {
    fn parse(&self, value: Value) -> Result<Value, ValidationError> {
        if value.is_object() {
            Ok(value)
        } else {
            Err(ValidationError::new("expected an object"))
        }
    }
}

async fn memory_queue(jobs: Vec<Job>) -> (Queue, Arc<MemoryStorage>) {
    let store = Arc::new(MemoryStorage::new());
    let mut builder = Queue::builder("test").storage(store.clone());
    for job in jobs {
        builder = builder.job(job);
    }
    let queue = builder.build().expect("queue should build");
    queue.start().await.expect("queue should start");
    (queue, store)
}

#[tokio::test]
async fn test_sleep_suspends_and_resumes() {
    let aaa = Job::new(JobConfig::new("aaa"), |ctx, _input| async move {
        ctx.sleep(Duration::from_millis(100)).await?;
        Ok(json!({}))
    });
    let (queue, store) = memory_queue(vec![aaa.clone()]).await;
    let mut events = aaa.events();

    let started = Instant::now();
    let out = aaa.invoke(json!({})).await.expect("invoke should resolve");
    assert_eq!(out, json!({}));
    assert!(started.elapsed() >= Duration::from_millis(95));

    // Exactly two program entries: before the sleep and after it.
    let mut run_events = 0;
    while let Ok(event) = events.try_recv() {
        if event.kind == LifecycleKind::Run {
            run_events += 1;
        }
    }
    assert_eq!(run_events, 2);

    let task = store
        .get_task("test", "aaa", &input_key(&json!({})))
        .await
        .unwrap()
        .expect("task exists");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.runs, 2);

    let steps = store.list_steps(task.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].step, "system/sleep#0");
    assert_eq!(steps[0].status, StepStatus::Completed);

    queue.close().await;
}

#[tokio::test]
async fn test_loop_memoization_with_validators() {
    let aaa = Job::new(
        JobConfig::new("aaa")
            .with_input(Arc::new(AnyObject))
            .with_output(Arc::new(AnyObject)),
        |ctx, input| async move {
            let mut n = input["a"].as_i64().expect("numeric input");
            for _ in 0..10 {
                let current = n;
                n = ctx
                    .run("add-one", move |_| async move { Ok(current + 1) })
                    .await?;
            }
            Ok(json!({ "b": n }))
        },
    );
    let (queue, store) = memory_queue(vec![aaa.clone()]).await;

    let out = aaa
        .invoke(json!({"a": 1}))
        .await
        .expect("invoke should resolve");
    assert_eq!(out, json!({"b": 11}));

    let task = store
        .get_task("test", "aaa", &input_key(&json!({"a": 1})))
        .await
        .unwrap()
        .unwrap();
    let steps = store.list_steps(task.id).await.unwrap();
    assert_eq!(steps.len(), 12, "input parse + output parse + 10 run steps");
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

    let names: Vec<&str> = steps.iter().map(|s| s.step.as_str()).collect();
    assert!(names.contains(&"system/parse#0"));
    assert!(names.contains(&"system/parse#1"));
    for i in 0..10 {
        let name = format!("user/add-one#{i}");
        assert!(names.contains(&name.as_str()), "missing {name}");
    }

    // Each callback ran exactly once to success.
    assert!(steps
        .iter()
        .filter(|s| s.step.starts_with("user/"))
        .all(|s| s.runs == 1));

    queue.close().await;
}

#[tokio::test]
async fn test_wait_for_pipe_with_filter() {
    let pipe = Pipe::new(PipeConfig::new("numbers"));
    let program_pipe = pipe.clone();
    let aaa = Job::new(JobConfig::new("aaa"), move |ctx, input| {
        let pipe = program_pipe.clone();
        async move {
            let inner: i64 = input["in"]
                .as_str()
                .unwrap_or_default()
                .parse()
                .unwrap_or_default();
            let data = ctx
                .wait_for(
                    WaitTarget::Pipe(&pipe),
                    WaitOptions::new().with_filter(json!({"in": 2})),
                )
                .await?;
            let got = data["in"].as_i64().unwrap_or_default();
            Ok(json!({ "foo": inner + got }))
        }
    });

    let store = Arc::new(MemoryStorage::new());
    let queue = Queue::builder("test")
        .storage(store.clone())
        .job(aaa.clone())
        .pipe(pipe.clone())
        .build()
        .unwrap();
    queue.start().await.unwrap();

    let waiting = tokio::spawn({
        let aaa = aaa.clone();
        async move { aaa.invoke(json!({"in": "1"})).await }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    // A non-matching payload must not wake the waiter.
    pipe.dispatch(json!({"in": 1})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiting.is_finished());

    pipe.dispatch(json!({"in": 2})).await.unwrap();
    let out = waiting.await.unwrap().expect("invoke should resolve");
    assert_eq!(out, json!({"foo": 3}));

    queue.close().await;
}

#[tokio::test]
async fn test_throttle_priority_and_spacing() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let starts = Arc::new(Mutex::new(Vec::<f64>::new()));

    let make = |id: &str, priority: i64| {
        let order = order.clone();
        let starts = starts.clone();
        Job::new(
            JobConfig::new(id)
                .with_priority(move |_| priority)
                .with_throttle(Throttle::per("g", "100/s").unwrap()),
            move |_ctx, input| {
                let order = order.clone();
                let starts = starts.clone();
                async move {
                    starts.lock().push(stepq::time::now());
                    order
                        .lock()
                        .push(input["label"].as_str().unwrap_or("?").to_string());
                    Ok(json!({}))
                }
            },
        )
    };
    let a = make("a", 1);
    let b = make("b", 2);

    let store = Arc::new(MemoryStorage::new());
    let queue = Queue::builder("test")
        .storage(store.clone())
        .job(a.clone())
        .job(b.clone())
        .build()
        .unwrap();

    // Dispatch before starting the scheduler so admission is decided
    // purely by priority and creation order.
    let a1 = a.dispatch(json!({"label": "a1"})).await.unwrap();
    let a2 = a.dispatch(json!({"label": "a2"})).await.unwrap();
    let b1 = b.dispatch(json!({"label": "b1"})).await.unwrap();
    queue.start().await.unwrap();

    for (job, key) in [(&b, &b1), (&a, &a1), (&a, &a2)] {
        wait_terminal(store.as_ref(), "test", job.id(), key).await;
    }

    assert_eq!(*order.lock(), vec!["b1", "a1", "a2"]);

    // 100/s means at least 10 ms start-to-start within the group.
    let starts = starts.lock().clone();
    assert!(starts[1] - starts[0] >= 0.008, "gap {}", starts[1] - starts[0]);
    assert!(starts[2] - starts[1] >= 0.008, "gap {}", starts[2] - starts[1]);

    queue.close().await;
}

#[tokio::test]
async fn test_debounce_cancels_older_dispatches() {
    let make = |id: &str| {
        Job::new(
            JobConfig::new(id).with_debounce(Debounce::per("g", "20/s").unwrap()),
            |_ctx, _input| async move { Ok(json!({"done": true})) },
        )
    };
    let a = make("a");
    let b = make("b");
    let (queue, _store) = memory_queue(vec![a.clone(), b.clone()]).await;

    let invoke = |job: &Job, n: i64| {
        let job = job.clone();
        tokio::spawn(async move { job.invoke(json!({"n": n})).await })
    };

    let a1 = invoke(&a, 1);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let a2 = invoke(&a, 2);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let b1 = invoke(&b, 1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let b2 = invoke(&b, 2);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let a3 = invoke(&a, 3);

    for superseded in [a1, a2, b1, b2] {
        match superseded.await.unwrap() {
            Err(InvokeError::Cancelled(reason)) => assert_eq!(reason["type"], "debounce"),
            other => panic!("expected debounce cancellation, got {other:?}"),
        }
    }
    let out = a3.await.unwrap().expect("last dispatch wins");
    assert_eq!(out, json!({"done": true}));

    queue.close().await;
}

#[tokio::test]
async fn test_explicit_cross_job_cancellation() {
    let done = Arc::new(AtomicBool::new(false));
    let aaa = {
        let done = done.clone();
        Job::new(JobConfig::new("aaa"), move |ctx, _input| {
            let done = done.clone();
            async move {
                ctx.sleep(Duration::from_millis(100)).await?;
                done.store(true, Ordering::SeqCst);
                Ok(json!({}))
            }
        })
    };
    let bbb = {
        let aaa = aaa.clone();
        Job::new(JobConfig::new("bbb"), move |ctx, _input| {
            let aaa = aaa.clone();
            async move {
                ctx.cancel_job(&aaa, &json!({}), json!({"type": "explicit"}))
                    .await?;
                Ok(json!({}))
            }
        })
    };
    let (queue, store) = memory_queue(vec![aaa.clone(), bbb.clone()]).await;

    let waiting = tokio::spawn({
        let aaa = aaa.clone();
        async move { aaa.invoke(json!({})).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    bbb.invoke(json!({})).await.expect("bbb should complete");

    match waiting.await.unwrap() {
        Err(InvokeError::Cancelled(reason)) => assert_eq!(reason["type"], "explicit"),
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert!(!done.load(Ordering::SeqCst), "aaa must not resume past its sleep");

    let task = store
        .get_task("test", "aaa", &input_key(&json!({})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    queue.close().await;
}

#[tokio::test]
async fn test_dispatch_is_idempotent_while_live() {
    let aaa = Job::new(JobConfig::new("aaa"), |ctx, _input| async move {
        ctx.sleep(Duration::from_millis(30)).await?;
        Ok(json!({}))
    });
    let store = Arc::new(MemoryStorage::new());
    let queue = Queue::builder("test")
        .storage(store.clone())
        .job(aaa.clone())
        .build()
        .unwrap();

    for _ in 0..5 {
        aaa.dispatch(json!({"x": 1})).await.unwrap();
    }
    assert_eq!(store.list_tasks(Some("test"), "aaa").await.unwrap().len(), 1);

    queue.start().await.unwrap();
    aaa.invoke(json!({"x": 1})).await.expect("task completes");

    // The key is only live while the task is unresolved.
    aaa.dispatch(json!({"x": 1})).await.unwrap();
    assert_eq!(store.list_tasks(Some("test"), "aaa").await.unwrap().len(), 2);

    queue.close().await;
}

#[tokio::test]
async fn test_run_retries_with_backoff_then_succeeds() {
    let attempts = Arc::new(AtomicU32::new(0));
    let aaa = {
        let attempts = attempts.clone();
        Job::new(JobConfig::new("aaa"), move |ctx, _input| {
            let attempts = attempts.clone();
            async move {
                let n = ctx
                    .run_with(
                        RunOptions::new("flaky")
                            .with_retry(RetryPolicy::fixed(Duration::from_millis(10), 3)),
                        move |_| async move {
                            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                            if attempt < 3 {
                                Err(anyhow::anyhow!("transient failure {attempt}"))
                            } else {
                                Ok(attempt)
                            }
                        },
                    )
                    .await?;
                Ok(json!({ "attempts": n }))
            }
        })
    };
    let (queue, store) = memory_queue(vec![aaa.clone()]).await;

    let out = aaa.invoke(json!({})).await.expect("third attempt succeeds");
    assert_eq!(out, json!({"attempts": 3}));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let task = store
        .get_task("test", "aaa", &input_key(&json!({})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.runs, 3, "one program entry per attempt");
    let steps = store.list_steps(task.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].runs, 3);
    assert_eq!(steps[0].status, StepStatus::Completed);

    queue.close().await;
}

#[tokio::test]
async fn test_non_recoverable_bypasses_retry() {
    let attempts = Arc::new(AtomicU32::new(0));
    let aaa = {
        let attempts = attempts.clone();
        Job::new(
            JobConfig::new("aaa")
                .with_retry(RetryPolicy::fixed(Duration::from_millis(5), 5)),
            move |ctx, _input| {
                let attempts = attempts.clone();
                async move {
                    ctx.run("doomed", move |_| async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<Value, _>(NonRecoverable::new("card declined").into())
                    })
                    .await?;
                    Ok(json!({}))
                }
            },
        )
    };
    let (queue, store) = memory_queue(vec![aaa.clone()]).await;

    match aaa.invoke(json!({})).await {
        Err(InvokeError::Failed(error)) => assert_eq!(error.message, "card declined"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1, "no retries");

    let task = store
        .get_task("test", "aaa", &input_key(&json!({})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    queue.close().await;
}

#[tokio::test]
async fn test_restart_resumes_mid_task_deterministically() {
    let store = Arc::new(MemoryStorage::new());
    let build = |store: Arc<MemoryStorage>| {
        let job = Job::new(JobConfig::new("steps"), |ctx, _input| async move {
            let a: i64 = ctx.run("first", |_| async { Ok(7) }).await?;
            ctx.sleep(Duration::from_millis(80)).await?;
            let b: i64 = ctx.run("second", move |_| async move { Ok(a + 1) }).await?;
            Ok(json!({ "sum": b }))
        });
        let queue = Queue::builder("test")
            .storage(store)
            .job(job.clone())
            .build()
            .unwrap();
        (queue, job)
    };

    let (first_process, job) = build(store.clone());
    first_process.start().await.unwrap();
    job.dispatch(json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    // "first" has run, the task is parked in its sleep. Shut down here.
    first_process.close().await;

    let (second_process, job) = build(store.clone());
    second_process.start().await.unwrap();
    let out = job.invoke(json!({})).await.expect("resumes to completion");
    assert_eq!(out, json!({"sum": 8}));

    let task = store
        .get_task("test", "steps", &input_key(&json!({})))
        .await
        .unwrap()
        .unwrap();
    let steps = store.list_steps(task.id).await.unwrap();
    let first = steps.iter().find(|s| s.step == "user/first#0").unwrap();
    assert_eq!(first.runs, 1, "memoized across the restart");
    let second = steps.iter().find(|s| s.step == "user/second#0").unwrap();
    assert_eq!(second.status, StepStatus::Completed);

    second_process.close().await;
}

#[tokio::test]
async fn test_invoke_between_jobs() {
    let child = Job::new(JobConfig::new("child"), |_ctx, input| async move {
        let n = input["n"].as_i64().unwrap_or_default();
        Ok(json!({ "doubled": n * 2 }))
    });
    let parent = {
        let child = child.clone();
        Job::new(JobConfig::new("parent"), move |ctx, input| {
            let child = child.clone();
            async move {
                let out = ctx.invoke(&child, json!({"n": input["n"]})).await?;
                Ok(json!({ "result": out["doubled"] }))
            }
        })
    };
    let (queue, store) = memory_queue(vec![parent.clone(), child.clone()]).await;

    let out = parent.invoke(json!({"n": 21})).await.expect("chain resolves");
    assert_eq!(out, json!({"result": 42}));

    // The child task is linked to its parent.
    let parent_task = store
        .get_task("test", "parent", &input_key(&json!({"n": 21})))
        .await
        .unwrap()
        .unwrap();
    let child_task = store
        .get_task("test", "child", &input_key(&json!({"n": 21})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child_task.parent_id, Some(parent_task.id));

    queue.close().await;
}

#[tokio::test]
async fn test_sqlite_end_to_end() {
    let pipe = Pipe::new(PipeConfig::new("approvals"));
    let program_pipe = pipe.clone();
    let job = Job::new(JobConfig::new("order"), move |ctx, input| {
        let pipe = program_pipe.clone();
        async move {
            let n = input["n"].as_i64().unwrap_or_default();
            let doubled: i64 = ctx.run("double", move |_| async move { Ok(n * 2) }).await?;
            ctx.sleep(Duration::from_millis(20)).await?;
            let approval = ctx
                .wait_for(
                    WaitTarget::Pipe(&pipe),
                    WaitOptions::new().with_filter(json!({"ok": true})),
                )
                .await?;
            let add = approval["add"].as_i64().unwrap_or_default();
            Ok(json!({ "out": doubled + add }))
        }
    });

    let store = Arc::new(SqliteStorage::in_memory().await.expect("sqlite store"));
    let queue = Queue::builder("test")
        .storage(store.clone())
        .job(job.clone())
        .pipe(pipe.clone())
        .build()
        .unwrap();
    queue.start().await.unwrap();

    let waiting = tokio::spawn({
        let job = job.clone();
        async move { job.invoke(json!({"n": 5})).await }
    });
    tokio::time::sleep(Duration::from_millis(60)).await;

    pipe.dispatch(json!({"ok": false, "add": 100})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiting.is_finished(), "filter must reject ok=false");

    pipe.dispatch(json!({"ok": true, "add": 1})).await.unwrap();
    let out = waiting.await.unwrap().expect("invoke should resolve");
    assert_eq!(out, json!({"out": 11}));

    let task = store
        .get_task("test", "order", &input_key(&json!({"n": 5})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let steps = store.list_steps(task.id).await.unwrap();
    let names: Vec<&str> = steps.iter().map(|s| s.step.as_str()).collect();
    assert_eq!(
        names,
        vec!["user/double#0", "system/sleep#0", "system/waitFor#0"]
    );
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

    queue.close().await;
}

#[tokio::test]
async fn test_rate_limit_spaces_starts_newest_first() {
    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let starts = Arc::new(Mutex::new(Vec::<f64>::new()));
    let job = {
        let order = order.clone();
        let starts = starts.clone();
        Job::new(
            JobConfig::new("a").with_rate_limit(RateLimit::per("100/s").unwrap()),
            move |_ctx, input| {
                let order = order.clone();
                let starts = starts.clone();
                async move {
                    starts.lock().push(stepq::time::now());
                    order
                        .lock()
                        .push(input["label"].as_str().unwrap_or("?").to_string());
                    Ok(json!({}))
                }
            },
        )
    };
    let store = Arc::new(MemoryStorage::new());
    let queue = Queue::builder("test")
        .storage(store.clone())
        .job(job.clone())
        .build()
        .unwrap();

    let n1 = job.dispatch(json!({"label": "n1"})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(3)).await;
    let n2 = job.dispatch(json!({"label": "n2"})).await.unwrap();
    queue.start().await.unwrap();

    wait_terminal(store.as_ref(), "test", "a", &n1).await;
    wait_terminal(store.as_ref(), "test", "a", &n2).await;

    // Newest-wins admission, then the spacing gate.
    assert_eq!(*order.lock(), vec!["n2", "n1"]);
    let starts = starts.lock().clone();
    assert!(starts[1] - starts[0] >= 0.008, "gap {}", starts[1] - starts[0]);

    queue.close().await;
}

#[tokio::test]
async fn test_task_timeout_cancels_with_reason() {
    let aaa = Job::new(
        JobConfig::new("aaa").with_timeout(Duration::from_millis(40)),
        |ctx, _input| async move {
            ctx.sleep(Duration::from_millis(500)).await?;
            Ok(json!({}))
        },
    );
    let (queue, store) = memory_queue(vec![aaa.clone()]).await;

    match aaa.invoke(json!({})).await {
        Err(InvokeError::Cancelled(reason)) => assert_eq!(reason["type"], "timeout"),
        other => panic!("expected timeout cancellation, got {other:?}"),
    }
    let task = store
        .get_task("test", "aaa", &input_key(&json!({})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);

    queue.close().await;
}

#[tokio::test]
async fn test_wait_for_timeout_fails_step() {
    let pipe = Pipe::new(PipeConfig::new("silent"));
    let program_pipe = pipe.clone();
    let aaa = Job::new(JobConfig::new("aaa"), move |ctx, _input| {
        let pipe = program_pipe.clone();
        async move {
            let data = ctx
                .wait_for(
                    WaitTarget::Pipe(&pipe),
                    WaitOptions::new().with_timeout(Duration::from_millis(30)),
                )
                .await?;
            Ok(data)
        }
    });
    let store = Arc::new(MemoryStorage::new());
    let queue = Queue::builder("test")
        .storage(store.clone())
        .job(aaa.clone())
        .pipe(pipe)
        .build()
        .unwrap();
    queue.start().await.unwrap();

    match aaa.invoke(json!({})).await {
        Err(InvokeError::Failed(error)) => assert_eq!(error.name, "TimeoutError"),
        other => panic!("expected timeout failure, got {other:?}"),
    }

    let task = store
        .get_task("test", "aaa", &input_key(&json!({})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let steps = store.list_steps(task.id).await.unwrap();
    assert_eq!(steps[0].step, "system/waitFor#0");
    assert_eq!(steps[0].status, StepStatus::Failed);

    queue.close().await;
}

#[tokio::test]
async fn test_concurrency_gate_defers_admission() {
    use stepq::{NewTask, StepRow};

    let store = Arc::new(MemoryStorage::new());

    // A step of some other task is already holding the gate.
    let holder = store
        .add_task(NewTask {
            queue: "test",
            job: "other",
            key: "held",
            input: &json!({}),
            parent_id: None,
            priority: 0,
            lifo: false,
            delay: None,
        })
        .await
        .unwrap()
        .unwrap();
    let mut held_step = StepRow::new(&holder, "user/slow#0");
    held_step.status = StepStatus::Running;
    held_step.runs = 1;
    store.record_step(&held_step).await.unwrap();

    let aaa = Job::new(JobConfig::new("aaa"), |ctx, _input| async move {
        let n: i64 = ctx
            .run_with(
                RunOptions::new("slow").with_concurrency(
                    Concurrency::new("slow", 1).with_delay(Duration::from_millis(20)),
                ),
                |_| async { Ok(1) },
            )
            .await?;
        Ok(json!({ "n": n }))
    });
    let queue = Queue::builder("test")
        .storage(store.clone())
        .job(aaa.clone())
        .build()
        .unwrap();
    queue.start().await.unwrap();

    let waiting = tokio::spawn({
        let aaa = aaa.clone();
        async move { aaa.invoke(json!({})).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished(), "gate must hold while a step runs");

    // Release the gate (and retire the foreign task so nothing picks it).
    store
        .cancel_task("test", "other", "held", &json!({"type": "explicit"}))
        .await
        .unwrap();
    held_step.status = StepStatus::Completed;
    store.record_step(&held_step).await.unwrap();

    let out = waiting.await.unwrap().expect("admitted after release");
    assert_eq!(out, json!({"n": 1}));

    queue.close().await;
}

#[tokio::test]
async fn test_detach_runs_on_blocking_worker() {
    let aaa = Job::new(JobConfig::new("aaa"), |ctx, _input| async move {
        let sum: i64 = ctx
            .detach(|_token| Ok::<_, anyhow::Error>((1..=10).sum::<i64>()))
            .await?;
        Ok(json!({ "sum": sum }))
    });
    let (queue, store) = memory_queue(vec![aaa.clone()]).await;

    let out = aaa.invoke(json!({})).await.expect("detached work resolves");
    assert_eq!(out, json!({"sum": 55}));

    let task = store
        .get_task("test", "aaa", &input_key(&json!({})))
        .await
        .unwrap()
        .unwrap();
    let steps = store.list_steps(task.id).await.unwrap();
    assert_eq!(steps[0].step, "system/detach#0");
    assert_eq!(steps[0].status, StepStatus::Completed);

    queue.close().await;
}

#[tokio::test]
async fn test_pipe_dispatch_inside_job_is_memoized() {
    let pipe = Pipe::new(PipeConfig::new("out"));
    let program_pipe = pipe.clone();
    let aaa = Job::new(JobConfig::new("aaa"), move |ctx, _input| {
        let pipe = program_pipe.clone();
        async move {
            ctx.dispatch_pipe(&pipe, json!({"ping": true})).await?;
            // Forces a second program entry after the dispatch.
            ctx.sleep(Duration::from_millis(30)).await?;
            Ok(json!({}))
        }
    });
    let store = Arc::new(MemoryStorage::new());
    let queue = Queue::builder("test")
        .storage(store.clone())
        .job(aaa.clone())
        .pipe(pipe)
        .build()
        .unwrap();
    queue.start().await.unwrap();

    aaa.invoke(json!({})).await.expect("job completes");

    let task = store
        .get_task("test", "aaa", &input_key(&json!({})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.runs, 2, "two entries around the sleep");
    let events = store.list_events_by_prefix("test", "pipe/out").await.unwrap();
    assert_eq!(events.len(), 1, "memoized dispatch must not repeat");

    queue.close().await;
}

async fn wait_terminal(store: &dyn Storage, queue: &str, job: &str, key: &str) -> TaskStatus {
    for _ in 0..200 {
        if let Some(task) = store.get_task(queue, job, key).await.unwrap() {
            if task.status.is_terminal() {
                return task.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {job}/{key} never settled");
}
