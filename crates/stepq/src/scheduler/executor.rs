//! One task execution
//!
//! Installs a fresh interpreter context around the job's program function
//! and translates its outcome into storage writes and lifecycle events:
//! success and failure are terminal, an interrupt requeues the task with
//! its recorded steps intact. Admission control (task timeout, throttle,
//! rate limit) runs before the program is entered.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::codec::ErrorPayload;
use crate::events::{job_event_key, match_payload, throttle_event_key, LifecycleKind};
use crate::job::Job;
use crate::queue::QueueInner;
use crate::step::{name, JobContext, StepError};
use crate::storage::{StepRow, StepStatus, StoreError, TaskRow, TaskStatus};
use crate::time;

pub(crate) async fn execute(queue: &Arc<QueueInner>, task: TaskRow, steps: Vec<StepRow>) {
    let task_id = task.id;
    if let Err(e) = try_execute(queue, task, steps).await {
        // Storage is unreachable; leave the task `running` and let crash
        // recovery requeue it on the next start.
        error!(queue = %queue.id, %task_id, "task execution bookkeeping failed: {e}");
    }
}

#[instrument(skip(queue, task, steps), fields(queue = %queue.id, job = %task.job, key = %task.key))]
async fn try_execute(
    queue: &Arc<QueueInner>,
    mut task: TaskRow,
    mut steps: Vec<StepRow>,
) -> Result<(), StoreError> {
    let Some(job) = queue.jobs.get(&task.job).cloned() else {
        let payload = ErrorPayload::new(
            "Error",
            format!("no job registered with id {}", task.job),
        );
        let data = serde_json::to_value(&payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if queue
            .storage
            .resolve_task(task.id, TaskStatus::Failed, Some(&data))
            .await?
        {
            record_failure_events(queue, &task, &data, None).await?;
        }
        return Ok(());
    };

    // Durable task-timeout check: an expired task is cancelled, not run.
    if let Some(timeout) = job.config().timeout {
        if task.created_at + timeout.as_secs_f64() <= time::now() {
            let reason = serde_json::json!({ "type": "timeout" });
            if let Some(cancelled) = queue
                .storage
                .cancel_task(&queue.id, &task.job, &task.key, &reason)
                .await?
            {
                queue.settle_cancelled(&cancelled, &reason).await?;
            }
            return Ok(());
        }
    }

    // Start-spacing gate (throttle group or per-job rate limit). A closed
    // gate parks the task on a timer step at the gate-open instant; the
    // pick ordering re-admits group members by priority then FIFO. Only
    // first entries are gated; a resumed task already holds its slot.
    if let Some((group, interval)) = job.config().gate().filter(|_| !task.started) {
        let gate_key = throttle_event_key(&group);
        if let Some(last) = queue.storage.latest_event(&queue.id, &gate_key).await? {
            let gate_open = last.created_at + interval.as_secs_f64();
            if gate_open > time::now() {
                let mut row = steps
                    .iter()
                    .find(|s| s.step == name::THROTTLE)
                    .cloned()
                    .unwrap_or_else(|| StepRow::new(&task, name::THROTTLE));
                row.status = StepStatus::Stalled;
                row.sleep_until = Some(gate_open);
                row.updated_at = time::now();
                queue.storage.record_step(&row).await?;
                queue.storage.requeue_task(task.id).await?;
                debug!(%group, "start gated, parked until gate opens");
                return Ok(());
            }
        }
        let stamp = serde_json::json!({ "job": task.job, "key": task.key });
        queue
            .storage
            .record_event(&queue.id, &gate_key, &stamp, &stamp)
            .await?;
    }

    // Expired admission timers have served their purpose.
    for step in steps.iter_mut() {
        if (step.step == name::THROTTLE || step.step == name::DEBOUNCE)
            && step.status == StepStatus::Stalled
        {
            step.status = StepStatus::Completed;
            step.updated_at = time::now();
            queue.storage.record_step(step).await?;
        }
    }

    if !task.started {
        queue.storage.mark_task_started(task.id).await?;
        task.started = true;
        let payload = match_payload(&task.input, &task.key);
        queue
            .storage
            .record_event(
                &queue.id,
                &job_event_key(&task.job, LifecycleKind::Start),
                &payload,
                &payload,
            )
            .await?;
        job.emit(LifecycleKind::Start, &task.key, Some(task.input.clone()));
    }

    task.runs = queue.storage.record_task_attempt(task.id).await?;

    let token = CancellationToken::new();
    queue.running.lock().insert(task.id, token.clone());
    let ctx = JobContext::new(queue.clone(), job.clone(), task.clone(), steps, token);
    let result = run_program(&job, &ctx, &task).await;
    queue.running.lock().remove(&task.id);
    job.emit(LifecycleKind::Run, &task.key, None);

    match result {
        Ok(output) => {
            if queue
                .storage
                .resolve_task(task.id, TaskStatus::Completed, Some(&output))
                .await?
            {
                let match_data = match_payload(&task.input, &task.key);
                queue
                    .storage
                    .record_event(
                        &queue.id,
                        &job_event_key(&task.job, LifecycleKind::Success),
                        &match_data,
                        &output,
                    )
                    .await?;
                let outcome = serde_json::json!({ "status": "completed", "result": output });
                queue
                    .storage
                    .record_event(
                        &queue.id,
                        &job_event_key(&task.job, LifecycleKind::Settled),
                        &match_data,
                        &outcome,
                    )
                    .await?;
                job.emit(LifecycleKind::Success, &task.key, Some(output));
                job.emit(LifecycleKind::Settled, &task.key, Some(outcome));
            }
        }
        Err(StepError::Interrupt) => {
            queue.storage.requeue_task(task.id).await?;
            debug!("task suspended, requeued");
        }
        Err(error) => {
            let payload = error.to_payload();
            let data = serde_json::to_value(&payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            if queue
                .storage
                .resolve_task(task.id, TaskStatus::Failed, Some(&data))
                .await?
            {
                record_failure_events(queue, &task, &data, Some(&job)).await?;
            }
        }
    }

    // Settlement events may unblock waiting tasks.
    queue.wake();
    Ok(())
}

async fn run_program(job: &Job, ctx: &JobContext, task: &TaskRow) -> Result<Value, StepError> {
    let mut input = task.input.clone();
    if let Some(validator) = &job.config().input {
        input = ctx.parse_step(validator.as_ref(), input).await?;
    }
    let program = job.program();
    let output = program(ctx.clone(), input).await?;
    match &job.config().output {
        Some(validator) => ctx.parse_step(validator.as_ref(), output).await,
        None => Ok(output),
    }
}

async fn record_failure_events(
    queue: &Arc<QueueInner>,
    task: &TaskRow,
    error_data: &Value,
    job: Option<&Job>,
) -> Result<(), StoreError> {
    let match_data = match_payload(&task.input, &task.key);
    queue
        .storage
        .record_event(
            &queue.id,
            &job_event_key(&task.job, LifecycleKind::Error),
            &match_data,
            error_data,
        )
        .await?;
    let outcome = serde_json::json!({ "status": "failed", "error": error_data });
    queue
        .storage
        .record_event(
            &queue.id,
            &job_event_key(&task.job, LifecycleKind::Settled),
            &match_data,
            &outcome,
        )
        .await?;
    if let Some(job) = job {
        job.emit(LifecycleKind::Error, &task.key, Some(error_data.clone()));
        job.emit(LifecycleKind::Settled, &task.key, Some(outcome));
    }
    Ok(())
}
