//! Job: a named, typed, retryable unit of work
//!
//! A job couples a configuration with an async program function. The
//! program receives a [`JobContext`](crate::JobContext) and talks to the
//! engine exclusively through it; everything else is ordinary async Rust.
//!
//! Dispatching upserts a task keyed by the hash of the canonical input, so
//! concurrent dispatches of the same input collapse into one task while it
//! is live. `invoke` is dispatch plus awaiting the settled outcome.

mod config;
mod retry;

pub use config::{Debounce, JobConfig, LifecycleHook, PriorityFn, RateLimit, Throttle};
pub use retry::RetryPolicy;

use std::sync::{Arc, OnceLock, Weak};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::{input_key, ErrorPayload};
use crate::error::{EngineError, InvokeError};
use crate::events::{LifecycleEvent, LifecycleKind};
use crate::queue::QueueInner;
use crate::step::{JobContext, StepError};
use crate::storage::{NewTask, TaskRow, TaskStatus};
use crate::time;

/// The program function: async, driven by the step interpreter.
pub(crate) type ProgramFn =
    Arc<dyn Fn(JobContext, Value) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;

pub(crate) struct JobInner {
    config: JobConfig,
    program: ProgramFn,
    queue: OnceLock<Weak<QueueInner>>,
    emitter: broadcast::Sender<LifecycleEvent>,
}

/// A named unit of work whose body is a program function using the step
/// interpreter
///
/// # Example
///
/// ```ignore
/// let resize = Job::new(JobConfig::new("resize"), |ctx, input| async move {
///     let thumb = ctx
///         .run("scale", |_| async { scale(&input).await })
///         .await?;
///     ctx.sleep(Duration::from_secs(1)).await?;
///     Ok(thumb)
/// });
/// ```
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    pub fn new<F, Fut>(config: JobConfig, program: F) -> Self
    where
        F: Fn(JobContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        let (emitter, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(JobInner {
                config,
                program: Arc::new(move |ctx, input| Box::pin(program(ctx, input))),
                queue: OnceLock::new(),
                emitter,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// Subscribe to this job's lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.emitter.subscribe()
    }

    /// The task key a given input dispatches under.
    pub fn key_of(&self, input: &Value) -> String {
        input_key(input)
    }

    /// Upsert a task for this input; returns its key.
    ///
    /// A second dispatch with identical input is a no-op while the earlier
    /// task is unresolved; once that task settles, the key is free again.
    pub async fn dispatch(&self, input: Value) -> Result<String, EngineError> {
        self.dispatch_from(input, None).await
    }

    /// Dispatch, then await the settled outcome of the task.
    pub async fn invoke(&self, input: Value) -> Result<Value, InvokeError> {
        // Subscribe before dispatching so a fast settlement cannot race
        // past the receiver.
        let mut events = self.inner.emitter.subscribe();
        let key = self.dispatch(input).await?;

        loop {
            match events.recv().await {
                Ok(event) if event.kind == LifecycleKind::Settled && event.key == key => {
                    return settled_outcome(event.payload.as_ref().unwrap_or(&Value::Null));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(job = %self.id(), skipped, "invoke receiver lagged, checking storage");
                    let queue = self.queue()?;
                    let task = queue
                        .storage
                        .get_task(&queue.id, self.id(), &key)
                        .await
                        .map_err(EngineError::from)?;
                    if let Some(task) = task {
                        if task.status.is_terminal() {
                            return task_outcome(&task);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(InvokeError::Closed),
            }
        }
    }

    /// Cancel the live task for this input, storing the reason.
    pub async fn cancel(&self, input: &Value, reason: Value) -> Result<bool, EngineError> {
        self.cancel_key(&input_key(input), &reason).await
    }

    /// Cancel the live task with this key.
    pub(crate) async fn cancel_key(&self, key: &str, reason: &Value) -> Result<bool, EngineError> {
        let queue = self.queue()?;
        let Some(task) = queue
            .storage
            .cancel_task(&queue.id, self.id(), key, reason)
            .await?
        else {
            return Ok(false);
        };
        debug!(job = %self.id(), key, "cancelled task");
        queue.settle_cancelled(&task, reason).await?;
        Ok(true)
    }

    pub(crate) async fn dispatch_from(
        &self,
        input: Value,
        parent_id: Option<Uuid>,
    ) -> Result<String, EngineError> {
        let queue = self.queue()?;
        let key = input_key(&input);
        let config = &self.inner.config;

        // Debounce: each dispatch supersedes older, not-yet-started tasks
        // in its group and defers itself by the debounce interval.
        if let Some(debounce) = &config.debounce {
            let group = queue.debounce_group(&debounce.id);
            let reason = serde_json::json!({ "type": "debounce" });
            let swept = queue
                .storage
                .cancel_unstarted_tasks(&queue.id, &group, time::now(), &reason)
                .await?;
            for task in &swept {
                queue.settle_cancelled(task, &reason).await?;
            }
        }

        let priority = config.priority.as_ref().map(|f| f(&input)).unwrap_or(0);
        let inserted = queue
            .storage
            .add_task(NewTask {
                queue: &queue.id,
                job: self.id(),
                key: &key,
                input: &input,
                parent_id,
                priority,
                lifo: config.rate_limit.is_some(),
                delay: config.debounce.as_ref().map(|d| d.interval.as_secs_f64()),
            })
            .await?;

        if let Some(task) = &inserted {
            debug!(job = %self.id(), key = %task.key, "dispatched task");
            if let Some(timeout) = config.timeout {
                self.spawn_timeout(task.id, task.key.clone(), timeout);
            }
        }
        self.emit(LifecycleKind::Trigger, &key, Some(input));
        queue.wake();
        Ok(key)
    }

    /// Arm the task-wide timeout. The pick-time check in the scheduler is
    /// the durable backstop; this timer makes expiry prompt while the
    /// process lives.
    fn spawn_timeout(&self, task_id: Uuid, key: String, timeout: std::time::Duration) {
        let job = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Ok(queue) = job.queue() else { return };
            match queue.storage.get_task_by_id(task_id).await {
                Ok(Some(task)) if !task.status.is_terminal() => {
                    let reason = serde_json::json!({ "type": "timeout" });
                    if let Err(e) = job.cancel_key(&key, &reason).await {
                        warn!(job = %job.id(), %key, "task timeout cancellation failed: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(job = %job.id(), %key, "task timeout check failed: {e}"),
            }
        });
    }

    pub(crate) fn emit(&self, kind: LifecycleKind, key: &str, payload: Option<Value>) {
        let event = LifecycleEvent {
            job: self.id().to_string(),
            key: key.to_string(),
            kind,
            payload,
        };
        let hook = match kind {
            LifecycleKind::Start => &self.inner.config.on_start,
            LifecycleKind::Settled => &self.inner.config.on_settled,
            LifecycleKind::Cancel => &self.inner.config.on_cancel,
            LifecycleKind::Success => &self.inner.config.on_success,
            LifecycleKind::Error => &self.inner.config.on_error,
            _ => &None,
        };
        if let Some(hook) = hook {
            hook(&event);
        }
        let _ = self.inner.emitter.send(event);
    }

    pub(crate) fn config(&self) -> &JobConfig {
        &self.inner.config
    }

    pub(crate) fn program(&self) -> ProgramFn {
        self.inner.program.clone()
    }

    pub(crate) fn bind(&self, queue: Weak<QueueInner>) -> Result<(), EngineError> {
        self.inner
            .queue
            .set(queue)
            .map_err(|_| EngineError::AlreadyBound(format!("job {}", self.id())))
    }

    pub(crate) fn queue(&self) -> Result<Arc<QueueInner>, EngineError> {
        self.inner
            .queue
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| EngineError::Unbound(format!("job {}", self.id())))
    }
}

/// Translate a settled event payload into the caller-facing outcome.
fn settled_outcome(data: &Value) -> Result<Value, InvokeError> {
    match data.get("status").and_then(Value::as_str) {
        Some("completed") => Ok(data.get("result").cloned().unwrap_or(Value::Null)),
        Some("failed") => Err(InvokeError::Failed(ErrorPayload::hydrate(
            data.get("error").unwrap_or(&Value::Null),
        ))),
        Some("cancelled") => Err(InvokeError::Cancelled(
            data.get("reason").cloned().unwrap_or(Value::Null),
        )),
        _ => Err(InvokeError::Failed(ErrorPayload::new(
            "Error",
            format!("malformed settled payload: {data}"),
        ))),
    }
}

/// Translate a terminal task row into the caller-facing outcome.
fn task_outcome(task: &TaskRow) -> Result<Value, InvokeError> {
    match task.status {
        TaskStatus::Completed => Ok(task.data.clone().unwrap_or(Value::Null)),
        TaskStatus::Failed => Err(InvokeError::Failed(ErrorPayload::hydrate(
            task.data.as_ref().unwrap_or(&Value::Null),
        ))),
        TaskStatus::Cancelled => Err(InvokeError::Cancelled(
            task.data.clone().unwrap_or(Value::Null),
        )),
        _ => Err(InvokeError::Failed(ErrorPayload::new(
            "Error",
            "task is not terminal",
        ))),
    }
}
