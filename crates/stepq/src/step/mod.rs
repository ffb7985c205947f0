//! Step interpreter
//!
//! A [`JobContext`] is handed to every program function and is its only
//! channel to the engine. Each operation maps to a memoized step row:
//! the first encounter performs the effect; later encounters (on task
//! re-runs) replay the stored outcome. An operation that cannot resolve
//! yet returns [`StepError::Interrupt`], which unwinds the program through
//! ordinary `?` propagation and hands control back to the scheduler —
//! user code must forward errors it does not understand.
//!
//! Ordinals make the scheme deterministic: within one execution attempt,
//! the Nth call sharing a base name addresses step `<base>#<N>`, so a
//! program that is deterministic in its step sequence always lines up
//! with the rows it wrote on earlier attempts.

pub(crate) mod name;
mod options;

pub use options::{Concurrency, RunOptions, WaitOptions, WaitTarget};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::codec::ErrorPayload;
use crate::error::{EngineError, NonRecoverable};
use crate::events::LifecycleKind;
use crate::job::{Job, RetryPolicy};
use crate::pipe::Pipe;
use crate::queue::QueueInner;
use crate::storage::{StepRow, StepStatus, StoreError, TaskRow};
use crate::time;
use crate::validation::Validator;

/// Outcome of an interpreter operation
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// Not an error: the step cannot resolve yet and the task must yield
    /// back to the scheduler. Propagate it.
    #[error("step interrupted")]
    Interrupt,

    /// A user callback failed terminally; carries the stored error
    #[error("{0}")]
    Failed(ErrorPayload),

    /// A step timed out (run attempt deadline or wait_for timeout)
    #[error("{0}")]
    Timeout(ErrorPayload),

    /// An invoked task was cancelled; carries the stored reason
    #[error("invoked task cancelled: {0}")]
    Cancelled(Value),

    /// Input or output validation failed
    #[error("{0}")]
    Validation(ErrorPayload),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StepError {
    /// Whether this is the suspension sentinel rather than a failure.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupt)
    }

    pub(crate) fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::Interrupt => ErrorPayload::new("Interrupt", "step interrupted"),
            Self::Failed(p) | Self::Timeout(p) | Self::Validation(p) => p.clone(),
            Self::Cancelled(reason) => {
                ErrorPayload::new("CancelledError", format!("invoked task cancelled: {reason}"))
            }
            Self::Store(e) => ErrorPayload::new("StoreError", e.to_string()),
            Self::Serialization(e) => ErrorPayload::new("SerializationError", e.to_string()),
        }
    }
}

impl From<anyhow::Error> for StepError {
    fn from(error: anyhow::Error) -> Self {
        Self::Failed(ErrorPayload::from_anyhow(&error))
    }
}

impl From<EngineError> for StepError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Store(e) => Self::Store(e),
            EngineError::Validation(p) => Self::Validation(p),
            EngineError::Serialization(e) => Self::Serialization(e),
            other => Self::Failed(ErrorPayload::new("EngineError", other.to_string())),
        }
    }
}

/// Result type for program functions and step callbacks.
pub type JobResult<T = Value> = Result<T, StepError>;

struct ContextState {
    steps: HashMap<String, StepRow>,
    ordinals: name::Ordinals,
}

struct ContextInner {
    queue: Arc<QueueInner>,
    job: Job,
    task: TaskRow,
    cancel: CancellationToken,
    state: Mutex<ContextState>,
}

/// The ambient engine handle inside a program function
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
}

impl JobContext {
    pub(crate) fn new(
        queue: Arc<QueueInner>,
        job: Job,
        task: TaskRow,
        steps: Vec<StepRow>,
        cancel: CancellationToken,
    ) -> Self {
        let steps = steps.into_iter().map(|s| (s.step.clone(), s)).collect();
        Self {
            inner: Arc::new(ContextInner {
                queue,
                job,
                task,
                cancel,
                state: Mutex::new(ContextState {
                    steps,
                    ordinals: name::Ordinals::new(),
                }),
            }),
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.inner.task.id
    }

    pub fn task_key(&self) -> &str {
        &self.inner.task.key
    }

    pub fn queue_id(&self) -> &str {
        &self.inner.queue.id
    }

    /// How many times the program function has entered, this run included.
    pub fn attempt(&self) -> u32 {
        self.inner.task.runs
    }

    /// Token cancelled when the task is cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Memoized single-shot user code.
    ///
    /// The callback runs exactly once to success per step name; re-runs of
    /// the task replay the stored value. On failure the job's retry policy
    /// schedules re-attempts with backoff.
    pub async fn run<T, F, Fut>(&self, id: &str, f: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<T, anyhow::Error>> + Send,
    {
        self.run_with(RunOptions::new(id), f).await
    }

    /// [`run`](Self::run) with retry/timeout/concurrency overrides.
    pub async fn run_with<T, F, Fut>(&self, opts: RunOptions, f: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<T, anyhow::Error>> + Send,
    {
        let base = name::user(&opts.id);
        self.run_impl(base, opts, f).await
    }

    /// Like [`run`](Self::run), but the callback is synchronous and
    /// executes on the blocking worker pool. Task cancellation cancels the
    /// token handed to the callback.
    pub async fn detach<T, F>(&self, f: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, anyhow::Error> + Send + 'static,
    {
        self.run_impl(
            name::DETACH.to_string(),
            RunOptions::new("detach"),
            move |token| async move {
                tokio::task::spawn_blocking(move || f(token))
                    .await
                    .map_err(|e| anyhow::anyhow!("worker aborted: {e}"))?
            },
        )
        .await
    }

    /// Durable timer. Suspends until the deadline passes, across process
    /// restarts.
    pub async fn sleep(&self, duration: Duration) -> Result<(), StepError> {
        self.check_live()?;
        let step_name = self.next_name(name::SLEEP);
        let now = time::now();
        match self.get_step(&step_name) {
            Some(s) if s.status == StepStatus::Completed => Ok(()),
            Some(mut s) if s.status == StepStatus::Stalled => {
                if s.sleep_until.is_some_and(|t| t <= now) {
                    s.status = StepStatus::Completed;
                    s.updated_at = now;
                    self.put_step(s).await?;
                    Ok(())
                } else {
                    Err(StepError::Interrupt)
                }
            }
            None => {
                let mut row = StepRow::new(&self.inner.task, &step_name);
                row.status = StepStatus::Stalled;
                row.runs = 1;
                row.sleep_until = Some(now + duration.as_secs_f64());
                self.put_step(row).await?;
                Err(StepError::Interrupt)
            }
            Some(_) => Err(StepError::Interrupt),
        }
    }

    /// Suspend until an event on the target satisfies the filter.
    ///
    /// By default only events recorded at or after the step's creation
    /// match; set `retroactive` to accept older ones. With a timeout, the
    /// step fails with a timeout error when no event arrives in time.
    pub async fn wait_for(
        &self,
        target: WaitTarget<'_>,
        opts: WaitOptions,
    ) -> Result<Value, StepError> {
        self.check_live()?;
        let step_name = self.next_name(name::WAIT_FOR);
        let now = time::now();

        let row = match self.get_step(&step_name) {
            Some(s) if s.status == StepStatus::Completed => {
                return Ok(s.data.unwrap_or(Value::Null));
            }
            Some(s) if s.status == StepStatus::Failed => return Err(stored_failure(&s)),
            Some(s) if s.status == StepStatus::Waiting => s,
            Some(_) => return Err(StepError::Interrupt),
            None => {
                let mut row = StepRow::new(&self.inner.task, &step_name);
                row.status = StepStatus::Waiting;
                row.runs = 1;
                row.wait_for = Some(target.event_key());
                row.wait_filter = opts.filter.clone();
                row.wait_retroactive = Some(opts.retroactive);
                row.sleep_until = opts.timeout.map(|t| now + t.as_secs_f64());
                self.put_step(row.clone()).await?;
                row
            }
        };

        if let Some(data) = self.inner.queue.storage.resolve_event(&row).await? {
            let mut resolved = row;
            resolved.status = StepStatus::Completed;
            resolved.data = Some(data.clone());
            resolved.updated_at = time::now();
            self.inner
                .state
                .lock()
                .steps
                .insert(resolved.step.clone(), resolved);
            return Ok(data);
        }

        if row.sleep_until.is_some_and(|t| t <= now) {
            let payload = ErrorPayload::new(
                "TimeoutError",
                format!(
                    "timed out waiting for {}",
                    row.wait_for.as_deref().unwrap_or("event")
                ),
            );
            let mut failed = row;
            failed.status = StepStatus::Failed;
            failed.data = Some(serde_json::to_value(&payload)?);
            failed.updated_at = time::now();
            self.put_step(failed).await?;
            return Err(StepError::Timeout(payload));
        }

        Err(StepError::Interrupt)
    }

    /// Dispatch another job and await its settled outcome, matched by the
    /// dispatched input. Returns its result or re-raises its stored error.
    pub async fn invoke(&self, job: &Job, input: Value) -> Result<Value, StepError> {
        self.invoke_with(job, input, None).await
    }

    /// [`invoke`](Self::invoke) with a deadline on the settled wait.
    pub async fn invoke_with(
        &self,
        job: &Job,
        input: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, StepError> {
        self.dispatch_job(job, input.clone()).await?;
        let mut opts = WaitOptions::new().with_filter(serde_json::json!({ "input": input }));
        if let Some(t) = timeout {
            opts = opts.with_timeout(t);
        }
        let data = self
            .wait_for(WaitTarget::Job(job, LifecycleKind::Settled), opts)
            .await?;
        match data.get("status").and_then(Value::as_str) {
            Some("completed") => Ok(data.get("result").cloned().unwrap_or(Value::Null)),
            Some("failed") => Err(StepError::Failed(ErrorPayload::hydrate(
                data.get("error").unwrap_or(&Value::Null),
            ))),
            Some("cancelled") => Err(StepError::Cancelled(
                data.get("reason").cloned().unwrap_or(Value::Null),
            )),
            _ => Err(StepError::Failed(ErrorPayload::new(
                "Error",
                format!("malformed settled payload: {data}"),
            ))),
        }
    }

    /// Dispatch a sibling task, memoized so re-runs do not dispatch twice.
    /// Returns the dispatched task's key.
    pub async fn dispatch_job(&self, job: &Job, input: Value) -> Result<String, StepError> {
        self.check_live()?;
        let step_name = self.next_name(name::DISPATCH);
        if let Some(s) = self.get_step(&step_name) {
            if s.status == StepStatus::Completed {
                let key = s
                    .data
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return Ok(key);
            }
        }
        let key = job.dispatch_from(input, Some(self.inner.task.id)).await?;
        let mut row = StepRow::new(&self.inner.task, &step_name);
        row.status = StepStatus::Completed;
        row.runs = 1;
        row.data = Some(Value::String(key.clone()));
        self.put_step(row).await?;
        Ok(key)
    }

    /// Append an event to a pipe, memoized so re-runs do not dispatch
    /// twice.
    pub async fn dispatch_pipe(&self, pipe: &Pipe, input: Value) -> Result<(), StepError> {
        self.check_live()?;
        let step_name = self.next_name(name::DISPATCH);
        if let Some(s) = self.get_step(&step_name) {
            if s.status == StepStatus::Completed {
                return Ok(());
            }
        }
        pipe.dispatch(input).await?;
        let mut row = StepRow::new(&self.inner.task, &step_name);
        row.status = StepStatus::Completed;
        row.runs = 1;
        self.put_step(row).await?;
        Ok(())
    }

    /// Cancel another job's live task for the given input, memoized.
    pub async fn cancel_job(
        &self,
        job: &Job,
        input: &Value,
        reason: Value,
    ) -> Result<(), StepError> {
        self.check_live()?;
        let step_name = self.next_name(name::CANCEL);
        if let Some(s) = self.get_step(&step_name) {
            if s.status == StepStatus::Completed {
                return Ok(());
            }
        }
        job.cancel(input, reason.clone()).await?;
        let mut row = StepRow::new(&self.inner.task, &step_name);
        row.status = StepStatus::Completed;
        row.runs = 1;
        row.data = Some(reason);
        self.put_step(row).await?;
        Ok(())
    }

    /// Memoized validator application (implicit input/output system step).
    pub(crate) async fn parse_step(
        &self,
        validator: &dyn Validator,
        value: Value,
    ) -> Result<Value, StepError> {
        let step_name = self.next_name(name::PARSE);
        match self.get_step(&step_name) {
            Some(s) if s.status == StepStatus::Completed => Ok(s.data.unwrap_or(Value::Null)),
            Some(s) if s.status == StepStatus::Failed => Err(stored_failure(&s)),
            _ => match validator.parse(value) {
                Ok(parsed) => {
                    let mut row = StepRow::new(&self.inner.task, &step_name);
                    row.status = StepStatus::Completed;
                    row.runs = 1;
                    row.data = Some(parsed.clone());
                    self.put_step(row).await?;
                    Ok(parsed)
                }
                Err(error) => {
                    let payload = error.0;
                    let mut row = StepRow::new(&self.inner.task, &step_name);
                    row.status = StepStatus::Failed;
                    row.runs = 1;
                    row.data = Some(serde_json::to_value(&payload)?);
                    self.put_step(row).await?;
                    Err(StepError::Validation(payload))
                }
            },
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn run_impl<T, F, Fut>(
        &self,
        base: String,
        opts: RunOptions,
        f: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = Result<T, anyhow::Error>> + Send,
    {
        self.check_live()?;
        let step_name = self.next_name(&base);
        let existing = self.get_step(&step_name);
        let now = time::now();

        match &existing {
            Some(s) if s.status == StepStatus::Completed => {
                let value = s.data.clone().unwrap_or(Value::Null);
                return Ok(serde_json::from_value(value)?);
            }
            Some(s) if s.status == StepStatus::Failed => return Err(stored_failure(s)),
            Some(s)
                if s.status == StepStatus::Stalled
                    && s.sleep_until.is_some_and(|t| t > now) =>
            {
                return Err(StepError::Interrupt);
            }
            Some(s) if s.status == StepStatus::Running => {
                // In flight elsewhere; never re-enter a running callback.
                return Err(StepError::Interrupt);
            }
            _ => {}
        }

        if let Some(gate) = &opts.concurrency {
            let prefix = format!("{}#", name::user(&gate.id));
            let in_flight = self
                .inner
                .queue
                .storage
                .count_running_steps(&self.inner.queue.id, &prefix)
                .await?;
            if in_flight >= gate.limit {
                let mut row = existing
                    .unwrap_or_else(|| StepRow::new(&self.inner.task, &step_name));
                row.status = StepStatus::Stalled;
                row.sleep_until = Some(now + gate.delay.as_secs_f64());
                row.updated_at = now;
                self.put_step(row).await?;
                return Err(StepError::Interrupt);
            }
        }

        let mut row = existing.unwrap_or_else(|| StepRow::new(&self.inner.task, &step_name));
        row.status = StepStatus::Running;
        row.runs += 1;
        row.sleep_until = None;
        row.updated_at = now;
        self.put_step(row.clone()).await?;
        debug!(step = %row.step, attempt = row.runs, "running step callback");

        let child = self.inner.cancel.child_token();
        let attempt = f(child.clone());
        tokio::pin!(attempt);

        enum Outcome<T> {
            Done(Result<T, anyhow::Error>),
            Cancelled,
            TimedOut,
        }

        let outcome = tokio::select! {
            result = &mut attempt => Outcome::Done(result),
            _ = self.inner.cancel.cancelled() => Outcome::Cancelled,
            _ = attempt_deadline(opts.timeout) => Outcome::TimedOut,
        };

        let policy = opts
            .retry
            .unwrap_or_else(|| self.inner.job.config().retry.clone());

        match outcome {
            Outcome::Cancelled => {
                child.cancel();
                row.status = StepStatus::Stalled;
                row.sleep_until = None;
                row.updated_at = time::now();
                self.put_step(row).await?;
                Err(StepError::Interrupt)
            }
            Outcome::Done(Ok(value)) => {
                let data = serde_json::to_value(&value)?;
                row.status = StepStatus::Completed;
                row.data = Some(data);
                row.updated_at = time::now();
                self.put_step(row).await?;
                Ok(value)
            }
            Outcome::Done(Err(error)) => {
                let non_recoverable = error.downcast_ref::<NonRecoverable>().is_some();
                let payload = ErrorPayload::from_anyhow(&error);
                Err(self
                    .fail_attempt(row, payload, &policy, non_recoverable, false)
                    .await)
            }
            Outcome::TimedOut => {
                child.cancel();
                let payload = ErrorPayload::new(
                    "TimeoutError",
                    format!("step {step_name} timed out"),
                );
                Err(self.fail_attempt(row, payload, &policy, false, true).await)
            }
        }
    }

    /// Retry accounting after a failed attempt: park for backoff while
    /// attempts remain, otherwise fail the step terminally.
    async fn fail_attempt(
        &self,
        mut row: StepRow,
        payload: ErrorPayload,
        policy: &RetryPolicy,
        non_recoverable: bool,
        timed_out: bool,
    ) -> StepError {
        let now = time::now();
        row.updated_at = now;
        if !non_recoverable && policy.has_attempts_remaining(row.runs) {
            row.status = StepStatus::Stalled;
            row.sleep_until = Some(now + policy.delay_for_attempt(row.runs + 1).as_secs_f64());
            if let Err(e) = self.put_step(row).await {
                return e;
            }
            StepError::Interrupt
        } else {
            row.status = StepStatus::Failed;
            match serde_json::to_value(&payload) {
                Ok(data) => row.data = Some(data),
                Err(e) => return e.into(),
            }
            if let Err(e) = self.put_step(row).await {
                return e;
            }
            if timed_out {
                StepError::Timeout(payload)
            } else {
                StepError::Failed(payload)
            }
        }
    }

    fn check_live(&self) -> Result<(), StepError> {
        if self.inner.cancel.is_cancelled() {
            Err(StepError::Interrupt)
        } else {
            Ok(())
        }
    }

    fn next_name(&self, base: &str) -> String {
        self.inner.state.lock().ordinals.next(base)
    }

    fn get_step(&self, step_name: &str) -> Option<StepRow> {
        self.inner.state.lock().steps.get(step_name).cloned()
    }

    async fn put_step(&self, row: StepRow) -> Result<(), StepError> {
        self.inner.queue.storage.record_step(&row).await?;
        self.inner
            .state
            .lock()
            .steps
            .insert(row.step.clone(), row);
        Ok(())
    }
}

/// Rehydrate the stored failure of a step into the matching error variant.
fn stored_failure(step: &StepRow) -> StepError {
    let payload = ErrorPayload::hydrate(step.data.as_ref().unwrap_or(&Value::Null));
    match payload.name.as_str() {
        "TimeoutError" => StepError::Timeout(payload),
        "ValidationError" => StepError::Validation(payload),
        _ => StepError::Failed(payload),
    }
}

async fn attempt_deadline(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}
