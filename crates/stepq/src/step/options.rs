//! Options for interpreter operations

use std::time::Duration;

use serde_json::Value;

use crate::events::{job_event_key, pipe_event_key, LifecycleKind};
use crate::job::{Job, RetryPolicy};
use crate::pipe::Pipe;

/// Concurrency gate for a `run` step: admission is granted only while
/// fewer than `limit` steps sharing the gate id are in flight across the
/// queue; otherwise the step parks for `delay` and retries admission.
#[derive(Debug, Clone)]
pub struct Concurrency {
    pub id: String,
    pub limit: u64,
    pub delay: Duration,
}

impl Concurrency {
    pub fn new(id: impl Into<String>, limit: u64) -> Self {
        Self {
            id: id.into(),
            limit: limit.max(1),
            delay: Duration::from_millis(100),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Options for a `run` step
#[derive(Clone)]
pub struct RunOptions {
    /// Step id; the Nth call with the same id in a task names the step
    /// `user/<id>#<N>`.
    pub id: String,

    /// Override of the job's retry policy for this step
    pub retry: Option<RetryPolicy>,

    /// Per-attempt timeout; on expiry the callback's token is cancelled
    /// and the attempt counts as a failure
    pub timeout: Option<Duration>,

    pub concurrency: Option<Concurrency>,
}

impl RunOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            retry: None,
            timeout: None,
            concurrency: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

/// What a `wait_for` step listens on
#[derive(Clone, Copy)]
pub enum WaitTarget<'a> {
    /// Events dispatched on a pipe
    Pipe(&'a Pipe),

    /// Durable lifecycle events of a job (`start`, `success`, `error`,
    /// `settled`)
    Job(&'a Job, LifecycleKind),
}

impl WaitTarget<'_> {
    pub(crate) fn event_key(&self) -> String {
        match self {
            Self::Pipe(pipe) => pipe_event_key(pipe.id()),
            Self::Job(job, kind) => job_event_key(job.id(), *kind),
        }
    }
}

/// Options for a `wait_for` step
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    /// Structural filter the event's match payload must satisfy
    pub filter: Option<Value>,

    /// Fail the step with a timeout error when no event arrives in time
    pub timeout: Option<Duration>,

    /// Whether events recorded before the step was created may match
    pub retroactive: bool,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retroactive(mut self, retroactive: bool) -> Self {
        self.retroactive = retroactive;
        self
    }
}
