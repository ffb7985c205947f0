//! Pipe: a named durable event channel
//!
//! `dispatch` validates (when a schema is configured), canonicalizes, and
//! appends the payload to the events table under `pipe/<id>`, then pokes
//! the scheduler so waiting tasks re-evaluate. Waiting happens on the
//! interpreter side via [`crate::JobContext::wait_for`].

use std::sync::{Arc, OnceLock, Weak};

use serde_json::Value;
use tracing::debug;

use crate::error::EngineError;
use crate::events::pipe_event_key;
use crate::queue::QueueInner;
use crate::validation::Validator;

/// Configuration for a pipe
#[derive(Clone, Default)]
pub struct PipeConfig {
    /// Unique within the queue (and distinct from job ids)
    pub id: String,

    /// Input validator applied on every dispatch
    pub input: Option<Arc<dyn Validator>>,
}

impl PipeConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, validator: Arc<dyn Validator>) -> Self {
        self.input = Some(validator);
        self
    }
}

struct PipeInner {
    config: PipeConfig,
    queue: OnceLock<Weak<QueueInner>>,
}

/// A named, typed event stream
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl Pipe {
    pub fn new(config: PipeConfig) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                config,
                queue: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    /// Append an event carrying this payload.
    ///
    /// From inside a job, use [`crate::JobContext::dispatch_pipe`] so the
    /// write is memoized and not repeated on task re-runs.
    pub async fn dispatch(&self, input: Value) -> Result<(), EngineError> {
        let input = match &self.inner.config.input {
            Some(validator) => validator
                .parse(input)
                .map_err(|e| EngineError::Validation(e.0))?,
            None => input,
        };

        let queue = self.queue()?;
        queue
            .storage
            .record_event(&queue.id, &pipe_event_key(self.id()), &input, &input)
            .await?;
        debug!(pipe = %self.id(), "dispatched event");
        queue.wake();
        Ok(())
    }

    pub(crate) fn bind(&self, queue: Weak<QueueInner>) -> Result<(), EngineError> {
        self.inner
            .queue
            .set(queue)
            .map_err(|_| EngineError::AlreadyBound(format!("pipe {}", self.id())))
    }

    pub(crate) fn queue(&self) -> Result<Arc<QueueInner>, EngineError> {
        self.inner
            .queue
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| EngineError::Unbound(format!("pipe {}", self.id())))
    }
}
