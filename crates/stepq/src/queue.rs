//! Queue: the top-level container
//!
//! A queue owns a storage handle, a set of jobs and pipes, and the
//! scheduler driving them. Jobs and pipes are bound to exactly one queue;
//! their public operations resolve the queue through a weak handle so a
//! dropped queue surfaces as an `Unbound` error instead of leaking the
//! scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{job_event_key, match_payload, LifecycleKind};
use crate::job::Job;
use crate::pipe::Pipe;
use crate::scheduler;
use crate::storage::{Storage, StoreError, TaskRow};

/// Shared queue state: storage, registries, and scheduler plumbing.
pub(crate) struct QueueInner {
    pub id: String,
    pub storage: Arc<dyn Storage>,
    pub jobs: HashMap<String, Job>,
    pub pipes: HashMap<String, Pipe>,
    /// Pokes the scheduler loop out of its idle wait.
    pub notify: Notify,
    /// Cancellation tokens of executions currently in flight.
    pub running: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl QueueInner {
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Ids of all jobs sharing a debounce group.
    pub fn debounce_group(&self, group: &str) -> Vec<String> {
        self.jobs
            .values()
            .filter(|j| {
                j.config()
                    .debounce
                    .as_ref()
                    .is_some_and(|d| d.id == group)
            })
            .map(|j| j.id().to_string())
            .collect()
    }

    /// Settlement bookkeeping for a task that was just cancelled in
    /// storage: abort its in-flight execution, append the durable settled
    /// event, and notify observers.
    pub async fn settle_cancelled(
        &self,
        task: &TaskRow,
        reason: &Value,
    ) -> Result<(), StoreError> {
        if let Some(token) = self.running.lock().get(&task.id) {
            token.cancel();
        }

        let outcome = serde_json::json!({ "status": "cancelled", "reason": reason });
        self.storage
            .record_event(
                &self.id,
                &job_event_key(&task.job, LifecycleKind::Settled),
                &match_payload(&task.input, &task.key),
                &outcome,
            )
            .await?;

        if let Some(job) = self.jobs.get(&task.job) {
            job.emit(LifecycleKind::Cancel, &task.key, Some(reason.clone()));
            job.emit(LifecycleKind::Settled, &task.key, Some(outcome));
        }
        self.wake();
        Ok(())
    }
}

/// A named execution domain: storage + jobs + pipes + scheduler
///
/// # Example
///
/// ```ignore
/// let queue = Queue::builder("mail")
///     .storage(storage)
///     .job(send_email)
///     .pipe(bounces)
///     .build()?;
/// queue.start().await?;
/// // ...
/// queue.close().await;
/// ```
pub struct Queue {
    inner: Arc<QueueInner>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Queue {
    pub fn builder(id: impl Into<String>) -> QueueBuilder {
        QueueBuilder {
            id: id.into(),
            storage: None,
            jobs: Vec::new(),
            pipes: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.inner.storage.clone()
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.inner.jobs.get(id)
    }

    pub fn pipe(&self, id: &str) -> Option<&Pipe> {
        self.inner.pipes.get(id)
    }

    /// Start the scheduler.
    ///
    /// Tasks left `running` by a crashed process are requeued first, so a
    /// restart resumes them from their recorded steps. Starting an
    /// already-started queue is a no-op.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.driver.lock().is_some() {
            return Ok(());
        }
        let recovered = self
            .inner
            .storage
            .recover_running_tasks(&self.inner.id)
            .await?;
        if recovered > 0 {
            info!(queue = %self.inner.id, recovered, "requeued tasks from previous process");
        }

        let mut guard = self.driver.lock();
        if guard.is_none() {
            let shutdown_rx = self.shutdown.subscribe();
            *guard = Some(tokio::spawn(scheduler::run(
                self.inner.clone(),
                shutdown_rx,
            )));
        }
        Ok(())
    }

    /// Stop the scheduler, drain the in-flight task to a consistent point,
    /// and release the storage (a store wrapping an externally managed
    /// database leaves it open).
    pub async fn close(&self) {
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            let _ = self.shutdown.send(true);
            self.inner.wake();
            if let Err(e) = handle.await {
                error!(queue = %self.inner.id, "scheduler task failed during close: {e}");
            }
        }
        self.inner.storage.close().await;
    }
}

/// Builder for [`Queue`]
pub struct QueueBuilder {
    id: String,
    storage: Option<Arc<dyn Storage>>,
    jobs: Vec<Job>,
    pipes: Vec<Pipe>,
}

impl QueueBuilder {
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn job(mut self, job: Job) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn pipe(mut self, pipe: Pipe) -> Self {
        self.pipes.push(pipe);
        self
    }

    /// Validate ids, bind every job and pipe to the queue, and return it
    /// (not yet started).
    pub fn build(self) -> Result<Queue, EngineError> {
        let storage = self
            .storage
            .ok_or_else(|| EngineError::MissingStorage(self.id.clone()))?;

        let mut jobs = HashMap::new();
        for job in self.jobs {
            let id = job.id().to_string();
            if jobs.insert(id.clone(), job).is_some() {
                return Err(EngineError::DuplicateId(id));
            }
        }
        let mut pipes = HashMap::new();
        for pipe in self.pipes {
            let id = pipe.id().to_string();
            if jobs.contains_key(&id) || pipes.insert(id.clone(), pipe).is_some() {
                return Err(EngineError::DuplicateId(id));
            }
        }

        let inner = Arc::new(QueueInner {
            id: self.id,
            storage,
            jobs,
            pipes,
            notify: Notify::new(),
            running: Mutex::new(HashMap::new()),
        });

        for job in inner.jobs.values() {
            job.bind(Arc::downgrade(&inner))?;
        }
        for pipe in inner.pipes.values() {
            pipe.bind(Arc::downgrade(&inner))?;
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Queue {
            inner,
            shutdown,
            driver: Mutex::new(None),
        })
    }
}
