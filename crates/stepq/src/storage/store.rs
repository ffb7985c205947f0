//! Storage trait definition

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::time;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is runnable (or blocked by a step condition)
    Pending,

    /// The scheduler is executing the task's program function
    Running,

    /// Task is parked on timers only
    Stalled,

    /// Task completed successfully
    Completed,

    /// Task failed
    Failed,

    /// Task was cancelled
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stalled => "stalled",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "stalled" => Ok(Self::Stalled),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Serialization(format!(
                "unknown task status: {other}"
            ))),
        }
    }

    /// Terminal statuses free the task key for re-dispatch.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Callback is in flight
    Running,

    /// Inserted but not yet executed
    Pending,

    /// Parked on a timer (sleep, retry backoff, admission gate)
    Stalled,

    /// Parked on an event condition
    Waiting,

    /// Step resolved with a value
    Completed,

    /// Step failed terminally
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Pending => "pending",
            Self::Stalled => "stalled",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "running" => Ok(Self::Running),
            "pending" => Ok(Self::Pending),
            "stalled" => Ok(Self::Stalled),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Serialization(format!(
                "unknown step status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempted execution of a job for a specific input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub queue: String,
    pub job: String,
    pub key: String,
    pub input: Value,
    pub status: TaskStatus,
    pub runs: u32,
    pub started: bool,
    pub priority: i64,
    pub lifo: bool,
    pub created_at: f64,
    pub updated_at: f64,
    pub data: Option<Value>,
}

/// A memoized suspension point within one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRow {
    pub id: Uuid,
    pub task_id: Uuid,
    pub queue: String,
    pub job: String,
    pub key: String,
    pub step: String,
    pub status: StepStatus,
    pub runs: u32,
    pub created_at: f64,
    pub updated_at: f64,
    pub sleep_until: Option<f64>,
    pub wait_for: Option<String>,
    pub wait_filter: Option<Value>,
    pub wait_retroactive: Option<bool>,
    pub data: Option<Value>,
}

impl StepRow {
    /// A fresh pending step owned by the given task.
    pub fn new(task: &TaskRow, name: impl Into<String>) -> Self {
        let created = time::now();
        Self {
            id: Uuid::now_v7(),
            task_id: task.id,
            queue: task.queue.clone(),
            job: task.job.clone(),
            key: task.key.clone(),
            step: name.into(),
            status: StepStatus::Pending,
            runs: 0,
            created_at: created,
            updated_at: created,
            sleep_until: None,
            wait_for: None,
            wait_filter: None,
            wait_retroactive: None,
            data: None,
        }
    }
}

/// A durable entry on a pipe or job lifecycle channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub id: Uuid,
    pub queue: String,
    pub key: String,
    pub created_at: f64,
    pub input: Value,
    pub data: Value,
}

/// Insert request for a new task
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub queue: &'a str,
    pub job: &'a str,
    pub key: &'a str,
    pub input: &'a Value,
    pub parent_id: Option<Uuid>,
    pub priority: i64,
    /// Newest-wins admission ordering (rate-limited jobs).
    pub lifo: bool,
    /// Debounce delay in seconds; plants a `system/debounce#0` stalled
    /// step atomically with the insert so the task cannot start early.
    pub delay: Option<f64>,
}

/// Result of reserving the next runnable task
#[derive(Debug)]
pub struct PickedTask {
    pub task: TaskRow,
    pub steps: Vec<StepRow>,
    /// Whether another task was ready at reservation time.
    pub has_more: bool,
}

/// Store for tasks, steps, and events
///
/// Implementations must be thread-safe. `start_next_task` and
/// `resolve_event` are atomic check-and-claim operations; everything else
/// is a single-statement write or a read.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Find a task by its dedup coordinates. Prefers the live row when one
    /// exists, otherwise the most recently created.
    async fn get_task(
        &self,
        queue: &str,
        job: &str,
        key: &str,
    ) -> Result<Option<TaskRow>, StoreError>;

    /// Fetch a task by id.
    async fn get_task_by_id(&self, id: Uuid) -> Result<Option<TaskRow>, StoreError>;

    /// Insert a task. No-op returning `None` while a live task already
    /// occupies `(queue, job, key)`.
    async fn add_task(&self, task: NewTask<'_>) -> Result<Option<TaskRow>, StoreError>;

    /// Atomically select the highest-priority runnable task, transition it
    /// to `running`, and return it with its step rows.
    ///
    /// A task is runnable when `pending` or `stalled` and no step blocks
    /// it: a step blocks iff it is `running`, or `stalled` with a future
    /// timer, or `waiting` with an unexpired timeout and no matching
    /// event.
    async fn start_next_task(&self, queue: &str) -> Result<Option<PickedTask>, StoreError>;

    /// Count one entry into the task's program function; returns the new
    /// total. Reservations that never reach the program (admission gates)
    /// do not count.
    async fn record_task_attempt(&self, task_id: Uuid) -> Result<u32, StoreError>;

    /// Seconds until the nearest future timer among blocked tasks, if any.
    /// Used as the scheduler's idle sleep bound.
    async fn next_future_task(&self, queue: &str) -> Result<Option<f64>, StoreError>;

    /// Terminal write for a `running` task. Returns false when the task
    /// was no longer `running` (e.g. cancelled mid-flight).
    async fn resolve_task(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        data: Option<&Value>,
    ) -> Result<bool, StoreError>;

    /// Move a `running` task back to `pending` (or `stalled` when parked
    /// on timers only). Returns false when the task was not `running`.
    async fn requeue_task(&self, task_id: Uuid) -> Result<bool, StoreError>;

    /// Flip the observable-start flag.
    async fn mark_task_started(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Cancel the live task at `(queue, job, key)`, storing the reason.
    /// Returns the cancelled row when one was live.
    async fn cancel_task(
        &self,
        queue: &str,
        job: &str,
        key: &str,
        reason: &Value,
    ) -> Result<Option<TaskRow>, StoreError>;

    /// Debounce sweep: cancel live, never-started tasks of the named jobs
    /// created before the given instant. Returns the cancelled rows.
    async fn cancel_unstarted_tasks(
        &self,
        queue: &str,
        jobs: &[String],
        before: f64,
        reason: &Value,
    ) -> Result<Vec<TaskRow>, StoreError>;

    /// Crash recovery: requeue tasks stuck in `running` from a previous
    /// process and release their in-flight steps. Returns the number of
    /// tasks recovered.
    async fn recover_running_tasks(&self, queue: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Step Operations
    // =========================================================================

    /// Upsert a step on its `(task_id, step)` key.
    async fn record_step(&self, step: &StepRow) -> Result<(), StoreError>;

    /// Count `running` steps across the queue whose name starts with the
    /// given prefix. Concurrency-gate admission.
    async fn count_running_steps(&self, queue: &str, prefix: &str) -> Result<u64, StoreError>;

    // =========================================================================
    // Event Operations
    // =========================================================================

    /// Append an event.
    async fn record_event(
        &self,
        queue: &str,
        key: &str,
        input: &Value,
        data: &Value,
    ) -> Result<EventRow, StoreError>;

    /// Atomic: find the event nearest in time to the step's creation that
    /// satisfies its wait condition; complete the step with the event's
    /// delivery payload and return it.
    async fn resolve_event(&self, step: &StepRow) -> Result<Option<Value>, StoreError>;

    /// The most recent event on a key, if any. Throttle-gate accounting.
    async fn latest_event(&self, queue: &str, key: &str) -> Result<Option<EventRow>, StoreError>;

    // =========================================================================
    // Read-Only Listings (admin API)
    // =========================================================================

    async fn list_queues(&self) -> Result<Vec<String>, StoreError>;

    async fn list_jobs(&self, queue: &str) -> Result<Vec<String>, StoreError>;

    async fn list_tasks(&self, queue: Option<&str>, job: &str) -> Result<Vec<TaskRow>, StoreError>;

    async fn list_steps(&self, task_id: Uuid) -> Result<Vec<StepRow>, StoreError>;

    async fn list_events_by_prefix(
        &self,
        queue: &str,
        prefix: &str,
    ) -> Result<Vec<EventRow>, StoreError>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Release underlying resources the store owns. A store wrapping an
    /// externally managed database must not close it.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Stalled,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TaskStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Stalled.is_terminal());
    }

    #[test]
    fn test_step_status_round_trip() {
        for status in [
            StepStatus::Running,
            StepStatus::Pending,
            StepStatus::Stalled,
            StepStatus::Waiting,
            StepStatus::Completed,
            StepStatus::Failed,
        ] {
            assert_eq!(StepStatus::parse(status.as_str()).unwrap(), status);
        }
    }
}
