//! In-memory implementation of Storage for testing

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use super::filter::matches_filter;
use super::store::*;
use crate::step::name as step_name;
use crate::time;

#[derive(Default)]
struct State {
    tasks: HashMap<Uuid, TaskRow>,
    steps: HashMap<(Uuid, String), StepRow>,
    events: Vec<EventRow>,
}

/// In-memory implementation of `Storage`
///
/// Primarily for tests. Provides the same semantics as the SQLite
/// implementation; the storage contract suite runs against both.
///
/// # Example
///
/// ```
/// use stepq::MemoryStorage;
///
/// let store = MemoryStorage::new();
/// ```
pub struct MemoryStorage {
    state: RwLock<State>,
}

impl MemoryStorage {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Number of stored tasks (all statuses)
    pub fn task_count(&self) -> usize {
        self.state.read().tasks.len()
    }

    /// Number of stored events
    pub fn event_count(&self) -> usize {
        self.state.read().events.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.tasks.clear();
        state.steps.clear();
        state.events.clear();
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn event_satisfies(event: &EventRow, step: &StepRow) -> bool {
    if step.wait_for.as_deref() != Some(event.key.as_str()) || event.queue != step.queue {
        return false;
    }
    if step.wait_retroactive != Some(true) && event.created_at < step.created_at {
        return false;
    }
    step.wait_filter
        .as_ref()
        .map_or(true, |f| matches_filter(f, &event.input))
}

impl State {
    fn step_blocks(&self, step: &StepRow, now: f64) -> bool {
        match step.status {
            StepStatus::Running => true,
            StepStatus::Stalled => step.sleep_until.is_some_and(|t| t > now),
            StepStatus::Waiting => {
                // An expired wait timeout makes the task runnable so the
                // interpreter can fail the step.
                if step.sleep_until.is_some_and(|t| t <= now) {
                    return false;
                }
                !self.events.iter().any(|e| event_satisfies(e, step))
            }
            _ => false,
        }
    }

    fn runnable(&self, task: &TaskRow, now: f64) -> bool {
        matches!(task.status, TaskStatus::Pending | TaskStatus::Stalled)
            && !self
                .steps
                .values()
                .any(|s| s.task_id == task.id && self.step_blocks(s, now))
    }

    fn next_runnable_id(&self, queue: &str, now: f64) -> Option<Uuid> {
        let mut candidates: Vec<&TaskRow> = self
            .tasks
            .values()
            .filter(|t| t.queue == queue && self.runnable(t, now))
            .collect();
        candidates.sort_by(|a, b| {
            let ord_a = if a.lifo { -a.created_at } else { a.created_at };
            let ord_b = if b.lifo { -b.created_at } else { b.created_at };
            b.priority
                .cmp(&a.priority)
                .then(ord_a.total_cmp(&ord_b))
        });
        candidates.first().map(|t| t.id)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_task(
        &self,
        queue: &str,
        job: &str,
        key: &str,
    ) -> Result<Option<TaskRow>, StoreError> {
        let state = self.state.read();
        let mut rows: Vec<&TaskRow> = state
            .tasks
            .values()
            .filter(|t| t.queue == queue && t.job == job && t.key == key)
            .collect();
        rows.sort_by(|a, b| {
            a.status
                .is_terminal()
                .cmp(&b.status.is_terminal())
                .then(b.created_at.total_cmp(&a.created_at))
        });
        Ok(rows.first().map(|t| (*t).clone()))
    }

    async fn get_task_by_id(&self, id: Uuid) -> Result<Option<TaskRow>, StoreError> {
        Ok(self.state.read().tasks.get(&id).cloned())
    }

    async fn add_task(&self, task: NewTask<'_>) -> Result<Option<TaskRow>, StoreError> {
        let mut state = self.state.write();
        let live = state.tasks.values().any(|t| {
            t.queue == task.queue
                && t.job == task.job
                && t.key == task.key
                && !t.status.is_terminal()
        });
        if live {
            return Ok(None);
        }

        let created = time::now();
        let row = TaskRow {
            id: Uuid::now_v7(),
            parent_id: task.parent_id,
            queue: task.queue.to_string(),
            job: task.job.to_string(),
            key: task.key.to_string(),
            input: task.input.clone(),
            status: TaskStatus::Pending,
            runs: 0,
            started: false,
            priority: task.priority,
            lifo: task.lifo,
            created_at: created,
            updated_at: created,
            data: None,
        };

        if let Some(delay) = task.delay {
            let mut step = StepRow::new(&row, step_name::DEBOUNCE);
            step.status = StepStatus::Stalled;
            step.sleep_until = Some(created + delay);
            state.steps.insert((row.id, step.step.clone()), step);
        }

        state.tasks.insert(row.id, row.clone());
        Ok(Some(row))
    }

    async fn start_next_task(&self, queue: &str) -> Result<Option<PickedTask>, StoreError> {
        let mut state = self.state.write();
        let now = time::now();
        let Some(id) = state.next_runnable_id(queue, now) else {
            return Ok(None);
        };

        let task = {
            let task = state.tasks.get_mut(&id).expect("picked task exists");
            task.status = TaskStatus::Running;
            task.updated_at = now;
            task.clone()
        };

        let mut steps: Vec<StepRow> = state
            .steps
            .values()
            .filter(|s| s.task_id == id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));

        let has_more = state.next_runnable_id(queue, now).is_some();
        Ok(Some(PickedTask {
            task,
            steps,
            has_more,
        }))
    }

    async fn next_future_task(&self, queue: &str) -> Result<Option<f64>, StoreError> {
        let state = self.state.read();
        let now = time::now();
        let wake = state
            .steps
            .values()
            .filter(|s| {
                matches!(s.status, StepStatus::Stalled | StepStatus::Waiting)
                    && s.sleep_until.is_some_and(|t| t > now)
                    && state.tasks.get(&s.task_id).is_some_and(|t| {
                        t.queue == queue
                            && matches!(t.status, TaskStatus::Pending | TaskStatus::Stalled)
                    })
            })
            .filter_map(|s| s.sleep_until)
            .min_by(|a, b| a.total_cmp(b));
        Ok(wake.map(|t| (t - now).max(0.0)))
    }

    async fn record_task_attempt(&self, task_id: Uuid) -> Result<u32, StoreError> {
        let mut state = self.state.write();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.runs += 1;
        task.updated_at = time::now();
        Ok(task.runs)
    }

    async fn resolve_task(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        data: Option<&Value>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Err(StoreError::TaskNotFound(task_id));
        };
        if task.status != TaskStatus::Running {
            return Ok(false);
        }
        task.status = status;
        task.data = data.cloned();
        task.updated_at = time::now();
        Ok(true)
    }

    async fn requeue_task(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let now = time::now();
        let Some(task) = state.tasks.get(&task_id) else {
            return Err(StoreError::TaskNotFound(task_id));
        };
        if task.status != TaskStatus::Running {
            return Ok(false);
        }
        let timers_only = {
            let steps: Vec<&StepRow> = state
                .steps
                .values()
                .filter(|s| s.task_id == task_id)
                .collect();
            steps.iter().all(|s| s.status != StepStatus::Waiting)
                && steps
                    .iter()
                    .any(|s| s.status == StepStatus::Stalled && s.sleep_until.is_some_and(|t| t > now))
        };
        let task = state.tasks.get_mut(&task_id).expect("checked above");
        task.status = if timers_only {
            TaskStatus::Stalled
        } else {
            TaskStatus::Pending
        };
        task.updated_at = now;
        Ok(true)
    }

    async fn mark_task_started(&self, task_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.started = true;
        task.updated_at = time::now();
        Ok(())
    }

    async fn cancel_task(
        &self,
        queue: &str,
        job: &str,
        key: &str,
        reason: &Value,
    ) -> Result<Option<TaskRow>, StoreError> {
        let mut state = self.state.write();
        let id = state
            .tasks
            .values()
            .find(|t| {
                t.queue == queue && t.job == job && t.key == key && !t.status.is_terminal()
            })
            .map(|t| t.id);
        let Some(id) = id else { return Ok(None) };
        let task = state.tasks.get_mut(&id).expect("found above");
        task.status = TaskStatus::Cancelled;
        task.data = Some(reason.clone());
        task.updated_at = time::now();
        Ok(Some(task.clone()))
    }

    async fn cancel_unstarted_tasks(
        &self,
        queue: &str,
        jobs: &[String],
        before: f64,
        reason: &Value,
    ) -> Result<Vec<TaskRow>, StoreError> {
        let mut state = self.state.write();
        let now = time::now();
        let ids: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| {
                t.queue == queue
                    && jobs.contains(&t.job)
                    && !t.started
                    && !t.status.is_terminal()
                    && t.status != TaskStatus::Running
                    && t.created_at < before
            })
            .map(|t| t.id)
            .collect();
        let mut cancelled = Vec::with_capacity(ids.len());
        for id in ids {
            let task = state.tasks.get_mut(&id).expect("collected above");
            task.status = TaskStatus::Cancelled;
            task.data = Some(reason.clone());
            task.updated_at = now;
            cancelled.push(task.clone());
        }
        Ok(cancelled)
    }

    async fn recover_running_tasks(&self, queue: &str) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let now = time::now();
        for step in state.steps.values_mut() {
            if step.queue == queue && step.status == StepStatus::Running {
                step.status = StepStatus::Stalled;
                step.sleep_until = None;
                step.updated_at = now;
            }
        }
        let mut recovered = 0;
        for task in state.tasks.values_mut() {
            if task.queue == queue && task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                task.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn record_step(&self, step: &StepRow) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state
            .steps
            .insert((step.task_id, step.step.clone()), step.clone());
        Ok(())
    }

    async fn count_running_steps(&self, queue: &str, prefix: &str) -> Result<u64, StoreError> {
        let state = self.state.read();
        Ok(state
            .steps
            .values()
            .filter(|s| {
                s.queue == queue && s.status == StepStatus::Running && s.step.starts_with(prefix)
            })
            .count() as u64)
    }

    async fn record_event(
        &self,
        queue: &str,
        key: &str,
        input: &Value,
        data: &Value,
    ) -> Result<EventRow, StoreError> {
        let mut state = self.state.write();
        let row = EventRow {
            id: Uuid::now_v7(),
            queue: queue.to_string(),
            key: key.to_string(),
            created_at: time::now(),
            input: input.clone(),
            data: data.clone(),
        };
        state.events.push(row.clone());
        Ok(row)
    }

    async fn resolve_event(&self, step: &StepRow) -> Result<Option<Value>, StoreError> {
        let mut state = self.state.write();
        let found = state
            .events
            .iter()
            .filter(|e| event_satisfies(e, step))
            .min_by(|a, b| {
                (a.created_at - step.created_at)
                    .abs()
                    .total_cmp(&(b.created_at - step.created_at).abs())
            })
            .map(|e| e.data.clone());
        let Some(data) = found else { return Ok(None) };

        if let Some(stored) = state.steps.get_mut(&(step.task_id, step.step.clone())) {
            stored.status = StepStatus::Completed;
            stored.data = Some(data.clone());
            stored.updated_at = time::now();
        }
        Ok(Some(data))
    }

    async fn latest_event(&self, queue: &str, key: &str) -> Result<Option<EventRow>, StoreError> {
        let state = self.state.read();
        Ok(state
            .events
            .iter()
            .filter(|e| e.queue == queue && e.key == key)
            .max_by(|a, b| a.created_at.total_cmp(&b.created_at))
            .cloned())
    }

    async fn list_queues(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.read();
        let mut queues: Vec<String> = state.tasks.values().map(|t| t.queue.clone()).collect();
        queues.sort();
        queues.dedup();
        Ok(queues)
    }

    async fn list_jobs(&self, queue: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.read();
        let mut jobs: Vec<String> = state
            .tasks
            .values()
            .filter(|t| t.queue == queue)
            .map(|t| t.job.clone())
            .collect();
        jobs.sort();
        jobs.dedup();
        Ok(jobs)
    }

    async fn list_tasks(&self, queue: Option<&str>, job: &str) -> Result<Vec<TaskRow>, StoreError> {
        let state = self.state.read();
        let mut rows: Vec<TaskRow> = state
            .tasks
            .values()
            .filter(|t| t.job == job && queue.map_or(true, |q| t.queue == q))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        Ok(rows)
    }

    async fn list_steps(&self, task_id: Uuid) -> Result<Vec<StepRow>, StoreError> {
        let state = self.state.read();
        let mut rows: Vec<StepRow> = state
            .steps
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        Ok(rows)
    }

    async fn list_events_by_prefix(
        &self,
        queue: &str,
        prefix: &str,
    ) -> Result<Vec<EventRow>, StoreError> {
        let state = self.state.read();
        let mut rows: Vec<EventRow> = state
            .events
            .iter()
            .filter(|e| e.queue == queue && e.key.starts_with(prefix))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.total_cmp(&b.created_at));
        Ok(rows)
    }

    async fn close(&self) {}
}
