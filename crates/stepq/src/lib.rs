//! # Durable Job Engine
//!
//! A SQLite-backed job/workflow engine for crash-recoverable, multi-step
//! asynchronous jobs.
//!
//! ## Features
//!
//! - **Memoized steps**: each suspension point inside a job runs exactly
//!   once to success; re-runs replay stored outcomes
//! - **Durable timers**: sleep, retry backoff, and wait timeouts survive
//!   restarts
//! - **Event coordination**: durable pipes with structural JSON matching
//!   wake exactly the tasks whose filters are satisfied
//! - **Cross-job orchestration**: invoke, dispatch, and cancel other jobs
//!   from inside a program, memoized like any other step
//! - **Admission control**: priority, debounce, throttle, rate limit, and
//!   task-wide timeouts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Queue + Scheduler                       │
//! │  (reserves runnable tasks, drives program functions)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       JobContext                             │
//! │  (run / sleep / wait_for / invoke / dispatch / cancel,       │
//! │   each a memoized step; suspension = StepError::Interrupt)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Storage                               │
//! │  (SQLite: tasks, steps, events; json_tree event matcher)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use stepq::prelude::*;
//!
//! let greet = Job::new(JobConfig::new("greet"), |ctx, input| async move {
//!     let name = ctx
//!         .run("lookup", |_| async move { Ok(input["user"].to_string()) })
//!         .await?;
//!     ctx.sleep(Duration::from_secs(1)).await?;
//!     Ok(json!({ "greeting": format!("hello {name}") }))
//! });
//!
//! let storage = Arc::new(SqliteStorage::connect("greet.db").await?);
//! let queue = Queue::builder("main").storage(storage).job(greet.clone()).build()?;
//! queue.start().await?;
//!
//! let out = greet.invoke(json!({ "user": "ada" })).await?;
//! queue.close().await;
//! ```

pub mod admin;
mod codec;
mod error;
mod events;
mod job;
mod pipe;
mod queue;
mod scheduler;
mod step;
mod storage;
pub mod time;
mod validation;

/// Prelude for common imports
pub mod prelude {
    pub use crate::codec::{input_key, ErrorPayload};
    pub use crate::error::{EngineError, InvokeError, NonRecoverable};
    pub use crate::events::{LifecycleEvent, LifecycleKind};
    pub use crate::job::{Debounce, Job, JobConfig, RateLimit, RetryPolicy, Throttle};
    pub use crate::pipe::{Pipe, PipeConfig};
    pub use crate::queue::Queue;
    pub use crate::step::{
        Concurrency, JobContext, JobResult, RunOptions, StepError, WaitOptions, WaitTarget,
    };
    pub use crate::storage::{MemoryStorage, SqliteStorage, Storage};
    pub use crate::validation::{ValidationError, Validator};
}

// Re-export key types at crate root
pub use codec::{input_key, to_canonical_string, ErrorPayload};
pub use error::{EngineError, InvokeError, NonRecoverable};
pub use events::{
    job_event_key, pipe_event_key, LifecycleEvent, LifecycleKind,
};
pub use job::{Debounce, Job, JobConfig, LifecycleHook, PriorityFn, RateLimit, RetryPolicy, Throttle};
pub use pipe::{Pipe, PipeConfig};
pub use queue::{Queue, QueueBuilder};
pub use step::{
    Concurrency, JobContext, JobResult, RunOptions, StepError, WaitOptions, WaitTarget,
};
pub use storage::{
    matches_filter, EventRow, MemoryStorage, NewTask, PickedTask, SqliteStorage, StepRow,
    StepStatus, Storage, StoreError, TaskRow, TaskStatus,
};
pub use validation::{ValidationError, Validator};
