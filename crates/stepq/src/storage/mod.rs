//! Durable tables for tasks, steps, and events
//!
//! The `Storage` trait is the only seam between the engine and its
//! persistence. Two implementations ship: SQLite (production) and an
//! in-memory store with identical semantics (tests).

mod filter;
mod memory;
mod sqlite;
mod store;

pub use filter::matches_filter;
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use store::{
    EventRow, NewTask, PickedTask, StepRow, StepStatus, Storage, StoreError, TaskRow, TaskStatus,
};
