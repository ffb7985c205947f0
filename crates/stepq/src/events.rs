//! Job lifecycle events
//!
//! Lifecycle transitions surface twice: in-process through a per-job
//! broadcast channel (all kinds), and durably in the events table (the
//! `start`, `success`, `error`, and `settled` kinds), where `waitFor`
//! steps can match them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    /// A dispatch was requested (even when deduplicated)
    Trigger,

    /// The task entered its program function for the first time
    Start,

    /// One execution attempt of the program function finished
    Run,

    /// The task completed successfully
    Success,

    /// The task failed
    Error,

    /// The task was cancelled
    Cancel,

    /// The task reached any terminal status
    Settled,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trigger => "trigger",
            Self::Start => "start",
            Self::Run => "run",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancel => "cancel",
            Self::Settled => "settled",
        }
    }

    /// Kinds that are appended to the events table and can be awaited
    /// with `wait_for`.
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Start | Self::Success | Self::Error | Self::Settled)
    }
}

impl std::fmt::Display for LifecycleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An in-process lifecycle notification
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    /// Job id
    pub job: String,

    /// Task key
    pub key: String,

    pub kind: LifecycleKind,

    /// Kind-specific payload: the input for `trigger`/`start`, the result
    /// for `success`, the serialized error for `error`, the reason for
    /// `cancel`, and the settled outcome for `settled`.
    pub payload: Option<Value>,
}

/// Durable event key for a job lifecycle kind.
pub fn job_event_key(job: &str, kind: LifecycleKind) -> String {
    format!("job/{job}/{kind}")
}

/// Prefix of all durable lifecycle keys of a job.
pub fn job_event_key_prefix(job: &str) -> String {
    format!("job/{job}/")
}

/// Durable event key for a pipe.
pub fn pipe_event_key(pipe: &str) -> String {
    format!("pipe/{pipe}")
}

/// Durable event key for a throttle group's start accounting.
pub fn throttle_event_key(group: &str) -> String {
    format!("throttle/{group}")
}

/// The match payload carried by every durable lifecycle event: the task's
/// input (so waiters can filter structurally) and its key.
pub fn match_payload(input: &Value, key: &str) -> Value {
    serde_json::json!({ "input": input, "key": key })
}
