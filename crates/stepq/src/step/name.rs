//! Structured step names
//!
//! Steps are named `user/<id>#<ordinal>` or `system/<kind>#<ordinal>`.
//! Ordinals are assigned in call order within one execution attempt: the
//! Nth call sharing a base name gets ordinal N. A deterministic program
//! therefore reproduces the same names on every re-run, which is what
//! memoization keys on.

use std::collections::HashMap;

/// Base name for a user `run` step with the given id.
pub fn user(id: &str) -> String {
    format!("user/{id}")
}

pub const SLEEP: &str = "system/sleep";
pub const WAIT_FOR: &str = "system/waitFor";
pub const DISPATCH: &str = "system/dispatch";
pub const CANCEL: &str = "system/cancel";
pub const PARSE: &str = "system/parse";
pub const DETACH: &str = "system/detach";

/// Admission steps are planted outside the interpreter and always carry
/// ordinal zero: at most one exists per task.
pub const DEBOUNCE: &str = "system/debounce#0";
pub const THROTTLE: &str = "system/throttle#0";

/// Per-attempt ordinal assignment
#[derive(Debug, Default)]
pub struct Ordinals {
    seen: HashMap<String, u32>,
}

impl Ordinals {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full step name for the next call on this base name.
    pub fn next(&mut self, base: &str) -> String {
        let counter = self.seen.entry(base.to_string()).or_insert(0);
        let ordinal = *counter;
        *counter += 1;
        format!("{base}#{ordinal}")
    }
}
