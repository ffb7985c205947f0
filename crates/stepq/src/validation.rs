//! Opaque input/output validation
//!
//! The engine does not depend on any particular schema library. Anything
//! with a `parse` method can validate job inputs and outputs; the parsed
//! value (which may differ from the raw one, e.g. after defaulting) is what
//! flows onward.

use serde_json::Value;

use crate::codec::ErrorPayload;

/// Error returned by a failed `parse`
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("{0}")]
pub struct ValidationError(pub ErrorPayload);

impl ValidationError {
    /// Create a validation error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(ErrorPayload::new("ValidationError", message))
    }
}

/// A validator: consumes an untrusted value, returns the parsed value or
/// rejects it.
///
/// Implementations must be deterministic; `parse` runs as a memoized
/// system step and its output is persisted.
pub trait Validator: Send + Sync {
    fn parse(&self, value: Value) -> Result<Value, ValidationError>;
}
