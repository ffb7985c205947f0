//! Error marshaling
//!
//! User errors cross the persistence boundary: a failed step stores its
//! error as JSON and rethrows it on every later encounter, possibly in a
//! different process. `ErrorPayload` is the wire form; hydration preserves
//! the cause chain through `std::error::Error::source`.

use serde::{Deserialize, Serialize};

/// A serialized error: name, message, optional backtrace text, and an
/// optional cause, recursively.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorPayload>>,
}

impl ErrorPayload {
    /// Create a payload with a name and message, no cause.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            cause: None,
        }
    }

    /// Attach a cause.
    pub fn with_cause(mut self, cause: ErrorPayload) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Capture an `anyhow::Error`, walking its source chain into `cause`.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        // Fold the chain back to front so each error wraps its source.
        let mut payload: Option<ErrorPayload> = None;
        for source in error.chain().rev() {
            let mut current = Self::new("Error", source.to_string());
            current.cause = payload.take().map(Box::new);
            payload = Some(current);
        }
        let mut payload = payload.unwrap_or_else(|| Self::new("Error", "unknown error"));
        payload.stack = Some(format!("{error:?}"));
        payload
    }

    /// Deserialize a payload from a stored JSON value.
    ///
    /// Tolerates foreign shapes: anything that is not a payload object is
    /// wrapped as the message of a generic error.
    pub fn hydrate(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone())
            .unwrap_or_else(|_| Self::new("Error", value.to_string()))
    }

    /// The depth of the cause chain, including this error.
    pub fn chain_len(&self) -> usize {
        1 + self.cause.as_ref().map_or(0, |c| c.chain_len())
    }
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorPayload {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_round_trip() {
        let payload = ErrorPayload::new("TimeoutError", "step timed out")
            .with_cause(ErrorPayload::new("Error", "socket closed"));

        let json = serde_json::to_value(&payload).unwrap();
        let back = ErrorPayload::hydrate(&json);
        assert_eq!(payload, back);
    }

    #[test]
    fn test_anyhow_chain_captured() {
        let root = anyhow::anyhow!("disk unplugged");
        let wrapped = root.context("write failed").context("job aborted");

        let payload = ErrorPayload::from_anyhow(&wrapped);
        assert_eq!(payload.message, "job aborted");
        assert_eq!(payload.chain_len(), 3);
        assert_eq!(
            payload.cause.as_ref().unwrap().cause.as_ref().unwrap().message,
            "disk unplugged"
        );
    }

    #[test]
    fn test_hydrated_source_chain() {
        let payload = ErrorPayload::new("Error", "outer")
            .with_cause(ErrorPayload::new("Error", "inner"));
        let source = payload.source().expect("cause should hydrate as source");
        assert_eq!(source.to_string(), "Error: inner");
        assert!(source.source().is_none());
    }

    #[test]
    fn test_hydrate_foreign_shape() {
        let payload = ErrorPayload::hydrate(&serde_json::json!("boom"));
        assert_eq!(payload.name, "Error");
        assert!(payload.message.contains("boom"));
    }
}
