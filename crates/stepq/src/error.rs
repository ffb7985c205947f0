//! Engine error taxonomy

use serde_json::Value;

use crate::codec::ErrorPayload;
use crate::storage::StoreError;

/// Errors from engine surface operations (dispatch, cancel, queue
/// lifecycle, pipe dispatch)
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Two entities were registered under the same id
    #[error("duplicate id in queue: {0}")]
    DuplicateId(String),

    /// A job or pipe was used before being added to a queue, or after its
    /// queue was dropped
    #[error("{0} is not bound to a queue")]
    Unbound(String),

    /// A job or pipe was added to a second queue
    #[error("{0} is already bound to a queue")]
    AlreadyBound(String),

    /// A queue was built without a storage handle
    #[error("queue {0} was built without storage")]
    MissingStorage(String),

    /// Input validation failed at a dispatch boundary
    #[error("validation failed: {0}")]
    Validation(ErrorPayload),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Rejection of an `invoke` call: how the awaited task ended
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The task failed; carries the stored error
    #[error("{0}")]
    Failed(ErrorPayload),

    /// The task was cancelled; carries the stored reason
    #[error("task cancelled: {0}")]
    Cancelled(Value),

    /// The dispatch itself failed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The queue shut down before the task settled
    #[error("queue closed before the task settled")]
    Closed,
}

/// A user error that bypasses the retry policy: the step fails
/// immediately, with no further attempts.
///
/// # Example
///
/// ```ignore
/// ctx.run("charge", |_| async {
///     if card_declined {
///         return Err(NonRecoverable::new("card declined").into());
///     }
///     Ok(receipt)
/// })
/// .await?;
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct NonRecoverable {
    message: String,
}

impl NonRecoverable {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
