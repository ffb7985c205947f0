//! Input hashing
//!
//! Task keys deduplicate dispatches, so they must be deterministic and
//! collision resistant while staying short enough for an indexed column.
//! Small inputs pass through as their canonical string; larger ones hash.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::canonical::to_canonical_string;

/// Canonical strings up to this length are used verbatim as keys.
const INLINE_KEY_MAX: usize = 40;

/// Compute the task key for an input value.
pub fn input_key(input: &Value) -> String {
    let canonical = to_canonical_string(input);
    if canonical.len() <= INLINE_KEY_MAX {
        canonical
    } else {
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}
