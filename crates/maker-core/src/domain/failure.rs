//! Provider failure taxonomy.

use serde::{Deserialize, Serialize};

/// Closed classification of a provider CLI failure.
///
/// The category is the primary dispatch key for remediation; consumers
/// must match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    NotFound,
    AlreadyExists,
    Conflict,
    Throttled,
    AccessDenied,
    Validation,
    Transient,
    Unknown,
}

/// Classified provider failure.
///
/// `code` and `op` are diagnostic; dispatch keys on `category` plus raw
/// output patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Provider error code when one was recognized, else empty.
    pub code: String,

    /// Coarse category for remediation dispatch.
    pub category: FailureCategory,

    /// The service operation that failed (`args[1]`, trimmed).
    pub op: String,
}

impl Failure {
    pub fn new(code: impl Into<String>, category: FailureCategory, op: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            category,
            op: op.into(),
        }
    }
}
