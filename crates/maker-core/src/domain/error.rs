//! Error taxonomy for the plan executor.

/// Reason a command was rejected before spawning.
///
/// Validation failures are dispatched on the kind, never on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Argument vector is empty or missing the operation token.
    EmptyCommand,

    /// First token is another tool entirely (kubectl, bash, terraform, ...).
    ForeignBinary,

    /// First token is not a known provider service.
    UnknownService,

    /// An argument contains a shell operator (`;`, `|`, `&&`, `||`).
    ShellOperator,

    /// A destructive verb appeared while destroyer mode is off.
    DestructiveVerb,
}

impl std::fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValidationErrorKind::EmptyCommand => "empty command",
            ValidationErrorKind::ForeignBinary => "foreign binary",
            ValidationErrorKind::UnknownService => "unknown provider service",
            ValidationErrorKind::ShellOperator => "shell operator in argument",
            ValidationErrorKind::DestructiveVerb => "destructive verb without destroyer mode",
        };
        f.write_str(s)
    }
}

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum MakerError {
    /// Plan malformed or unsafe argv; raised before any subprocess spawns.
    #[error("command rejected: {kind}: {detail}")]
    ValidationRejected {
        kind: ValidationErrorKind,
        detail: String,
    },

    /// The resolver gave up with placeholders still present.
    #[error("unresolved placeholders in step {step}: {placeholders:?}")]
    PlaceholderUnresolved {
        step: usize,
        placeholders: Vec<String>,
    },

    /// A classified provider failure no arm handled; aborts the plan.
    #[error("command {step} ({command}) failed: {reason}")]
    CommandAborted {
        step: usize,
        command: String,
        service: String,
        op: String,
        reason: String,
        output: String,
    },

    /// The LLM proposed a prerequisite command that failed validation.
    #[error("remediation rejected: {0}")]
    RemediationRejected(String),

    /// An internal helper call (describe, wait poll) exited non-zero.
    #[error("provider call failed: {op}: {output}")]
    Provider { op: String, output: String },

    /// LLM oracle failure (transport or unparseable response).
    #[error("llm error: {0}")]
    Llm(String),

    /// HTTP error (ip-echo lookup, LLM transport).
    #[error("http error: {0}")]
    Http(String),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (subprocess spawn, template files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Context cancellation; bubbles unchanged.
    #[error("cancelled")]
    Cancelled,
}

impl MakerError {
    /// Kind accessor for validation failures; `None` for other variants.
    pub fn validation_kind(&self) -> Option<ValidationErrorKind> {
        match self {
            MakerError::ValidationRejected { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for MakerError {
    fn from(err: reqwest::Error) -> Self {
        MakerError::Http(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, MakerError>;
