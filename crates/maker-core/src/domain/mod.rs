//! Domain types for the plan executor.

pub mod error;
pub mod failure;
pub mod options;
pub mod plan;

pub use error::{MakerError, Result, ValidationErrorKind};
pub use failure::{Failure, FailureCategory};
pub use options::{ExecOptions, LogCapture, LogSink};
pub use plan::{Plan, PlanStep};
