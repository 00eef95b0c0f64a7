//! maker Core Library
//!
//! Execution and remediation engine for cloud-provider CLI plans.
//!
//! A plan is an ordered list of provider CLI invocations produced by an
//! upstream planner. The engine normalizes and validates each step,
//! substitutes learned bindings, resolves `<PLACEHOLDER>` residues, runs the
//! provider CLI, and on failure walks a layered remediation pipeline:
//! deterministic per-service rewrite/retry arms, cross-service fallbacks,
//! and a bounded LLM-proposed prerequisite path.

pub mod bindings;
pub mod classify;
pub mod context;
pub mod domain;
pub mod enrich;
pub mod executor;
pub mod fakes;
pub mod gcp;
pub mod hooks;
pub mod jsonx;
pub mod llm;
pub mod normalize;
pub mod remediate;
pub mod resolve;
pub mod runner;
pub mod userdata;
pub mod waiters;

pub use bindings::BindingStore;
pub use classify::classify_failure;
pub use context::ExecCtx;
pub use domain::{
    ExecOptions, Failure, FailureCategory, LogSink, MakerError, Plan, PlanStep, Result,
    ValidationErrorKind,
};
pub use executor::{execute_plan, PlanReport};
pub use llm::{HttpLlmClient, LlmClient};
pub use normalize::{
    apply_plan_bindings, has_unresolved_placeholders, normalize_args, validate_command,
};
pub use remediate::Remediation;
pub use runner::{CliRunner, CommandRunner, RunOutput};
