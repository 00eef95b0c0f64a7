//! gcloud execution path.
//!
//! GCP plans share the plan structure and validation with the AWS path; a
//! step whose first token is `gcloud` is qualified with the project and
//! `--quiet` and validated with a stricter destructive-keyword check.

use crate::domain::{ExecOptions, MakerError, Result, ValidationErrorKind};

/// Keywords that make a gcloud token destructive.
const GCLOUD_DESTRUCTIVE: &[&str] = &["delete", "remove", "destroy"];

/// Whether a step belongs to the gcloud path.
pub fn is_gcloud_step(args: &[String]) -> bool {
    args.first().map(String::as_str) == Some("gcloud")
}

/// Validate a gcloud command.
///
/// Shell operators are rejected outright; without destroyer mode, any token
/// containing a destructive keyword is rejected.
pub fn validate_gcloud_command(args: &[String], destroyer: bool) -> Result<()> {
    if args.len() < 2 {
        return Err(MakerError::ValidationRejected {
            kind: ValidationErrorKind::EmptyCommand,
            detail: args.join(" "),
        });
    }
    for arg in args {
        if arg.contains(';') || arg.contains('|') || arg.contains("&&") {
            return Err(MakerError::ValidationRejected {
                kind: ValidationErrorKind::ShellOperator,
                detail: arg.clone(),
            });
        }
    }
    if !destroyer {
        for arg in args {
            let lowered = arg.to_lowercase();
            if GCLOUD_DESTRUCTIVE.iter().any(|kw| lowered.contains(kw)) {
                return Err(MakerError::ValidationRejected {
                    kind: ValidationErrorKind::DestructiveVerb,
                    detail: arg.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Qualify a gcloud argv with project, `--quiet`, and JSON output when the
/// step produces bindings.
pub fn gcloud_argv(opts: &ExecOptions, args: &[String], wants_json: bool) -> Vec<String> {
    let mut argv: Vec<String> = args.to_vec();
    argv.push("--quiet".to_string());
    if !opts.gcp_project.is_empty() {
        argv.push("--project".to_string());
        argv.push(opts.gcp_project.clone());
    }
    if wants_json {
        argv.push("--format=json".to_string());
    }
    argv
}
