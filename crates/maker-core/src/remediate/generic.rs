//! Cross-service fallback rules, applied after the service pack.
//!
//! Order is contractual: delete idempotency, generic create→update/put,
//! ARN-visibility wait, create idempotency, propagation retry. The
//! instance-profile singleton case is handled in the service pack.

use std::time::Duration;

use serde_json::Value;

use super::{provider_error, retry_original, ArmScope, Remediation};
use crate::context::ExecCtx;
use crate::domain::{FailureCategory, MakerError, Result};
use crate::jsonx;
use crate::normalize::is_delete_like_op;
use crate::waiters;

/// Operation families likely to race a just-created resource.
const FOLLOW_ON_PREFIXES: &[&str] = &[
    "put-", "add-", "attach-", "associate-", "update-", "set-", "register-", "enable-",
    "disable-", "tag-", "untag-",
];

/// Symptom tokens for the last-resort propagation retry.
const GLUE_PROPAGATION_TOKENS: &[&str] =
    &["in progress", "pending", "resource-in-use", "resourceinuse", "eventual"];

pub(super) async fn apply(ctx: &ExecCtx<'_>, scope: &mut ArmScope<'_>) -> Result<Remediation> {
    let service = scope.args.first().cloned().unwrap_or_default();
    let op = scope.args.get(1).cloned().unwrap_or_default();

    // Deleting something that is already gone is the desired post-state.
    if scope.failure.category == FailureCategory::NotFound && is_delete_like_op(&op) {
        ctx.log()
            .remediation(&format!("{service} {op} target already gone, treating as success"));
        return Ok(Remediation::Handled);
    }

    // Generic create → update → put, skipping S3 where a blind update is
    // destructive.
    let exists_conflict = matches!(
        scope.failure.category,
        FailureCategory::AlreadyExists | FailureCategory::Conflict
    );
    if exists_conflict && op.starts_with("create-") && service != "s3" && service != "s3api" {
        if let Some(outcome) = try_update_then_put(ctx, scope, &service, &op).await? {
            return Ok(outcome);
        }
    }

    // Follow-on op against a resource the tagging API cannot see yet.
    if FOLLOW_ON_PREFIXES.iter().any(|p| op.starts_with(p)) {
        if let Some(arn) = first_arn(&scope.args) {
            match waiters::wait_arn_visible(ctx, &arn).await {
                Ok(()) => {
                    ctx.log().remediation(&format!(
                        "{arn} became visible to the tagging api, retrying {op}"
                    ));
                    return retry_original(ctx, scope).await;
                }
                Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
                Err(_) => {} // not every resource type registers with tagging
            }
        }
    }

    // Long-tail create idempotency.
    if scope.failure.category == FailureCategory::AlreadyExists && op.starts_with("create-") {
        ctx.log()
            .remediation(&format!("{service} {op} already exists, treating as success"));
        return Ok(Remediation::Handled);
    }

    // Last-resort propagation retry.
    let output_lc = scope.output.to_lowercase();
    if scope.failure.category == FailureCategory::Conflict
        || GLUE_PROPAGATION_TOKENS.iter().any(|t| output_lc.contains(t))
    {
        ctx.log()
            .remediation(&format!("retrying {service} {op} after conflict symptom"));
        for attempt in 0..6u32 {
            ctx.backoff_sleep(attempt, Duration::from_secs(1)).await?;
            let out = ctx.run_aws(&scope.args, scope.stdin.as_deref()).await?;
            scope.set_output(&out.output);
            if out.success() {
                return Ok(Remediation::Handled);
            }
        }
        return Ok(Remediation::HandledWithError(provider_error(scope)));
    }

    Ok(Remediation::NotHandled)
}

/// Try `update-X`, then `put-X`; `None` means neither operation exists and
/// the caller should keep falling through.
async fn try_update_then_put(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
    service: &str,
    create_op: &str,
) -> Result<Option<Remediation>> {
    let original_args = scope.args.clone();

    for replacement in [
        create_op.replacen("create-", "update-", 1),
        create_op.replacen("create-", "put-", 1),
    ] {
        scope.args[1] = replacement.clone();
        ctx.log()
            .remediation(&format!("rewrote {service} {create_op} to {replacement}"));
        let out = ctx.run_aws(&scope.args, scope.stdin.as_deref()).await?;
        scope.set_output(&out.output);
        if out.success() {
            return Ok(Some(Remediation::Handled));
        }
        let lc = scope.output.to_lowercase();
        if lc.contains("invalid choice") || lc.contains("unknown operation") {
            continue;
        }
        return Ok(Some(Remediation::HandledWithError(provider_error(scope))));
    }

    scope.args = original_args;
    Ok(None)
}

/// First ARN in the argv, looking inside inline JSON values too.
fn first_arn(args: &[String]) -> Option<String> {
    for arg in args.iter().skip(2) {
        if arg.starts_with("arn:") {
            return Some(arg.clone());
        }
        if let Some(json) = jsonx::parse_inline_json(arg) {
            if let Some(arn) = find_arn_in(&json) {
                return Some(arn);
            }
        }
    }
    None
}

fn find_arn_in(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.starts_with("arn:") => Some(s.clone()),
        Value::Object(map) => map.values().find_map(find_arn_in),
        Value::Array(list) => list.iter().find_map(find_arn_in),
        _ => None,
    }
}
