//! Eventual-consistency, throttling, and transient retries.

use std::time::Duration;

use super::{provider_error, ArmScope, ArmView, Remediation};
use crate::context::ExecCtx;
use crate::domain::{FailureCategory, Result};

/// Services with known propagation windows.
const PROPAGATION_SERVICES: &[&str] = &[
    "acm",
    "secretsmanager",
    "kms",
    "cognito-idp",
    "wafv2",
    "events",
    "efs",
    "opensearch",
    "kafka",
    "cloudwatch",
    "sns",
    "glue",
    "athena",
];

/// Output substrings marking an eventual-consistency symptom. Any single
/// match qualifies; the table is deliberately explicit about its patterns.
const PROPAGATION_TOKENS: &[&str] = &[
    "propagat",
    "eventual",
    "recently created",
    "recently deleted",
    "try again",
    "retry the request",
    "is being created",
    "is being modified",
    "in progress",
    "not stabilized",
    "pending",
    "priorrequestnotcomplete",
    "toomanyupdates",
    "transactioninprogress",
    "wafoptimisticlock",
];

/// Guard for the generic propagation arm.
///
/// Matches a propagation-prone service (plus `route53
/// change-resource-record-sets`), a retriable category, and at least one
/// known symptom token in the output.
pub(super) fn matches_propagation(view: &ArmView<'_>) -> bool {
    let service_applies = PROPAGATION_SERVICES.contains(&view.service)
        || (view.service == "route53" && view.op == "change-resource-record-sets");
    if !service_applies {
        return false;
    }
    if !view.category_in(&[
        FailureCategory::NotFound,
        FailureCategory::Conflict,
        FailureCategory::Throttled,
        FailureCategory::Transient,
    ]) {
        return false;
    }
    PROPAGATION_TOKENS.iter().any(|t| view.output_has(t))
}

/// Six retries doubling from one second.
pub(super) async fn propagation_retry(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    ctx.log().remediation(&format!(
        "retrying {} {} after eventual-consistency symptom",
        scope.args[0], scope.failure.op
    ));
    bounded_retry(ctx, scope, 6, Duration::from_secs(1)).await
}

/// Lambda's "role cannot be assumed" right after role creation is IAM
/// propagation: up to five retries at 2s, 4s, 8s, 16s, 32s. Exhaustion
/// falls through to the LLM remediator rather than aborting.
pub(super) async fn lambda_role_assume(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    ctx.log()
        .remediation("waiting out iam trust propagation for lambda create-function");
    for attempt in 0..5u32 {
        ctx.backoff_sleep(attempt, Duration::from_secs(2)).await?;
        let out = ctx.run_aws(&scope.args, scope.stdin.as_deref()).await?;
        scope.set_output(&out.output);
        if out.success() {
            return Ok(Remediation::Handled);
        }
        if !scope.output.to_lowercase().contains("cannot be assumed") {
            break;
        }
    }
    Ok(Remediation::NotHandled)
}

/// Throttling backs off harder than propagation.
pub(super) async fn throttle_retry(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    ctx.log().remediation(&format!(
        "backing off throttled {} {}",
        scope.args[0], scope.failure.op
    ));
    bounded_retry(ctx, scope, 6, Duration::from_secs(2)).await
}

/// Service-side transients get a short retry ladder.
pub(super) async fn transient_retry(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    ctx.log().remediation(&format!(
        "retrying transient failure of {} {}",
        scope.args[0], scope.failure.op
    ));
    bounded_retry(ctx, scope, 4, Duration::from_secs(1)).await
}

/// Shared doubling-backoff retry; collapses to success or the last error.
async fn bounded_retry(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
    attempts: u32,
    base: Duration,
) -> Result<Remediation> {
    for attempt in 0..attempts {
        ctx.backoff_sleep(attempt, base).await?;
        let out = ctx.run_aws(&scope.args, scope.stdin.as_deref()).await?;
        scope.set_output(&out.output);
        if out.success() {
            return Ok(Remediation::Handled);
        }
    }
    Ok(Remediation::HandledWithError(provider_error(scope)))
}
