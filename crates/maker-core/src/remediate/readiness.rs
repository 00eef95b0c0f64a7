//! Waiter-backed arms: wait for the referenced resource to reach its
//! terminal state, then retry the original command once.

use super::{retry_original, ArmScope, Remediation};
use crate::context::ExecCtx;
use crate::domain::{MakerError, Result};
use crate::normalize::flag_value;
use crate::waiters;

/// Shared shape: run the waiter, then retry. A waiter failure is a handled
/// error; the step took its best shot.
macro_rules! wait_then_retry {
    ($ctx:expr, $scope:expr, $wait:expr, $what:expr) => {{
        $ctx.log()
            .remediation(&format!("waiting for {} before retry", $what));
        match $wait.await {
            Ok(()) => retry_original($ctx, $scope).await,
            Err(MakerError::Cancelled) => Err(MakerError::Cancelled),
            Err(err) => Ok(Remediation::HandledWithError(err)),
        }
    }};
}

pub(super) async fn lambda(ctx: &ExecCtx<'_>, scope: &mut ArmScope<'_>) -> Result<Remediation> {
    let Some(name) = flag_value(&scope.args, "--function-name").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    wait_then_retry!(
        ctx,
        scope,
        waiters::wait_lambda_active(ctx, &name),
        format!("lambda function {name} to be active")
    )
}

pub(super) async fn dynamodb(ctx: &ExecCtx<'_>, scope: &mut ArmScope<'_>) -> Result<Remediation> {
    let Some(table) = flag_value(&scope.args, "--table-name").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    wait_then_retry!(
        ctx,
        scope,
        waiters::wait_dynamodb_table_active(ctx, &table),
        format!("dynamodb table {table} to be active")
    )
}

pub(super) async fn rds(ctx: &ExecCtx<'_>, scope: &mut ArmScope<'_>) -> Result<Remediation> {
    let Some(id) = flag_value(&scope.args, "--db-instance-identifier").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    wait_then_retry!(
        ctx,
        scope,
        waiters::wait_rds_available(ctx, &id),
        format!("rds instance {id} to be available")
    )
}

pub(super) async fn eks_cluster(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(name) = flag_value(&scope.args, "--cluster-name").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    wait_then_retry!(
        ctx,
        scope,
        waiters::wait_eks_cluster_active(ctx, &name),
        format!("eks cluster {name} to be active")
    )
}

pub(super) async fn cloudfront(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let id = flag_value(&scope.args, "--id")
        .or_else(|| flag_value(&scope.args, "--distribution-id"))
        .map(String::from);
    let Some(id) = id else {
        return Ok(Remediation::NotHandled);
    };
    wait_then_retry!(
        ctx,
        scope,
        waiters::wait_cloudfront_deployed(ctx, &id),
        format!("cloudfront distribution {id} to deploy")
    )
}

pub(super) async fn efs(ctx: &ExecCtx<'_>, scope: &mut ArmScope<'_>) -> Result<Remediation> {
    let Some(id) = flag_value(&scope.args, "--file-system-id").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    wait_then_retry!(
        ctx,
        scope,
        waiters::wait_efs_available(ctx, &id),
        format!("efs file system {id} to be available")
    )
}

pub(super) async fn opensearch(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(domain) = flag_value(&scope.args, "--domain-name").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    wait_then_retry!(
        ctx,
        scope,
        waiters::wait_opensearch_ready(ctx, &domain),
        format!("opensearch domain {domain} to be ready")
    )
}

pub(super) async fn msk(ctx: &ExecCtx<'_>, scope: &mut ArmScope<'_>) -> Result<Remediation> {
    let Some(arn) = flag_value(&scope.args, "--cluster-arn").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    wait_then_retry!(
        ctx,
        scope,
        waiters::wait_msk_active(ctx, &arn),
        "msk cluster to be active"
    )
}

/// Listener creation complaining about the certificate waits for ACM ISSUED.
pub(super) async fn elb_listener_certificate(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(cert_arn) = certificate_arn(&scope.args) else {
        return Ok(Remediation::NotHandled);
    };
    wait_then_retry!(
        ctx,
        scope,
        waiters::wait_acm_issued(ctx, &cert_arn),
        format!("certificate {cert_arn} to be issued")
    )
}

pub(super) async fn elb(ctx: &ExecCtx<'_>, scope: &mut ArmScope<'_>) -> Result<Remediation> {
    let Some(arn) = flag_value(&scope.args, "--load-balancer-arn").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    wait_then_retry!(
        ctx,
        scope,
        waiters::wait_elbv2_active(ctx, &arn),
        "load balancer to be active"
    )
}

/// Certificate ARN from `--certificates CertificateArn=...` shorthand.
fn certificate_arn(args: &[String]) -> Option<String> {
    let value = flag_value(args, "--certificates")?;
    for part in value.split(',') {
        if let Some(arn) = part.trim().strip_prefix("CertificateArn=") {
            return Some(arn.to_string());
        }
    }
    None
}
