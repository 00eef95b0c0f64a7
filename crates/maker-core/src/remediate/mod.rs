//! Layered failure remediation.
//!
//! The service pack is a registry of guarded arms with a fixed priority
//! order; the order below is the contract. Dispatch walks the list and the
//! first matching arm that takes responsibility ends it. When no arm
//! matches, cross-service glue rules run, and when those are exhausted the
//! failure escalates to the LLM remediator.

pub mod ai;
mod apigw;
mod ec2;
mod eks;
mod generic;
mod iam;
mod idempotency;
mod prereq;
mod propagation;
mod readiness;
mod s3;

use crate::bindings::BindingStore;
use crate::classify::classify_failure;
use crate::context::ExecCtx;
use crate::domain::{Failure, FailureCategory, MakerError, Result};

/// What the pipeline did with a failure.
#[derive(Debug)]
pub enum Remediation {
    /// No arm took responsibility; the failure stands as-is.
    NotHandled,

    /// Handled: the retry succeeded or the desired post-state already holds.
    Handled,

    /// An arm took responsibility but its final attempt still failed; the
    /// executor decides between ignoring and aborting.
    HandledWithError(MakerError),
}

impl Remediation {
    pub fn handled(&self) -> bool {
        !matches!(self, Remediation::NotHandled)
    }
}

/// Mutable working state for one failing step.
///
/// Arms rewrite `args`, refresh `output`/`failure` after retries, and learn
/// into `bindings`; the executor reads the final state back.
pub struct ArmScope<'a> {
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub failure: Failure,
    pub output: String,
    output_lc: String,
    pub bindings: &'a mut BindingStore,
}

impl<'a> ArmScope<'a> {
    pub fn new(
        args: Vec<String>,
        stdin: Option<String>,
        failure: Failure,
        output: String,
        bindings: &'a mut BindingStore,
    ) -> Self {
        let output_lc = output.to_lowercase();
        Self {
            args,
            stdin,
            failure,
            output,
            output_lc,
            bindings,
        }
    }

    /// Record a retry's output and reclassify.
    pub fn set_output(&mut self, output: &str) {
        self.output = output.to_string();
        self.output_lc = self.output.to_lowercase();
        self.failure = classify_failure(&self.args, output);
    }

    fn view(&self, destroyer: bool) -> ArmView<'_> {
        ArmView {
            service: self.args.first().map(String::as_str).unwrap_or(""),
            op: self.args.get(1).map(String::as_str).unwrap_or(""),
            category: self.failure.category,
            code: &self.failure.code,
            output_lc: &self.output_lc,
            args: &self.args,
            destroyer,
        }
    }
}

/// Read-only guard input.
pub struct ArmView<'a> {
    pub service: &'a str,
    pub op: &'a str,
    pub category: FailureCategory,
    pub code: &'a str,
    pub output_lc: &'a str,
    pub args: &'a [String],
    pub destroyer: bool,
}

impl ArmView<'_> {
    pub fn output_has(&self, token: &str) -> bool {
        self.output_lc.contains(token)
    }

    pub fn category_in(&self, set: &[FailureCategory]) -> bool {
        set.contains(&self.category)
    }
}

/// One guarded remediation rule.
pub struct Arm {
    pub kind: ArmKind,
    pub name: &'static str,
    pub matches: fn(&ArmView<'_>) -> bool,
}

/// Closed set of arm behaviors; dispatch matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmKind {
    // Rewrite pivots (most specific guards first).
    Ec2SubnetRange,
    Ec2VpcCidrRange,
    Ec2RouteTableInference,
    Ec2IgwAlreadyAttached,
    Ec2TerminateMissingIds,
    Ec2RunInstancesProfile,
    Ec2SgDependencyViolation,
    EksSubnetRewrite,
    EksDeleteClusterNodegroups,
    CfnTemplateCidrRewrite,
    ApigwRestApiFlag,
    Apigwv2LambdaTarget,
    SsmPutParameterOverwrite,
    EcrNewestImageDigest,
    IamInstanceProfileSingleton,
    S3EmptyBucket,
    IamDeletePolicyConflict,
    SecretsmanagerCreateToPut,
    ElbIdempotentCreateBind,
    // Prerequisite insertion.
    LogsMissingLogGroup,
    ServiceLinkedRole,
    EcsExecutionRolePolicy,
    IamPermissionInjection,
    // Readiness waits.
    LambdaReadiness,
    DynamoDbReadiness,
    RdsReadiness,
    EksClusterReadiness,
    CloudfrontReadiness,
    EfsReadiness,
    OpensearchReadiness,
    MskReadiness,
    ElbListenerCertificate,
    ElbReadiness,
    // Create rewrites and idempotency declarations.
    CreateToUpdate,
    Route53CreateToUpsert,
    IdempotentCreate,
    // Propagation and transients (bottom of the pack).
    LambdaRoleAssumePropagation,
    PropagationRetry,
    ThrottleRetry,
    TransientRetry,
}

/// The service pack, in contract order.
///
/// Guards are intentionally narrow; a guard that matches but whose apply
/// declines (returns NotHandled) lets dispatch continue down the list.
pub const ARMS: &[Arm] = &[
    Arm {
        kind: ArmKind::Ec2SubnetRange,
        name: "ec2 subnet cidr pivot",
        matches: |v| v.service == "ec2" && v.op == "create-subnet" && v.code == "InvalidSubnet.Range",
    },
    Arm {
        kind: ArmKind::Ec2VpcCidrRange,
        name: "ec2 vpc extra cidr pivot",
        matches: |v| {
            v.service == "ec2"
                && v.op == "associate-vpc-cidr-block"
                && (v.code == "InvalidVpc.Range" || v.output_has("restricted"))
        },
    },
    Arm {
        kind: ArmKind::Ec2RouteTableInference,
        name: "ec2 route table inference",
        matches: |v| {
            v.service == "ec2"
                && (v.op == "create-route" || v.op == "associate-route-table")
                && crate::normalize::flag_value(v.args, "--route-table-id")
                    .map(|id| !id.starts_with("rtb-"))
                    .unwrap_or(false)
        },
    },
    Arm {
        kind: ArmKind::Ec2IgwAlreadyAttached,
        name: "ec2 igw already attached",
        matches: |v| {
            v.service == "ec2"
                && v.op == "attach-internet-gateway"
                && (v.output_has("already has an internet gateway attached")
                    || v.code == "Resource.AlreadyAssociated"
                    || v.output_has("alreadyassociated"))
        },
    },
    Arm {
        kind: ArmKind::Ec2TerminateMissingIds,
        name: "ec2 terminate missing ids",
        matches: |v| {
            v.service == "ec2"
                && v.op == "terminate-instances"
                && v.code == "InvalidInstanceID.NotFound"
                && v.destroyer
        },
    },
    Arm {
        kind: ArmKind::Ec2RunInstancesProfile,
        name: "ec2 run-instances profile wait",
        matches: |v| {
            v.service == "ec2"
                && v.op == "run-instances"
                && v.category == FailureCategory::Validation
                && (v.output_has("iaminstanceprofile") || v.output_has("instance profile"))
        },
    },
    Arm {
        kind: ArmKind::Ec2SgDependencyViolation,
        name: "ec2 security group dependency",
        matches: |v| {
            v.service == "ec2"
                && v.op == "delete-security-group"
                && v.code == "DependencyViolation"
                && v.destroyer
        },
    },
    Arm {
        kind: ArmKind::EksSubnetRewrite,
        name: "eks subnet rewrite",
        matches: |v| {
            v.service == "eks"
                && (v.op == "create-cluster" || v.op == "create-nodegroup")
                && (v.code == "InvalidSubnetID.NotFound"
                    || v.output_has("subnets specified must be in at least two")
                    || v.args.iter().any(|a| a.contains("<SUBNET")))
        },
    },
    Arm {
        kind: ArmKind::EksDeleteClusterNodegroups,
        name: "eks delete-cluster drains nodegroups",
        matches: |v| {
            v.service == "eks"
                && v.op == "delete-cluster"
                && v.destroyer
                && (v.output_has("nodegroup") || v.category == FailureCategory::Conflict)
        },
    },
    Arm {
        kind: ArmKind::CfnTemplateCidrRewrite,
        name: "cloudformation template cidr rewrite",
        matches: |v| {
            v.service == "cloudformation"
                && (v.op == "create-stack" || v.op == "update-stack")
                && (v.output_has("invalidsubnet.range")
                    || v.output_has("invalidvpc.range")
                    || v.output_has("conflicts with another subnet"))
        },
    },
    Arm {
        kind: ArmKind::ApigwRestApiFlag,
        name: "apigateway rest-api flag pivot",
        matches: |v| {
            v.service == "apigateway"
                && v.op == "delete-rest-api"
                && (v.args.iter().any(|a| a == "--api-id")
                    || v.output_has("invalid api identifier specified"))
        },
    },
    Arm {
        kind: ArmKind::Apigwv2LambdaTarget,
        name: "apigatewayv2 lambda target arn",
        matches: |v| {
            v.service == "apigatewayv2"
                && v.op == "create-api"
                && v.category == FailureCategory::Validation
                && crate::normalize::flag_value(v.args, "--target").is_some()
        },
    },
    Arm {
        kind: ArmKind::SsmPutParameterOverwrite,
        name: "ssm put-parameter overwrite",
        matches: |v| {
            v.service == "ssm"
                && v.op == "put-parameter"
                && v.category == FailureCategory::AlreadyExists
        },
    },
    Arm {
        kind: ArmKind::EcrNewestImageDigest,
        name: "ecr newest image digest",
        matches: |v| {
            v.service == "ecr"
                && v.op == "describe-images"
                && v.category == FailureCategory::NotFound
        },
    },
    Arm {
        kind: ArmKind::IamInstanceProfileSingleton,
        name: "iam instance profile singleton",
        matches: |v| {
            v.service == "iam"
                && v.op == "add-role-to-instance-profile"
                && v.code == "LimitExceeded"
        },
    },
    Arm {
        kind: ArmKind::S3EmptyBucket,
        name: "s3 empty then delete",
        matches: |v| {
            v.destroyer
                && v.code == "BucketNotEmpty"
                && ((v.service == "s3api" && v.op == "delete-bucket")
                    || (v.service == "s3" && v.op == "rb"))
        },
    },
    Arm {
        kind: ArmKind::IamDeletePolicyConflict,
        name: "iam delete-policy conflict",
        matches: |v| {
            v.service == "iam" && v.op == "delete-policy" && v.code == "DeleteConflict" && v.destroyer
        },
    },
    Arm {
        kind: ArmKind::SecretsmanagerCreateToPut,
        name: "secretsmanager create-secret pivot",
        matches: |v| {
            v.service == "secretsmanager"
                && v.op == "create-secret"
                && v.category_in(&[FailureCategory::AlreadyExists, FailureCategory::Conflict])
        },
    },
    Arm {
        kind: ArmKind::ElbIdempotentCreateBind,
        name: "elbv2 idempotent create with identity",
        matches: |v| {
            v.service == "elbv2"
                && (v.op == "create-target-group" || v.op == "create-load-balancer")
                && (v.category == FailureCategory::AlreadyExists || v.output_has("duplicate"))
        },
    },
    Arm {
        kind: ArmKind::LogsMissingLogGroup,
        name: "logs missing log group",
        matches: |v| {
            v.service == "logs"
                && matches!(
                    v.op,
                    "create-log-stream"
                        | "put-retention-policy"
                        | "put-metric-filter"
                        | "put-subscription-filter"
                )
                && v.category == FailureCategory::NotFound
        },
    },
    Arm {
        kind: ArmKind::ServiceLinkedRole,
        name: "service linked role",
        matches: |v| {
            (v.service == "ecs" || v.service == "batch")
                && (v.output_has("service-linked role")
                    || v.output_has("service linked role")
                    || v.output_has("awsservicerolefor"))
        },
    },
    Arm {
        kind: ArmKind::EcsExecutionRolePolicy,
        name: "ecs execution role policy",
        matches: |v| {
            v.service == "ecs"
                && (v.output_has("unable to pull secrets or registry auth")
                    || v.output_has("cannotpullcontainererror")
                    || (v.category == FailureCategory::AccessDenied && v.output_has("ecr"))
                    || (v.category == FailureCategory::AccessDenied && v.output_has("logs")))
        },
    },
    Arm {
        kind: ArmKind::IamPermissionInjection,
        name: "iam permission injection",
        matches: |v| {
            v.category == FailureCategory::AccessDenied
                && v.service != "iam"
                && v.output_has("is not authorized to perform")
        },
    },
    Arm {
        kind: ArmKind::LambdaReadiness,
        name: "lambda function readiness",
        matches: |v| {
            v.service == "lambda"
                && matches!(v.op, "add-permission" | "create-function-url-config" | "update-function-code" | "update-function-configuration" | "publish-version")
                && v.category_in(&[
                    FailureCategory::Conflict,
                    FailureCategory::NotFound,
                    FailureCategory::Validation,
                ])
                && (v.output_has("pending") || v.output_has("in progress") || v.output_has("resourceconflict") || v.output_has("state"))
        },
    },
    Arm {
        kind: ArmKind::DynamoDbReadiness,
        name: "dynamodb table readiness",
        matches: |v| {
            v.service == "dynamodb"
                && v.op != "create-table"
                && v.category_in(&[FailureCategory::Conflict, FailureCategory::NotFound])
                && crate::normalize::flag_value(v.args, "--table-name").is_some()
        },
    },
    Arm {
        kind: ArmKind::RdsReadiness,
        name: "rds instance readiness",
        matches: |v| {
            v.service == "rds"
                && v.category_in(&[FailureCategory::Conflict, FailureCategory::Validation])
                && (v.output_has("not in available state")
                    || v.output_has("invaliddbinstancestate"))
        },
    },
    Arm {
        kind: ArmKind::EksClusterReadiness,
        name: "eks cluster readiness",
        matches: |v| {
            v.service == "eks"
                && v.op != "create-cluster"
                && v.category_in(&[FailureCategory::NotFound, FailureCategory::Conflict])
                && (v.output_has("not active") || v.output_has("creating") || v.output_has("resourceinuse"))
                && crate::normalize::flag_value(v.args, "--cluster-name").is_some()
        },
    },
    Arm {
        kind: ArmKind::CloudfrontReadiness,
        name: "cloudfront distribution readiness",
        matches: |v| {
            v.service == "cloudfront"
                && v.category == FailureCategory::Conflict
                && v.output_has("in progress")
        },
    },
    Arm {
        kind: ArmKind::EfsReadiness,
        name: "efs file system readiness",
        matches: |v| {
            v.service == "efs"
                && v.op == "create-mount-target"
                && v.output_has("incorrectfilesystemlifecyclestate")
        },
    },
    Arm {
        kind: ArmKind::OpensearchReadiness,
        name: "opensearch domain readiness",
        matches: |v| {
            v.service == "opensearch"
                && v.category == FailureCategory::Conflict
                && crate::normalize::flag_value(v.args, "--domain-name").is_some()
        },
    },
    Arm {
        kind: ArmKind::MskReadiness,
        name: "msk cluster readiness",
        matches: |v| {
            v.service == "kafka"
                && v.output_has("appropriate state")
                && crate::normalize::flag_value(v.args, "--cluster-arn").is_some()
        },
    },
    Arm {
        kind: ArmKind::ElbListenerCertificate,
        name: "elbv2 listener certificate wait",
        matches: |v| {
            v.service == "elbv2"
                && v.op == "create-listener"
                && v.output_has("certificate")
        },
    },
    Arm {
        kind: ArmKind::ElbReadiness,
        name: "elbv2 load balancer readiness",
        matches: |v| {
            v.service == "elbv2"
                && matches!(v.op, "create-listener" | "create-rule" | "register-targets" | "modify-listener")
                && (v.output_has("provisioning") || v.output_has("not in an active state"))
        },
    },
    Arm {
        kind: ArmKind::CreateToUpdate,
        name: "create to update/put rewrite",
        matches: |v| {
            idempotency::create_to_update_target(v.service, v.op).is_some()
                && v.category_in(&[FailureCategory::AlreadyExists, FailureCategory::Conflict])
        },
    },
    Arm {
        kind: ArmKind::Route53CreateToUpsert,
        name: "route53 create to upsert",
        matches: |v| {
            v.service == "route53"
                && v.op == "change-resource-record-sets"
                && v.category_in(&[FailureCategory::AlreadyExists, FailureCategory::Conflict])
                && v.args.iter().any(|a| a.contains("\"CREATE\""))
        },
    },
    Arm {
        kind: ArmKind::IdempotentCreate,
        name: "idempotent create declaration",
        matches: |v| {
            idempotency::is_idempotent_create(v.service, v.op)
                && v.category_in(&[FailureCategory::AlreadyExists, FailureCategory::Conflict])
        },
    },
    Arm {
        kind: ArmKind::LambdaRoleAssumePropagation,
        name: "lambda role assume propagation",
        matches: |v| {
            v.service == "lambda"
                && v.op == "create-function"
                && v.code == "InvalidParameterValueException"
                && v.output_has("cannot be assumed")
        },
    },
    Arm {
        kind: ArmKind::PropagationRetry,
        name: "eventual consistency propagation",
        matches: propagation::matches_propagation,
    },
    Arm {
        kind: ArmKind::ThrottleRetry,
        name: "throttling backoff",
        matches: |v| v.category == FailureCategory::Throttled,
    },
    Arm {
        kind: ArmKind::TransientRetry,
        name: "transient backoff",
        matches: |v| v.category == FailureCategory::Transient,
    },
];

/// Walk the service pack; first arm reporting handled ends dispatch.
pub async fn maybe_rewrite_and_retry(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    for arm in ARMS {
        let matched = (arm.matches)(&scope.view(ctx.opts.destroyer));
        if !matched {
            continue;
        }
        tracing::debug!(arm = arm.name, "remediation arm matched");
        let outcome = apply_arm(arm.kind, ctx, scope).await?;
        if outcome.handled() {
            return Ok(outcome);
        }
    }
    Ok(Remediation::NotHandled)
}

/// Full pipeline: service pack, then glue, then the LLM remediator.
pub async fn remediate(ctx: &ExecCtx<'_>, scope: &mut ArmScope<'_>) -> Result<Remediation> {
    let outcome = maybe_rewrite_and_retry(ctx, scope).await?;
    if outcome.handled() {
        return Ok(outcome);
    }
    let outcome = generic::apply(ctx, scope).await?;
    if outcome.handled() {
        return Ok(outcome);
    }
    // Everything deterministic is exhausted; the AI path retries the
    // original with backoff.
    ai::remediate(ctx, scope, true).await
}

async fn apply_arm(
    kind: ArmKind,
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    match kind {
        ArmKind::Ec2SubnetRange => ec2::subnet_cidr_pivot(ctx, scope).await,
        ArmKind::Ec2VpcCidrRange => ec2::vpc_extra_cidr_pivot(ctx, scope).await,
        ArmKind::Ec2RouteTableInference => ec2::route_table_inference(ctx, scope).await,
        ArmKind::Ec2IgwAlreadyAttached => ec2::igw_already_attached(ctx, scope).await,
        ArmKind::Ec2TerminateMissingIds => ec2::terminate_missing_ids(ctx, scope).await,
        ArmKind::Ec2RunInstancesProfile => ec2::run_instances_profile(ctx, scope).await,
        ArmKind::Ec2SgDependencyViolation => ec2::sg_dependency_violation(ctx, scope).await,
        ArmKind::EksSubnetRewrite => eks::subnet_rewrite(ctx, scope).await,
        ArmKind::EksDeleteClusterNodegroups => eks::delete_cluster_nodegroups(ctx, scope).await,
        ArmKind::CfnTemplateCidrRewrite => ec2::cfn_template_cidr_rewrite(ctx, scope).await,
        ArmKind::ApigwRestApiFlag => apigw::rest_api_flag_pivot(ctx, scope).await,
        ArmKind::Apigwv2LambdaTarget => apigw::lambda_target_arn(ctx, scope).await,
        ArmKind::SsmPutParameterOverwrite => idempotency::ssm_put_parameter_overwrite(ctx, scope).await,
        ArmKind::EcrNewestImageDigest => idempotency::ecr_newest_image_digest(ctx, scope).await,
        ArmKind::IamInstanceProfileSingleton => iam::instance_profile_singleton(ctx, scope).await,
        ArmKind::S3EmptyBucket => s3::empty_then_delete(ctx, scope).await,
        ArmKind::IamDeletePolicyConflict => iam::delete_policy_conflict(ctx, scope).await,
        ArmKind::SecretsmanagerCreateToPut => idempotency::secret_create_to_put(ctx, scope).await,
        ArmKind::ElbIdempotentCreateBind => idempotency::elb_idempotent_create(ctx, scope).await,
        ArmKind::LogsMissingLogGroup => prereq::logs_missing_log_group(ctx, scope).await,
        ArmKind::ServiceLinkedRole => prereq::service_linked_role(ctx, scope).await,
        ArmKind::EcsExecutionRolePolicy => prereq::ecs_execution_role_policy(ctx, scope).await,
        ArmKind::IamPermissionInjection => prereq::iam_permission_injection(ctx, scope).await,
        ArmKind::LambdaReadiness => readiness::lambda(ctx, scope).await,
        ArmKind::DynamoDbReadiness => readiness::dynamodb(ctx, scope).await,
        ArmKind::RdsReadiness => readiness::rds(ctx, scope).await,
        ArmKind::EksClusterReadiness => readiness::eks_cluster(ctx, scope).await,
        ArmKind::CloudfrontReadiness => readiness::cloudfront(ctx, scope).await,
        ArmKind::EfsReadiness => readiness::efs(ctx, scope).await,
        ArmKind::OpensearchReadiness => readiness::opensearch(ctx, scope).await,
        ArmKind::MskReadiness => readiness::msk(ctx, scope).await,
        ArmKind::ElbListenerCertificate => readiness::elb_listener_certificate(ctx, scope).await,
        ArmKind::ElbReadiness => readiness::elb(ctx, scope).await,
        ArmKind::CreateToUpdate => idempotency::create_to_update(ctx, scope).await,
        ArmKind::Route53CreateToUpsert => idempotency::route53_create_to_upsert(ctx, scope).await,
        ArmKind::IdempotentCreate => idempotency::idempotent_create(ctx, scope).await,
        ArmKind::LambdaRoleAssumePropagation => {
            propagation::lambda_role_assume(ctx, scope).await
        }
        ArmKind::PropagationRetry => propagation::propagation_retry(ctx, scope).await,
        ArmKind::ThrottleRetry => propagation::throttle_retry(ctx, scope).await,
        ArmKind::TransientRetry => propagation::transient_retry(ctx, scope).await,
    }
}

/// Retry the (possibly rewritten) command once and record the result.
pub(crate) async fn retry_original(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let out = ctx.run_aws(&scope.args, scope.stdin.as_deref()).await?;
    scope.set_output(&out.output);
    if out.success() {
        Ok(Remediation::Handled)
    } else {
        Ok(Remediation::HandledWithError(provider_error(scope)))
    }
}

/// Retry with exponential backoff; collapses to success or the last error.
pub(crate) async fn retry_with_backoff(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
    attempts: u32,
    base: std::time::Duration,
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

pub(crate) fn provider_error(scope: &ArmScope<'_>) -> MakerError {
    MakerError::Provider {
        op: scope.failure.op.clone(),
        output: scope.output.clone(),
    }
}

pub(crate) fn argv(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_for<'a>(
        args: &'a [String],
        failure: &'a Failure,
        output_lc: &'a str,
        destroyer: bool,
    ) -> ArmView<'a> {
        ArmView {
            service: args.first().map(String::as_str).unwrap_or(""),
            op: args.get(1).map(String::as_str).unwrap_or(""),
            category: failure.category,
            code: &failure.code,
            output_lc,
            args,
            destroyer,
        }
    }

    fn first_matching(
        args: &[String],
        failure: &Failure,
        output: &str,
        destroyer: bool,
    ) -> Option<ArmKind> {
        let lc = output.to_lowercase();
        let view = view_for(args, failure, &lc, destroyer);
        ARMS.iter().find(|arm| (arm.matches)(&view)).map(|a| a.kind)
    }

    fn args(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_arm_selection_is_deterministic() {
        let argv = args(&["scheduler", "create-schedule", "--name", "s1"]);
        let failure = Failure::new(
            "ConflictException",
            FailureCategory::Conflict,
            "create-schedule",
        );
        let output = "ConflictException: schedule s1 already exists";
        let a = first_matching(&argv, &failure, output, false);
        let b = first_matching(&argv, &failure, output, false);
        assert_eq!(a, b);
        assert_eq!(a, Some(ArmKind::CreateToUpdate));
    }

    #[test]
    fn test_subnet_range_beats_generic_validation() {
        let argv = args(&["ec2", "create-subnet", "--vpc-id", "vpc-1", "--cidr-block", "10.0.1.0/24"]);
        let failure = Failure::new(
            "InvalidSubnet.Range",
            FailureCategory::Validation,
            "create-subnet",
        );
        assert_eq!(
            first_matching(&argv, &failure, "InvalidSubnet.Range: bad cidr", false),
            Some(ArmKind::Ec2SubnetRange)
        );
    }

    #[test]
    fn test_terminate_missing_ids_requires_destroyer() {
        let argv = args(&["ec2", "terminate-instances", "--instance-ids", "i-a", "i-b"]);
        let failure = Failure::new(
            "InvalidInstanceID.NotFound",
            FailureCategory::NotFound,
            "terminate-instances",
        );
        let output = "InvalidInstanceID.NotFound: i-b";
        assert_eq!(
            first_matching(&argv, &failure, output, true),
            Some(ArmKind::Ec2TerminateMissingIds)
        );
        assert_ne!(
            first_matching(&argv, &failure, output, false),
            Some(ArmKind::Ec2TerminateMissingIds)
        );
    }

    #[test]
    fn test_s3_empty_bucket_requires_destroyer() {
        let argv = args(&["s3api", "delete-bucket", "--bucket", "b"]);
        let failure = Failure::new("BucketNotEmpty", FailureCategory::Conflict, "delete-bucket");
        assert_eq!(
            first_matching(&argv, &failure, "BucketNotEmpty", true),
            Some(ArmKind::S3EmptyBucket)
        );
        assert_eq!(first_matching(&argv, &failure, "BucketNotEmpty", false), None);
    }

    #[test]
    fn test_idempotent_create_catches_allowlisted_services() {
        let argv = args(&["ecr", "create-repository", "--repository-name", "r"]);
        let failure = Failure::new(
            "RepositoryAlreadyExistsException",
            FailureCategory::AlreadyExists,
            "create-repository",
        );
        assert_eq!(
            first_matching(&argv, &failure, "RepositoryAlreadyExistsException", false),
            Some(ArmKind::IdempotentCreate)
        );
    }

    #[test]
    fn test_lambda_assume_propagation_guard() {
        let argv = args(&["lambda", "create-function", "--function-name", "f"]);
        let failure = Failure::new(
            "InvalidParameterValueException",
            FailureCategory::Validation,
            "create-function",
        );
        let output = "InvalidParameterValueException: The role defined for the function cannot be assumed by Lambda.";
        assert_eq!(
            first_matching(&argv, &failure, output, false),
            Some(ArmKind::LambdaRoleAssumePropagation)
        );
    }

    #[test]
    fn test_throttle_and_transient_are_last_resorts() {
        let argv = args(&["ec2", "describe-vpcs"]);
        let throttled = Failure::new("Throttling", FailureCategory::Throttled, "describe-vpcs");
        assert_eq!(
            first_matching(&argv, &throttled, "Throttling: Rate exceeded", false),
            Some(ArmKind::ThrottleRetry)
        );
        let transient = Failure::new("InternalError", FailureCategory::Transient, "describe-vpcs");
        assert_eq!(
            first_matching(&argv, &transient, "InternalError", false),
            Some(ArmKind::TransientRetry)
        );
    }
}
