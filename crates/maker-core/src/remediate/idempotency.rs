//! Idempotency declarations and create→update/put rewrites.

use serde_json::Value;

use super::{argv, provider_error, retry_original, ArmScope, Remediation};
use crate::context::ExecCtx;
use crate::domain::{MakerError, Result};
use crate::jsonx;
use crate::normalize::flag_value;

/// Create operations where "already exists" means the desired post-state
/// holds. Selected operations only; services whose creates pivot to an
/// update (scheduler create-schedule, pipes create-pipe, ...) are absent.
const IDEMPOTENT_CREATES: &[(&str, &[&str])] = &[
    ("eks", &["create-cluster", "create-nodegroup", "create-addon"]),
    ("ecs", &["create-cluster", "create-capacity-provider"]),
    (
        "iam",
        &[
            "create-role",
            "create-instance-profile",
            "create-policy",
            "create-service-linked-role",
        ],
    ),
    ("logs", &["create-log-group", "create-log-stream"]),
    ("s3api", &["create-bucket"]),
    ("ecr", &["create-repository"]),
    ("dynamodb", &["create-table"]),
    ("sqs", &["create-queue"]),
    ("sns", &["create-topic"]),
    ("scheduler", &["create-schedule-group"]),
    ("bedrock", &["create-agent"]),
    ("sagemaker", &["create-model", "create-endpoint-config"]),
    ("cognito-idp", &["create-user-pool-domain", "create-group"]),
    ("glue", &["create-database", "create-crawler"]),
    ("athena", &["create-work-group", "create-data-catalog"]),
    ("wafv2", &["create-ip-set", "create-web-acl"]),
    ("efs", &["create-file-system", "create-mount-target"]),
    ("opensearch", &["create-domain"]),
    ("kafka", &["create-cluster", "create-cluster-v2"]),
];

/// Explicit create→update rewrites; the value is the replacement operation.
const CREATE_TO_UPDATE: &[(&str, &str, &str)] = &[
    ("cloudformation", "create-stack", "update-stack"),
    ("apigatewayv2", "create-stage", "update-stage"),
    ("batch", "create-compute-environment", "update-compute-environment"),
    ("batch", "create-job-queue", "update-job-queue"),
    ("scheduler", "create-schedule", "update-schedule"),
    ("pipes", "create-pipe", "update-pipe"),
    ("kms", "create-alias", "update-alias"),
    ("sagemaker", "create-endpoint", "update-endpoint"),
    ("ec2", "create-route", "replace-route"),
];

pub(super) fn is_idempotent_create(service: &str, op: &str) -> bool {
    IDEMPOTENT_CREATES
        .iter()
        .any(|(s, ops)| *s == service && ops.contains(&op))
}

pub(super) fn create_to_update_target(service: &str, op: &str) -> Option<&'static str> {
    CREATE_TO_UPDATE
        .iter()
        .find(|(s, o, _)| *s == service && *o == op)
        .map(|(_, _, target)| *target)
}

/// Declare success: the resource already exists as desired.
pub(super) async fn idempotent_create(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    ctx.log().remediation(&format!(
        "treating {} {} as idempotent success, resource already exists",
        scope.args.first().map(String::as_str).unwrap_or(""),
        scope.failure.op,
    ));
    Ok(Remediation::Handled)
}

/// Rewrite `create-X` to its explicit update target, falling back to
/// `put-X` when the CLI rejects the update operation name.
pub(super) async fn create_to_update(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let service = scope.args[0].clone();
    let op = scope.args[1].clone();
    let Some(update_op) = create_to_update_target(&service, &op) else {
        return Ok(Remediation::NotHandled);
    };

    scope.args[1] = update_op.to_string();
    ctx.log()
        .remediation(&format!("rewrote {service} {op} to {update_op}"));
    let outcome = retry_original(ctx, scope).await?;
    if matches!(outcome, Remediation::Handled) {
        return Ok(outcome);
    }

    // An unknown update operation falls back to put-X.
    if scope.output.to_lowercase().contains("invalid choice")
        || scope.output.to_lowercase().contains("unknown operation")
    {
        let put_op = op.replacen("create-", "put-", 1);
        scope.args[1] = put_op.clone();
        ctx.log()
            .remediation(&format!("rewrote {service} {op} to {put_op}"));
        return retry_original(ctx, scope).await;
    }
    Ok(outcome)
}

/// `secretsmanager create-secret` with a value becomes `put-secret-value`;
/// without one the existing secret is the desired state and its ARN is
/// fetched for downstream bindings.
pub(super) async fn secret_create_to_put(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(name) = flag_value(&scope.args, "--name").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };

    if let Some(secret_string) = flag_value(&scope.args, "--secret-string").map(String::from) {
        scope.args = vec![
            "secretsmanager".to_string(),
            "put-secret-value".to_string(),
            "--secret-id".to_string(),
            name.clone(),
            "--secret-string".to_string(),
            secret_string,
        ];
        ctx.log().remediation(&format!(
            "rewrote secretsmanager create-secret to put-secret-value for {name}"
        ));
        let outcome = retry_original(ctx, scope).await?;
        if matches!(outcome, Remediation::Handled) {
            bind_secret_arn(ctx, scope, &name).await;
        }
        return Ok(outcome);
    }

    ctx.log().remediation(&format!(
        "secret {name} already exists, binding its arn and declaring success"
    ));
    bind_secret_arn(ctx, scope, &name).await;
    Ok(Remediation::Handled)
}

async fn bind_secret_arn(ctx: &ExecCtx<'_>, scope: &mut ArmScope<'_>, name: &str) {
    if let Ok(json) = ctx
        .run_aws_json(&argv(&["secretsmanager", "describe-secret", "--secret-id", name]))
        .await
    {
        if let Some(arn) = jsonx::extract_string(&json, "ARN") {
            scope.bindings.set_if_absent("SECRET_ARN", &arn);
        }
    }
}

/// ELBv2 duplicate creates succeed idempotently, with the existing
/// resource's identity fetched and bound for downstream steps.
pub(super) async fn elb_idempotent_create(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(name) = flag_value(&scope.args, "--name").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    let op = scope.args[1].clone();

    match op.as_str() {
        "create-target-group" => {
            if let Ok(json) = ctx
                .run_aws_json(&argv(&["elbv2", "describe-target-groups", "--names", &name]))
                .await
            {
                if let Some(arn) = jsonx::extract_string(&json, "TargetGroups[0].TargetGroupArn") {
                    scope.bindings.set_if_absent("TG_ARN", &arn);
                }
            }
        }
        "create-load-balancer" => {
            if let Ok(json) = ctx
                .run_aws_json(&argv(&["elbv2", "describe-load-balancers", "--names", &name]))
                .await
            {
                if let Some(arn) =
                    jsonx::extract_string(&json, "LoadBalancers[0].LoadBalancerArn")
                {
                    scope.bindings.set_if_absent("ALB_ARN", &arn);
                }
                if let Some(dns) = jsonx::extract_string(&json, "LoadBalancers[0].DNSName") {
                    scope.bindings.set_if_absent("ALB_DNS", &dns);
                }
            }
        }
        _ => return Ok(Remediation::NotHandled),
    }

    ctx.log().remediation(&format!(
        "elbv2 {op} {name} already exists, bound existing identity"
    ));
    Ok(Remediation::Handled)
}

/// `route53 change-resource-record-sets` with CREATE actions becomes UPSERT.
pub(super) async fn route53_create_to_upsert(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let mut rewrote = false;
    for arg in scope.args.iter_mut() {
        if arg.contains("\"CREATE\"") {
            *arg = arg.replace("\"CREATE\"", "\"UPSERT\"");
            rewrote = true;
        }
    }
    if !rewrote {
        return Ok(Remediation::NotHandled);
    }
    ctx.log()
        .remediation("rewrote route53 change batch CREATE to UPSERT");
    retry_original(ctx, scope).await
}

/// `ssm put-parameter` on an existing parameter gets `--overwrite`.
pub(super) async fn ssm_put_parameter_overwrite(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    if !scope.args.iter().any(|a| a == "--overwrite") {
        scope.args.push("--overwrite".to_string());
    }
    ctx.log()
        .remediation("retrying ssm put-parameter with --overwrite");
    retry_original(ctx, scope).await
}

/// `ecr describe-images` for a missing tag binds the newest digest instead.
pub(super) async fn ecr_newest_image_digest(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(repo) = flag_value(&scope.args, "--repository-name").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };

    let json = match ctx
        .run_aws_json(&argv(&["ecr", "describe-images", "--repository-name", &repo]))
        .await
    {
        Ok(json) => json,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => return Ok(Remediation::HandledWithError(provider_error(scope))),
    };

    let Some(details) = json.get("imageDetails").and_then(Value::as_array) else {
        return Ok(Remediation::HandledWithError(provider_error(scope)));
    };
    let newest = details.iter().max_by(|a, b| {
        let pushed_a = a.get("imagePushedAt").and_then(Value::as_str).unwrap_or("");
        let pushed_b = b.get("imagePushedAt").and_then(Value::as_str).unwrap_or("");
        pushed_a.cmp(pushed_b)
    });
    let Some(digest) = newest
        .and_then(|d| d.get("imageDigest"))
        .and_then(Value::as_str)
    else {
        return Ok(Remediation::HandledWithError(provider_error(scope)));
    };

    scope.bindings.set_if_absent("IMAGE_DIGEST", digest);
    ctx.log().remediation(&format!(
        "requested image tag missing in {repo}, bound newest digest {digest}"
    ));
    Ok(Remediation::Handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_failure;
    use crate::domain::{ExecOptions, LogSink};
    use crate::fakes::ScriptedRunner;
    use crate::BindingStore;

    fn scope_for<'a>(
        tokens: &[&str],
        output: &str,
        bindings: &'a mut BindingStore,
    ) -> ArmScope<'a> {
        let args: Vec<String> = tokens.iter().map(|s| s.to_string()).collect();
        let failure = classify_failure(&args, output);
        ArmScope::new(args, None, failure, output.to_string(), bindings)
    }

    fn opts() -> ExecOptions {
        ExecOptions {
            log: LogSink::capture().0,
            ..Default::default()
        }
    }

    #[test]
    fn test_tables() {
        assert!(is_idempotent_create("ecr", "create-repository"));
        assert!(!is_idempotent_create("scheduler", "create-schedule"));
        assert_eq!(
            create_to_update_target("scheduler", "create-schedule"),
            Some("update-schedule")
        );
        assert_eq!(create_to_update_target("ecr", "create-repository"), None);
    }

    #[tokio::test]
    async fn test_create_to_update_scheduler() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(&["update-schedule"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["scheduler", "create-schedule", "--name", "s1"],
            "ConflictException: schedule s1 already exists",
            &mut bindings,
        );
        let outcome = create_to_update(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert_eq!(scope.args[1], "update-schedule");
        assert_eq!(runner.count_calls("update-schedule"), 1);
    }

    #[tokio::test]
    async fn test_create_to_update_falls_back_to_put() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(
            &["update-alias"],
            ScriptedRunner::fail("aws: error: argument operation: Invalid choice"),
        );
        runner.stub(&["put-alias"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["kms", "create-alias", "--alias-name", "alias/x"],
            "AlreadyExistsException",
            &mut bindings,
        );
        let outcome = create_to_update(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert_eq!(scope.args[1], "put-alias");
    }

    #[tokio::test]
    async fn test_secret_create_rewrites_to_put_value() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(&["put-secret-value"], ScriptedRunner::ok("{}"));
        runner.stub(
            &["describe-secret"],
            ScriptedRunner::ok(r#"{"ARN":"arn:aws:secretsmanager:us-east-1:1:secret:s"}"#),
        );
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["secretsmanager", "create-secret", "--name", "s", "--secret-string", "v"],
            "ResourceExistsException: already exists",
            &mut bindings,
        );
        let outcome = secret_create_to_put(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert_eq!(scope.args[1], "put-secret-value");
        assert!(scope.args.contains(&"--secret-id".to_string()));
        assert_eq!(
            bindings.get("SECRET_ARN"),
            Some("arn:aws:secretsmanager:us-east-1:1:secret:s")
        );
    }

    #[tokio::test]
    async fn test_elb_duplicate_binds_identity() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(
            &["describe-target-groups"],
            ScriptedRunner::ok(
                r#"{"TargetGroups":[{"TargetGroupArn":"arn:aws:elasticloadbalancing:us-east-1:1:targetgroup/tg/1"}]}"#,
            ),
        );
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["elbv2", "create-target-group", "--name", "tg"],
            "DuplicateTargetGroupName",
            &mut bindings,
        );
        let outcome = elb_idempotent_create(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert!(bindings.get("TG_ARN").is_some());
    }

    #[tokio::test]
    async fn test_route53_upsert_rewrite() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(&["change-resource-record-sets"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &[
                "route53",
                "change-resource-record-sets",
                "--hosted-zone-id",
                "Z1",
                "--change-batch",
                r#"{"Changes":[{"Action":"CREATE","ResourceRecordSet":{}}]}"#,
            ],
            "InvalidChangeBatch: it already exists",
            &mut bindings,
        );
        let outcome = route53_create_to_upsert(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert!(scope.args[5].contains("\"UPSERT\""));
        assert!(!scope.args[5].contains("\"CREATE\""));
    }

    #[tokio::test]
    async fn test_ssm_overwrite_appended_once() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(&["put-parameter"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["ssm", "put-parameter", "--name", "p", "--value", "v"],
            "ParameterAlreadyExists",
            &mut bindings,
        );
        let outcome = ssm_put_parameter_overwrite(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert_eq!(scope.args.iter().filter(|a| *a == "--overwrite").count(), 1);
    }

    #[tokio::test]
    async fn test_ecr_binds_newest_digest() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(
            &["describe-images", "--repository-name", "repo", "--output"],
            ScriptedRunner::ok(
                r#"{"imageDetails":[
                    {"imageDigest":"sha256:old","imagePushedAt":"2026-01-01T00:00:00"},
                    {"imageDigest":"sha256:new","imagePushedAt":"2026-06-01T00:00:00"}
                ]}"#,
            ),
        );
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["ecr", "describe-images", "--repository-name", "repo", "--image-ids", "imageTag=v9"],
            "ImageNotFoundException: the image with imageTag 'v9' does not exist",
            &mut bindings,
        );
        let outcome = ecr_newest_image_digest(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert_eq!(bindings.get("IMAGE_DIGEST"), Some("sha256:new"));
    }
}
