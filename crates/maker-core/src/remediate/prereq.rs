//! Prerequisite insertion arms: create the thing the failure says is
//! missing, then retry the original command.

use std::collections::BTreeSet;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};

use super::{argv, retry_original, retry_with_backoff, ArmScope, Remediation};
use crate::context::ExecCtx;
use crate::domain::{MakerError, Result};
use crate::jsonx;
use crate::normalize::flag_value;

/// `logs` writes against a missing log group create it first.
pub(super) async fn logs_missing_log_group(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(group) = flag_value(&scope.args, "--log-group-name").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };

    let create = argv(&["logs", "create-log-group", "--log-group-name", &group]);
    let out = ctx.run_aws(&create, None).await?;
    if !out.success() && !out.output.to_lowercase().contains("alreadyexists") {
        return Ok(Remediation::NotHandled);
    }
    ctx.log().remediation(&format!(
        "created missing log group {group} and retrying {}",
        scope.failure.op
    ));
    retry_with_backoff(ctx, scope, 3, Duration::from_millis(500)).await
}

/// ECS/Batch first use in an account needs the service-linked role.
pub(super) async fn service_linked_role(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let service = scope.args[0].clone();
    let aws_service_name = format!("{service}.amazonaws.com");

    let create = argv(&[
        "iam",
        "create-service-linked-role",
        "--aws-service-name",
        &aws_service_name,
    ]);
    let out = ctx.run_aws(&create, None).await?;
    let lc = out.output.to_lowercase();
    if !out.success() && !lc.contains("has been taken") && !lc.contains("alreadyexists") {
        return Ok(Remediation::NotHandled);
    }
    ctx.log().remediation(&format!(
        "created service-linked role for {aws_service_name} and retrying"
    ));
    retry_with_backoff(ctx, scope, 4, Duration::from_secs(1)).await
}

/// ECS tasks that cannot pull images or write logs are missing the task
/// execution policy on their execution role.
pub(super) async fn ecs_execution_role_policy(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(task_def) = flag_value(&scope.args, "--task-definition").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };

    let json = match ctx
        .run_aws_json(&argv(&["ecs", "describe-task-definition", "--task-definition", &task_def]))
        .await
    {
        Ok(json) => json,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => return Ok(Remediation::NotHandled),
    };
    let Some(role_arn) = jsonx::extract_string(&json, "taskDefinition.executionRoleArn") else {
        return Ok(Remediation::NotHandled);
    };
    let role_name = role_arn.rsplit("role/").next().unwrap_or(&role_arn).to_string();

    let attach = argv(&[
        "iam",
        "attach-role-policy",
        "--role-name",
        &role_name,
        "--policy-arn",
        "arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy",
    ]);
    let out = ctx.run_aws(&attach, None).await?;
    if !out.success() {
        return Ok(Remediation::NotHandled);
    }
    ctx.log().remediation(&format!(
        "attached AmazonECSTaskExecutionRolePolicy to {role_name} and retrying"
    ));
    retry_with_backoff(ctx, scope, 4, Duration::from_secs(1)).await
}

/// Parse `service:Action` tokens straight out of an access-denied message
/// and grant them to the failing role with an inline policy.
pub(super) async fn iam_permission_injection(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(role_name) = failing_role_name(&scope.args, &scope.output) else {
        return Ok(Remediation::NotHandled);
    };

    let mut actions = extract_denied_actions(&scope.output);
    if actions.is_empty() {
        actions = heuristic_actions(&scope.output.to_lowercase());
    }
    if actions.is_empty() {
        return Ok(Remediation::NotHandled);
    }

    let resources = scoped_resources(&scope.args, &actions);
    let document = json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": actions.iter().collect::<Vec<_>>(),
            "Resource": resources,
        }]
    });

    let service = scope.args[0].clone();
    let put = vec![
        "iam".to_string(),
        "put-role-policy".to_string(),
        "--role-name".to_string(),
        role_name.clone(),
        "--policy-name".to_string(),
        format!("maker-auto-{service}"),
        "--policy-document".to_string(),
        document.to_string(),
    ];
    let out = ctx.run_aws(&put, None).await?;
    if !out.success() {
        return Ok(Remediation::NotHandled);
    }
    ctx.log().remediation(&format!(
        "granted {} to role {role_name} via inline policy and retrying",
        actions.iter().cloned().collect::<Vec<_>>().join(",")
    ));
    retry_with_backoff(ctx, scope, 5, Duration::from_secs(1)).await
}

/// `service:Action` tokens in the error text, excluding ARN fragments.
fn extract_denied_actions(output: &str) -> BTreeSet<String> {
    let re = Regex::new(r"\b([a-z0-9-]+):([a-zA-Z0-9*]+)\b").expect("action regex");
    let mut actions = BTreeSet::new();
    for capture in re.captures_iter(output) {
        let service = &capture[1];
        if service == "arn" || service == "aws" {
            continue;
        }
        let action = &capture[2];
        if action.chars().next().is_some_and(|c| c.is_ascii_uppercase() || c == '*') {
            actions.insert(format!("{service}:{action}"));
        }
    }
    actions
}

/// Keyword fallback when the message names no actions directly.
fn heuristic_actions(output_lc: &str) -> BTreeSet<String> {
    let table: &[(&str, &[&str])] = &[
        ("sqs", &["sqs:ReceiveMessage", "sqs:DeleteMessage", "sqs:GetQueueAttributes"]),
        (
            "kinesis",
            &[
                "kinesis:GetRecords",
                "kinesis:GetShardIterator",
                "kinesis:DescribeStream",
                "kinesis:ListShards",
            ],
        ),
        (
            "dynamodb stream",
            &[
                "dynamodb:GetRecords",
                "dynamodb:GetShardIterator",
                "dynamodb:DescribeStream",
                "dynamodb:ListStreams",
            ],
        ),
        ("s3", &["s3:GetObject", "s3:PutObject", "s3:ListBucket"]),
        ("logs", &["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"]),
        (
            "ecr",
            &[
                "ecr:GetAuthorizationToken",
                "ecr:GetDownloadUrlForLayer",
                "ecr:BatchGetImage",
            ],
        ),
    ];
    for (keyword, actions) in table {
        if output_lc.contains(keyword) {
            return actions.iter().map(|a| a.to_string()).collect();
        }
    }
    BTreeSet::new()
}

/// Role the denial is about: `assumed-role/<name>` in the message, or a
/// role flag on the command itself.
fn failing_role_name(args: &[String], output: &str) -> Option<String> {
    if let Some(pos) = output.find("assumed-role/") {
        let rest = &output[pos + "assumed-role/".len()..];
        let name: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_' || *c == '+')
            .collect();
        if !name.is_empty() {
            return Some(name);
        }
    }
    for flag in ["--role-arn", "--role", "--execution-role-arn"] {
        if let Some(value) = flag_value(args, flag) {
            let name = value.rsplit("role/").next().unwrap_or(value);
            if !name.is_empty() && !name.starts_with('<') {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Narrow the granted resources where the args make it possible.
fn scoped_resources(args: &[String], actions: &BTreeSet<String>) -> Vec<String> {
    let mut resources = Vec::new();

    if actions.iter().any(|a| a.starts_with("s3:")) {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--bucket" {
                if let Some(bucket) = args.get(i + 1) {
                    resources.push(format!("arn:aws:s3:::{bucket}"));
                    resources.push(format!("arn:aws:s3:::{bucket}/*"));
                }
            }
            if let Some(rest) = arg.strip_prefix("s3://") {
                let bucket = rest.split('/').next().unwrap_or(rest);
                resources.push(format!("arn:aws:s3:::{bucket}"));
                resources.push(format!("arn:aws:s3:::{bucket}/*"));
            }
        }
    }
    if actions.iter().any(|a| a == "iam:PassRole") {
        for arg in args {
            if arg.starts_with("arn:") && arg.contains(":role/") {
                resources.push(arg.clone());
            }
        }
    }

    if resources.is_empty() {
        resources.push("*".to_string());
    }
    resources.sort();
    resources.dedup();
    resources
}
