//! IAM teardown expansion.

use serde_json::Value;

use super::{argv, step};
use crate::context::ExecCtx;
use crate::domain::{MakerError, PlanStep, Result};
use crate::normalize::flag_value;

/// Expand `iam delete-role` into detach/delete prerequisites.
pub(super) async fn expand_delete_role(
    ctx: &ExecCtx<'_>,
    original: &PlanStep,
) -> Result<Option<Vec<PlanStep>>> {
    let Some(role_name) = flag_value(&original.args, "--role-name") else {
        return Ok(None);
    };
    let mut steps = Vec::new();

    if let Some(attached) = list_array(
        ctx,
        &argv(&["iam", "list-attached-role-policies", "--role-name", role_name]),
        "AttachedPolicies",
    )
    .await?
    {
        for policy in attached {
            if let Some(arn) = policy.get("PolicyArn").and_then(Value::as_str) {
                steps.push(step(
                    argv(&["iam", "detach-role-policy", "--role-name", role_name, "--policy-arn", arn]),
                    "detach managed policy before role delete",
                ));
            }
        }
    }

    if let Some(inline) = list_array(
        ctx,
        &argv(&["iam", "list-role-policies", "--role-name", role_name]),
        "PolicyNames",
    )
    .await?
    {
        for name in inline.iter().filter_map(Value::as_str) {
            steps.push(step(
                argv(&["iam", "delete-role-policy", "--role-name", role_name, "--policy-name", name]),
                "delete inline policy before role delete",
            ));
        }
    }

    if let Some(profiles) = list_array(
        ctx,
        &argv(&["iam", "list-instance-profiles-for-role", "--role-name", role_name]),
        "InstanceProfiles",
    )
    .await?
    {
        for profile in profiles {
            if let Some(name) = profile.get("InstanceProfileName").and_then(Value::as_str) {
                steps.push(step(
                    argv(&[
                        "iam",
                        "remove-role-from-instance-profile",
                        "--instance-profile-name",
                        name,
                        "--role-name",
                        role_name,
                    ]),
                    "release instance profile before role delete",
                ));
            }
        }
    }

    match ctx
        .run_aws_json(&argv(&["iam", "get-role", "--role-name", role_name]))
        .await
    {
        Ok(json) => {
            if json.pointer("/Role/PermissionsBoundary").is_some() {
                steps.push(step(
                    argv(&["iam", "delete-role-permissions-boundary", "--role-name", role_name]),
                    "clear permissions boundary before role delete",
                ));
            }
        }
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => {}
    }

    if steps.is_empty() {
        return Ok(None);
    }
    steps.push(original.clone());
    Ok(Some(steps))
}

/// Expand `iam delete-policy` into detach/version-delete prerequisites.
pub(super) async fn expand_delete_policy(
    ctx: &ExecCtx<'_>,
    original: &PlanStep,
) -> Result<Option<Vec<PlanStep>>> {
    let Some(policy_arn) = flag_value(&original.args, "--policy-arn") else {
        return Ok(None);
    };
    let mut steps = Vec::new();

    match ctx
        .run_aws_json(&argv(&["iam", "list-entities-for-policy", "--policy-arn", policy_arn]))
        .await
    {
        Ok(entities) => {
            for (field, detach_op, name_field, name_flag) in [
                ("PolicyRoles", "detach-role-policy", "RoleName", "--role-name"),
                ("PolicyUsers", "detach-user-policy", "UserName", "--user-name"),
                ("PolicyGroups", "detach-group-policy", "GroupName", "--group-name"),
            ] {
                if let Some(list) = entities.get(field).and_then(Value::as_array) {
                    for entity in list {
                        if let Some(name) = entity.get(name_field).and_then(Value::as_str) {
                            steps.push(step(
                                argv(&["iam", detach_op, name_flag, name, "--policy-arn", policy_arn]),
                                "detach policy before delete",
                            ));
                        }
                    }
                }
            }
        }
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => {}
    }

    if let Some(versions) = list_array(
        ctx,
        &argv(&["iam", "list-policy-versions", "--policy-arn", policy_arn]),
        "Versions",
    )
    .await?
    {
        for version in versions {
            let is_default = version
                .get("IsDefaultVersion")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if is_default {
                continue;
            }
            if let Some(id) = version.get("VersionId").and_then(Value::as_str) {
                steps.push(step(
                    argv(&["iam", "delete-policy-version", "--policy-arn", policy_arn, "--version-id", id]),
                    "delete non-default policy version",
                ));
            }
        }
    }

    if steps.is_empty() {
        return Ok(None);
    }
    steps.push(original.clone());
    Ok(Some(steps))
}

/// Read-only list helper; missing resources yield `None` rather than errors.
async fn list_array(
    ctx: &ExecCtx<'_>,
    args: &[String],
    field: &str,
) -> Result<Option<Vec<Value>>> {
    match ctx.run_aws_json(args).await {
        Ok(json) => Ok(json.get(field).and_then(Value::as_array).cloned()),
        Err(MakerError::Cancelled) => Err(MakerError::Cancelled),
        Err(_) => Ok(None),
    }
}
