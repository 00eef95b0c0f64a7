//! IAM arms: instance-profile singleton handling and policy teardown.

use std::time::Duration;

use serde_json::Value;

use super::{argv, provider_error, retry_original, retry_with_backoff, ArmScope, Remediation};
use crate::context::ExecCtx;
use crate::domain::{MakerError, Result};
use crate::normalize::flag_value;

/// `add-role-to-instance-profile` hit the one-role-per-profile limit.
///
/// If the desired role is already attached the post-state holds. Otherwise
/// destroyer mode evicts the other roles and retries; without it the arm
/// refuses rather than mutate existing attachments.
pub(super) async fn instance_profile_singleton(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(profile) = flag_value(&scope.args, "--instance-profile-name").map(String::from)
    else {
        return Ok(Remediation::NotHandled);
    };
    let Some(wanted_role) = flag_value(&scope.args, "--role-name").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };

    let json = match ctx
        .run_aws_json(&argv(&["iam", "get-instance-profile", "--instance-profile-name", &profile]))
        .await
    {
        Ok(json) => json,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => return Ok(Remediation::HandledWithError(provider_error(scope))),
    };
    let attached: Vec<String> = json
        .pointer("/InstanceProfile/Roles")
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(|r| r.get("RoleName").and_then(Value::as_str))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    if attached.iter().any(|r| r == &wanted_role) {
        ctx.log().remediation(&format!(
            "role {wanted_role} already attached to instance profile {profile}"
        ));
        return Ok(Remediation::Handled);
    }

    if !ctx.opts.destroyer {
        ctx.log().note(&format!(
            "instance profile {profile} holds another role; refusing to evict without destroyer"
        ));
        return Ok(Remediation::HandledWithError(provider_error(scope)));
    }

    for role in &attached {
        let remove = argv(&[
            "iam",
            "remove-role-from-instance-profile",
            "--instance-profile-name",
            &profile,
            "--role-name",
            role,
        ]);
        let out = ctx.run_aws(&remove, None).await?;
        if !out.success() {
            scope.set_output(&out.output);
            return Ok(Remediation::HandledWithError(provider_error(scope)));
        }
        ctx.log().remediation(&format!(
            "removed role {role} from instance profile {profile}"
        ));
    }
    retry_with_backoff(ctx, scope, 4, Duration::from_secs(1)).await
}

/// `delete-policy` blocked by attachments: detach everywhere, prune
/// non-default versions, retry. Destroyer-gated by the arm's guard.
pub(super) async fn delete_policy_conflict(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(policy_arn) = flag_value(&scope.args, "--policy-arn").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };

    let entities = match ctx
        .run_aws_json(&argv(&["iam", "list-entities-for-policy", "--policy-arn", &policy_arn]))
        .await
    {
        Ok(json) => json,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => Value::Null,
    };

    for (field, detach_op, name_field, name_flag) in [
        ("PolicyRoles", "detach-role-policy", "RoleName", "--role-name"),
        ("PolicyUsers", "detach-user-policy", "UserName", "--user-name"),
        ("PolicyGroups", "detach-group-policy", "GroupName", "--group-name"),
    ] {
        let Some(list) = entities.get(field).and_then(Value::as_array) else {
            continue;
        };
        for entity in list {
            let Some(name) = entity.get(name_field).and_then(Value::as_str) else {
                continue;
            };
            let detach = argv(&["iam", detach_op, name_flag, name, "--policy-arn", &policy_arn]);
            let out = ctx.run_aws(&detach, None).await?;
            if out.success() {
                ctx.log()
                    .remediation(&format!("detached {policy_arn} from {name}"));
            }
        }
    }

    if let Ok(versions) = ctx
        .run_aws_json(&argv(&["iam", "list-policy-versions", "--policy-arn", &policy_arn]))
        .await
    {
        if let Some(list) = versions.get("Versions").and_then(Value::as_array) {
            for version in list {
                let is_default = version
                    .get("IsDefaultVersion")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if is_default {
                    continue;
                }
                if let Some(id) = version.get("VersionId").and_then(Value::as_str) {
                    let delete = argv(&[
                        "iam",
                        "delete-policy-version",
                        "--policy-arn",
                        &policy_arn,
                        "--version-id",
                        id,
                    ]);
                    let _ = ctx.run_aws(&delete, None).await?;
                }
            }
        }
    }

    retry_original(ctx, scope).await
}
