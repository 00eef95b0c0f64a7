//! EC2 security-group teardown expansion.

use serde_json::{json, Value};

use super::{argv, step};
use crate::context::ExecCtx;
use crate::domain::{MakerError, PlanStep, Result};
use crate::normalize::flag_value;

/// Expand `ec2 delete-security-group` by revoking cross-references first.
///
/// Rules in *other* groups that reference this group id via
/// `UserIdGroupPairs` block the delete with a DependencyViolation; each is
/// revoked up front. ENIs still using the group are surfaced as a plan note;
/// deleting them is out of enrichment's hands.
pub(super) async fn expand_delete_security_group(
    ctx: &ExecCtx<'_>,
    original: &PlanStep,
    notes: &mut Vec<String>,
) -> Result<Option<Vec<PlanStep>>> {
    let Some(group_id) = flag_value(&original.args, "--group-id") else {
        return Ok(None);
    };

    let described = match ctx
        .run_aws_json(&argv(&["ec2", "describe-security-groups"]))
        .await
    {
        Ok(json) => json,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => return Ok(None),
    };

    let mut steps = Vec::new();
    if let Some(groups) = described.get("SecurityGroups").and_then(Value::as_array) {
        for group in groups {
            let other_id = group.get("GroupId").and_then(Value::as_str).unwrap_or("");
            if other_id.is_empty() || other_id == group_id {
                continue;
            }
            for (field, revoke_op) in [
                ("IpPermissions", "revoke-security-group-ingress"),
                ("IpPermissionsEgress", "revoke-security-group-egress"),
            ] {
                let Some(permissions) = group.get(field).and_then(Value::as_array) else {
                    continue;
                };
                for permission in permissions {
                    if let Some(referencing) = referencing_permission(permission, group_id) {
                        steps.push(step(
                            vec![
                                "ec2".to_string(),
                                revoke_op.to_string(),
                                "--group-id".to_string(),
                                other_id.to_string(),
                                "--ip-permissions".to_string(),
                                Value::Array(vec![referencing]).to_string(),
                            ],
                            "revoke rule referencing the group being deleted",
                        ));
                    }
                }
            }
        }
    }

    match ctx
        .run_aws_json(&argv(&[
            "ec2",
            "describe-network-interfaces",
            "--filters",
            &format!("Name=group-id,Values={group_id}"),
        ]))
        .await
    {
        Ok(json) => {
            if let Some(enis) = json.get("NetworkInterfaces").and_then(Value::as_array) {
                for eni in enis {
                    if let Some(id) = eni.get("NetworkInterfaceId").and_then(Value::as_str) {
                        notes.push(format!(
                            "security group {group_id} is still attached to network interface {id}"
                        ));
                    }
                }
            }
        }
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => {}
    }

    if steps.is_empty() && notes.is_empty() {
        return Ok(None);
    }
    steps.push(original.clone());
    Ok(Some(steps))
}

/// The subset of a permission that references `group_id`, if any.
fn referencing_permission(permission: &Value, group_id: &str) -> Option<Value> {
    let pairs = permission.get("UserIdGroupPairs")?.as_array()?;
    let matching: Vec<&Value> = pairs
        .iter()
        .filter(|pair| pair.get("GroupId").and_then(Value::as_str) == Some(group_id))
        .collect();
    if matching.is_empty() {
        return None;
    }

    let mut out = json!({
        "IpProtocol": permission.get("IpProtocol").cloned().unwrap_or(json!("-1")),
        "UserIdGroupPairs": [{"GroupId": group_id}],
    });
    for port_field in ["FromPort", "ToPort"] {
        if let Some(port) = permission.get(port_field) {
            out[port_field] = port.clone();
        }
    }
    Some(out)
}
