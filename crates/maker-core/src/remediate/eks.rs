//! EKS pivots: subnet selection and cluster teardown ordering.

use serde_json::Value;

use super::{argv, provider_error, retry_original, ArmScope, Remediation};
use crate::context::ExecCtx;
use crate::domain::{MakerError, Result};
use crate::jsonx;
use crate::normalize::flag_value;
use crate::waiters;

/// `create-cluster`/`create-nodegroup` with bad or placeholder subnets
/// infers the VPC and rewrites the subnet list with up to two real subnets
/// preferring distinct AZs.
pub(super) async fn subnet_rewrite(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let vpc_id = match infer_vpc(ctx, &scope.args).await? {
        Some(vpc) => vpc,
        None => return Ok(Remediation::NotHandled),
    };

    let subnets = vpc_subnets(ctx, &vpc_id).await?;
    let picked = pick_subnets(&subnets);
    if picked.is_empty() {
        return Ok(Remediation::HandledWithError(provider_error(scope)));
    }

    let op = scope.args[1].clone();
    match op.as_str() {
        "create-cluster" => rewrite_vpc_config(&mut scope.args, &picked),
        "create-nodegroup" => rewrite_subnets_flag(&mut scope.args, &picked),
        _ => return Ok(Remediation::NotHandled),
    }

    ctx.log().remediation(&format!(
        "rewrote {op} subnets to {} in {vpc_id}",
        picked.join(",")
    ));
    retry_original(ctx, scope).await
}

/// VPC from the security group passed in the args, else the default VPC.
async fn infer_vpc(ctx: &ExecCtx<'_>, args: &[String]) -> Result<Option<String>> {
    if let Some(sg) = find_security_group(args) {
        match ctx
            .run_aws_json(&argv(&["ec2", "describe-security-groups", "--group-ids", &sg]))
            .await
        {
            Ok(json) => {
                if let Some(vpc) = jsonx::extract_string(&json, "SecurityGroups[0].VpcId") {
                    return Ok(Some(vpc));
                }
            }
            Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
            Err(_) => {}
        }
    }
    match ctx
        .run_aws_json(&argv(&[
            "ec2",
            "describe-vpcs",
            "--filters",
            "Name=isDefault,Values=true",
        ]))
        .await
    {
        Ok(json) => Ok(jsonx::extract_string(&json, "Vpcs[0].VpcId")),
        Err(MakerError::Cancelled) => Err(MakerError::Cancelled),
        Err(_) => Ok(None),
    }
}

fn find_security_group(args: &[String]) -> Option<String> {
    for arg in args {
        if let Some(pos) = arg.find("securityGroupIds=") {
            let rest = &arg[pos + "securityGroupIds=".len()..];
            let sg = rest.split(',').next().unwrap_or(rest);
            if sg.starts_with("sg-") {
                return Some(sg.to_string());
            }
        }
        if arg.starts_with("sg-") {
            return Some(arg.clone());
        }
    }
    None
}

/// Subnets as (az, id), lex-sorted by AZ then id.
async fn vpc_subnets(ctx: &ExecCtx<'_>, vpc_id: &str) -> Result<Vec<(String, String)>> {
    let json = match ctx
        .run_aws_json(&argv(&[
            "ec2",
            "describe-subnets",
            "--filters",
            &format!("Name=vpc-id,Values={vpc_id}"),
        ]))
        .await
    {
        Ok(json) => json,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => return Ok(Vec::new()),
    };
    let mut subnets: Vec<(String, String)> = json
        .get("Subnets")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|s| {
                    let az = s.get("AvailabilityZone")?.as_str()?.to_string();
                    let id = s.get("SubnetId")?.as_str()?.to_string();
                    Some((az, id))
                })
                .collect()
        })
        .unwrap_or_default();
    subnets.sort();
    Ok(subnets)
}

/// Up to two subnets preferring distinct AZs; lexicographic tie-break comes
/// from the pre-sorted input.
fn pick_subnets(subnets: &[(String, String)]) -> Vec<String> {
    let mut picked: Vec<&(String, String)> = Vec::new();
    for subnet in subnets {
        if picked.len() == 2 {
            break;
        }
        if picked.iter().all(|p| p.0 != subnet.0) {
            picked.push(subnet);
        }
    }
    if picked.len() < 2 {
        for subnet in subnets {
            if picked.len() == 2 {
                break;
            }
            if !picked.iter().any(|p| p.1 == subnet.1) {
                picked.push(subnet);
            }
        }
    }
    picked.into_iter().map(|(_, id)| id.clone()).collect()
}

/// Replace the `subnetIds=` portion of `--resources-vpc-config`.
fn rewrite_vpc_config(args: &mut [String], subnet_ids: &[String]) {
    let Some(pos) = args.iter().position(|a| a == "--resources-vpc-config") else {
        return;
    };
    let Some(value) = args.get(pos + 1) else {
        return;
    };
    let keep: Vec<&str> = value
        .split(',')
        .filter(|part| !part.trim_start().starts_with("subnetIds="))
        // Subnet list entries carry no key; drop bare subnet tokens too.
        .filter(|part| !part.trim().starts_with("subnet-") && !part.contains("<SUBNET"))
        .collect();
    let mut rebuilt = format!("subnetIds={}", subnet_ids.join(","));
    for part in keep {
        rebuilt.push(',');
        rebuilt.push_str(part.trim());
    }
    args[pos + 1] = rebuilt;
}

/// Replace the value list after `--subnets`.
fn rewrite_subnets_flag(args: &mut Vec<String>, subnet_ids: &[String]) {
    let Some(start) = args.iter().position(|a| a == "--subnets") else {
        return;
    };
    let end = args[start + 1..]
        .iter()
        .position(|a| a.starts_with("--"))
        .map(|offset| start + 1 + offset)
        .unwrap_or(args.len());
    args.splice(start + 1..end, subnet_ids.iter().cloned());
}

/// `delete-cluster` blocked by nodegroups drains them first, waiting for
/// each deletion, then retries.
pub(super) async fn delete_cluster_nodegroups(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(cluster) = flag_value(&scope.args, "--name").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };

    // Bounded drain: nodegroups can appear while earlier ones delete.
    for _round in 0..5 {
        let json = match ctx
            .run_aws_json(&argv(&["eks", "list-nodegroups", "--cluster-name", &cluster]))
            .await
        {
            Ok(json) => json,
            Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
            Err(_) => break,
        };
        let nodegroups: Vec<String> = json
            .get("nodegroups")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if nodegroups.is_empty() {
            break;
        }

        for nodegroup in &nodegroups {
            ctx.log().remediation(&format!(
                "deleting nodegroup {nodegroup} before cluster {cluster}"
            ));
            let delete = argv(&[
                "eks",
                "delete-nodegroup",
                "--cluster-name",
                &cluster,
                "--nodegroup-name",
                nodegroup,
            ]);
            let out = ctx.run_aws(&delete, None).await?;
            if !out.success() && !out.output.to_lowercase().contains("notfound") {
                scope.set_output(&out.output);
                return Ok(Remediation::HandledWithError(provider_error(scope)));
            }
            waiters::wait_eks_nodegroup_deleted(ctx, &cluster, nodegroup).await?;
        }
    }

    retry_original(ctx, scope).await
}
