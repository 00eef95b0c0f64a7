//! EC2 rewrite-and-retry pivots.

use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use super::{argv, provider_error, retry_original, ArmScope, Remediation};
use crate::context::ExecCtx;
use crate::domain::{MakerError, Result};
use crate::jsonx;
use crate::normalize::{flag_value, set_flag_value};

/// `create-subnet` with a CIDR outside or colliding inside the VPC picks a
/// free `/24` from the VPC's actual CIDR associations and retries.
pub(super) async fn subnet_cidr_pivot(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(vpc_id) = flag_value(&scope.args, "--vpc-id").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };

    let vpc_cidrs = vpc_cidr_blocks(ctx, &vpc_id).await?;
    if vpc_cidrs.is_empty() {
        return Ok(Remediation::NotHandled);
    }
    let used = subnet_cidr_blocks(ctx, &vpc_id).await?;

    let Some(free) = free_slash24(&vpc_cidrs, &used) else {
        return Ok(Remediation::HandledWithError(provider_error(scope)));
    };

    set_flag_value(&mut scope.args, "--cidr-block", &free);
    ctx.log().remediation(&format!(
        "rewrote subnet cidr to free block {free} inside {vpc_id}"
    ));
    let outcome = retry_original(ctx, scope).await?;
    if matches!(outcome, Remediation::Handled) {
        scope.bindings.learn_plan_bindings(&scope.args, &scope.output);
    }
    Ok(outcome)
}

/// `associate-vpc-cidr-block` rejected for range picks another block in the
/// same RFC1918 family.
pub(super) async fn vpc_extra_cidr_pivot(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(vpc_id) = flag_value(&scope.args, "--vpc-id").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    let existing = vpc_cidr_blocks(ctx, &vpc_id).await?;
    let Some((primary, _)) = existing.first().copied() else {
        return Ok(Remediation::NotHandled);
    };

    let candidates: Vec<String> = match primary >> 24 {
        10 => (1..=254u32)
            .map(|second| format!("10.{second}.0.0/16"))
            .collect(),
        172 => (16..=31u32)
            .map(|second| format!("172.{second}.0.0/16"))
            .collect(),
        _ => vec!["192.168.0.0/16".to_string()],
    };
    let free = candidates.into_iter().find(|candidate| {
        parse_cidr(candidate)
            .map(|c| !existing.iter().any(|e| cidrs_overlap(*e, c)))
            .unwrap_or(false)
    });
    let Some(free) = free else {
        return Ok(Remediation::HandledWithError(provider_error(scope)));
    };

    set_flag_value(&mut scope.args, "--cidr-block", &free);
    ctx.log().remediation(&format!(
        "picked alternate rfc1918 block {free} for {vpc_id}"
    ));
    retry_original(ctx, scope).await
}

/// `create-route`/`associate-route-table` with a junk route-table token
/// infers the VPC, creates a route table, binds it, and retries.
pub(super) async fn route_table_inference(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let vpc_id = match infer_vpc_for_route(ctx, &scope.args).await? {
        Some(vpc) => vpc,
        None => return Ok(Remediation::NotHandled),
    };

    let created = ctx
        .run_aws_json(&argv(&["ec2", "create-route-table", "--vpc-id", &vpc_id]))
        .await;
    let created = match created {
        Ok(json) => json,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => return Ok(Remediation::HandledWithError(provider_error(scope))),
    };
    let Some(rtb_id) = jsonx::extract_string(&created, "RouteTable.RouteTableId") else {
        return Ok(Remediation::HandledWithError(provider_error(scope)));
    };

    if !scope.bindings.has("RT_PRIVATE") {
        scope.bindings.set("RT_PRIVATE", &rtb_id);
    } else {
        scope.bindings.set_if_absent("RT_PRIVATE_2", &rtb_id);
    }
    set_flag_value(&mut scope.args, "--route-table-id", &rtb_id);
    ctx.log().remediation(&format!(
        "created route table {rtb_id} in {vpc_id} and rewrote --route-table-id"
    ));
    retry_original(ctx, scope).await
}

async fn infer_vpc_for_route(ctx: &ExecCtx<'_>, args: &[String]) -> Result<Option<String>> {
    if let Some(nat_id) = flag_value(args, "--nat-gateway-id") {
        if let Ok(json) = ctx
            .run_aws_json(&argv(&["ec2", "describe-nat-gateways", "--nat-gateway-ids", nat_id]))
            .await
        {
            if let Some(vpc) = jsonx::extract_string(&json, "NatGateways[0].VpcId") {
                return Ok(Some(vpc));
            }
        }
    }
    if let Some(subnet_id) = flag_value(args, "--subnet-id") {
        if let Ok(json) = ctx
            .run_aws_json(&argv(&["ec2", "describe-subnets", "--subnet-ids", subnet_id]))
            .await
        {
            if let Some(vpc) = jsonx::extract_string(&json, "Subnets[0].VpcId") {
                return Ok(Some(vpc));
            }
        }
    }
    let json = ctx
        .run_aws_json(&argv(&[
            "ec2",
            "describe-vpcs",
            "--filters",
            "Name=isDefault,Values=true",
        ]))
        .await;
    match json {
        Ok(json) => Ok(jsonx::extract_string(&json, "Vpcs[0].VpcId")),
        Err(MakerError::Cancelled) => Err(MakerError::Cancelled),
        Err(_) => Ok(None),
    }
}

/// `attach-internet-gateway` on a VPC that already has one binds the
/// existing IGW and, in destroyer mode, removes the spare.
pub(super) async fn igw_already_attached(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(vpc_id) = flag_value(&scope.args, "--vpc-id").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    let spare = flag_value(&scope.args, "--internet-gateway-id").map(String::from);

    let json = ctx
        .run_aws_json(&argv(&[
            "ec2",
            "describe-internet-gateways",
            "--filters",
            &format!("Name=attachment.vpc-id,Values={vpc_id}"),
        ]))
        .await;
    let json = match json {
        Ok(json) => json,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => return Ok(Remediation::NotHandled),
    };
    let Some(attached) = jsonx::extract_string(&json, "InternetGateways[0].InternetGatewayId")
    else {
        return Ok(Remediation::NotHandled);
    };

    scope.bindings.set("IGW_ID", &attached);
    ctx.log().remediation(&format!(
        "vpc {vpc_id} already has internet gateway {attached}, using it"
    ));

    if let Some(spare) = spare {
        if spare != attached {
            if ctx.opts.destroyer {
                let delete = argv(&["ec2", "delete-internet-gateway", "--internet-gateway-id", &spare]);
                let out = ctx.run_aws(&delete, None).await?;
                if out.success() {
                    ctx.log()
                        .remediation(&format!("deleted spare internet gateway {spare}"));
                }
            } else {
                ctx.log()
                    .note(&format!("leaving spare internet gateway {spare} in place"));
            }
        }
    }
    Ok(Remediation::Handled)
}

/// `delete-security-group` blocked by a DependencyViolation revokes rules
/// in other groups that reference this one, then retries with backoff to
/// ride out ENI detachment.
pub(super) async fn sg_dependency_violation(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(group_id) = flag_value(&scope.args, "--group-id").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };

    let described = match ctx
        .run_aws_json(&argv(&["ec2", "describe-security-groups"]))
        .await
    {
        Ok(json) => json,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => return Ok(Remediation::NotHandled),
    };

    let mut revoked = 0usize;
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
                    let references = permission
                        .get("UserIdGroupPairs")
                        .and_then(Value::as_array)
                        .map(|pairs| {
                            pairs.iter().any(|p| {
                                p.get("GroupId").and_then(Value::as_str) == Some(group_id.as_str())
                            })
                        })
                        .unwrap_or(false);
                    if !references {
                        continue;
                    }
                    let mut minimal = serde_json::json!({
                        "IpProtocol": permission.get("IpProtocol").cloned()
                            .unwrap_or(Value::String("-1".to_string())),
                        "UserIdGroupPairs": [{"GroupId": group_id}],
                    });
                    for port_field in ["FromPort", "ToPort"] {
                        if let Some(port) = permission.get(port_field) {
                            minimal[port_field] = port.clone();
                        }
                    }
                    let revoke = vec![
                        "ec2".to_string(),
                        revoke_op.to_string(),
                        "--group-id".to_string(),
                        other_id.to_string(),
                        "--ip-permissions".to_string(),
                        Value::Array(vec![minimal]).to_string(),
                    ];
                    let out = ctx.run_aws(&revoke, None).await?;
                    if out.success() {
                        revoked += 1;
                        ctx.log().remediation(&format!(
                            "revoked {other_id} rule referencing {group_id}"
                        ));
                    }
                }
            }
        }
    }

    if revoked == 0 {
        ctx.log().note(&format!(
            "no revocable references to {group_id}; retrying while attachments drain"
        ));
    }
    super::retry_with_backoff(ctx, scope, 5, Duration::from_secs(1)).await
}

/// `terminate-instances` drops already-gone ids from the argv and retries,
/// up to six rounds.
pub(super) async fn terminate_missing_ids(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let id_re = Regex::new(r"i-[0-9a-f]+").expect("instance id regex");

    for _round in 0..6 {
        let missing: Vec<String> = id_re
            .find_iter(&scope.output)
            .map(|m| m.as_str().to_string())
            .collect();
        let current = instance_ids(&scope.args);
        let remaining: Vec<String> = current
            .iter()
            .filter(|id| !missing.contains(id))
            .cloned()
            .collect();

        if remaining.is_empty() {
            ctx.log().note("all instance ids already gone");
            return Ok(Remediation::Handled);
        }
        if remaining.len() == current.len() {
            // Output named no id we still carry; nothing left to drop.
            return Ok(Remediation::HandledWithError(provider_error(scope)));
        }

        replace_instance_ids(&mut scope.args, &remaining);
        ctx.log().remediation(&format!(
            "dropped missing instance ids, retrying terminate with {}",
            remaining.join(" ")
        ));
        let out = ctx.run_aws(&scope.args, scope.stdin.as_deref()).await?;
        scope.set_output(&out.output);
        if out.success() {
            return Ok(Remediation::Handled);
        }
        if scope.failure.code != "InvalidInstanceID.NotFound" {
            return Ok(Remediation::HandledWithError(provider_error(scope)));
        }
    }
    Ok(Remediation::HandledWithError(provider_error(scope)))
}

fn instance_ids(args: &[String]) -> Vec<String> {
    let Some(start) = args.iter().position(|a| a == "--instance-ids") else {
        return Vec::new();
    };
    args[start + 1..]
        .iter()
        .take_while(|a| !a.starts_with("--"))
        .cloned()
        .collect()
}

fn replace_instance_ids(args: &mut Vec<String>, ids: &[String]) {
    let Some(start) = args.iter().position(|a| a == "--instance-ids") else {
        return;
    };
    let end = args[start + 1..]
        .iter()
        .position(|a| a.starts_with("--"))
        .map(|offset| start + 1 + offset)
        .unwrap_or(args.len());
    args.splice(start + 1..end, ids.iter().cloned());
}

/// `run-instances` rejected for its instance profile polls the profile into
/// visibility, rewrites the reference to the ARN form, and retries.
pub(super) async fn run_instances_profile(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(reference) = flag_value(&scope.args, "--iam-instance-profile").map(String::from)
    else {
        return Ok(Remediation::NotHandled);
    };
    let Some(name) = profile_name(&reference) else {
        return Ok(Remediation::NotHandled);
    };

    let mut arn = None;
    for attempt in 0..6u32 {
        match ctx
            .run_aws_json(&argv(&["iam", "get-instance-profile", "--instance-profile-name", &name]))
            .await
        {
            Ok(json) => {
                arn = jsonx::extract_string(&json, "InstanceProfile.Arn");
                if arn.is_some() {
                    break;
                }
            }
            Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
            Err(_) => {}
        }
        ctx.backoff_sleep(attempt, Duration::from_secs(1)).await?;
    }
    let Some(arn) = arn else {
        return Ok(Remediation::HandledWithError(provider_error(scope)));
    };

    set_flag_value(&mut scope.args, "--iam-instance-profile", &format!("Arn={arn}"));
    ctx.log().remediation(&format!(
        "instance profile {name} visible as {arn}, retrying run-instances"
    ));
    let outcome = retry_original(ctx, scope).await?;
    if matches!(outcome, Remediation::Handled) {
        scope.bindings.learn_plan_bindings(&scope.args, &scope.output);
    }
    Ok(outcome)
}

fn profile_name(reference: &str) -> Option<String> {
    for part in reference.split(',') {
        let part = part.trim();
        if let Some(name) = part.strip_prefix("Name=") {
            return Some(name.to_string());
        }
        if let Some(arn) = part.strip_prefix("Arn=") {
            return arn.rsplit('/').next().map(String::from);
        }
    }
    None
}

/// CloudFormation stacks rejected over subnet CIDRs get their template's
/// subnet blocks rewritten to free `/24`s and re-submitted.
pub(super) async fn cfn_template_cidr_rewrite(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(body) = flag_value(&scope.args, "--template-body").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    let Some(path) = body.strip_prefix("file://") else {
        return Ok(Remediation::NotHandled);
    };

    let raw = std::fs::read_to_string(path)?;
    let mut template: Value = serde_json::from_str(&raw)?;

    let vpc_cidr = template_vpc_cidr(&template).unwrap_or((10 << 24, 16));
    let mut used: Vec<(u32, u8)> = Vec::new();
    let mut rewrote = false;

    if let Some(resources) = template
        .get_mut("Resources")
        .and_then(Value::as_object_mut)
    {
        for resource in resources.values_mut() {
            if resource.get("Type").and_then(Value::as_str) != Some("AWS::EC2::Subnet") {
                continue;
            }
            let Some(properties) = resource.get_mut("Properties").and_then(Value::as_object_mut)
            else {
                continue;
            };
            if let Some(free) = free_slash24(&[vpc_cidr], &used) {
                if let Some(parsed) = parse_cidr(&free) {
                    used.push(parsed);
                }
                properties.insert("CidrBlock".to_string(), Value::String(free));
                rewrote = true;
            }
        }
    }
    if !rewrote {
        return Ok(Remediation::NotHandled);
    }

    std::fs::write(path, serde_json::to_vec_pretty(&template)?)?;
    ctx.log()
        .remediation("rewrote template subnet cidrs to free /24 blocks");
    retry_original(ctx, scope).await
}

fn template_vpc_cidr(template: &Value) -> Option<(u32, u8)> {
    let resources = template.get("Resources")?.as_object()?;
    for resource in resources.values() {
        if resource.get("Type").and_then(Value::as_str) == Some("AWS::EC2::VPC") {
            let cidr = resource.pointer("/Properties/CidrBlock")?.as_str()?;
            return parse_cidr(cidr);
        }
    }
    None
}

// --- CIDR arithmetic -------------------------------------------------------

pub(super) fn parse_ipv4(s: &str) -> Option<u32> {
    let mut out = 0u32;
    let mut octets = 0;
    for part in s.split('.') {
        let octet: u8 = part.parse().ok()?;
        out = (out << 8) | octet as u32;
        octets += 1;
    }
    (octets == 4).then_some(out)
}

pub(super) fn parse_cidr(s: &str) -> Option<(u32, u8)> {
    let (ip, len) = s.split_once('/')?;
    let ip = parse_ipv4(ip.trim())?;
    let len: u8 = len.trim().parse().ok()?;
    (len <= 32).then_some((ip & mask(len), len))
}

fn mask(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - len)
    }
}

fn cidrs_overlap(a: (u32, u8), b: (u32, u8)) -> bool {
    let len = a.1.min(b.1);
    (a.0 & mask(len)) == (b.0 & mask(len))
}

/// First `/24` inside any of `containers` that overlaps none of `used`.
pub(super) fn free_slash24(containers: &[(u32, u8)], used: &[(u32, u8)]) -> Option<String> {
    for &(base, len) in containers {
        if len > 24 {
            continue;
        }
        let block_count = 1u32 << (24 - len);
        for index in 0..block_count.min(1024) {
            let candidate = (base + (index << 8), 24u8);
            if used.iter().any(|u| cidrs_overlap(candidate, *u)) {
                continue;
            }
            let ip = candidate.0;
            return Some(format!(
                "{}.{}.{}.0/24",
                ip >> 24,
                (ip >> 16) & 0xff,
                (ip >> 8) & 0xff
            ));
        }
    }
    None
}

async fn vpc_cidr_blocks(ctx: &ExecCtx<'_>, vpc_id: &str) -> Result<Vec<(u32, u8)>> {
    let json = match ctx
        .run_aws_json(&argv(&["ec2", "describe-vpcs", "--vpc-ids", vpc_id]))
        .await
    {
        Ok(json) => json,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => return Ok(Vec::new()),
    };
    let mut blocks = Vec::new();
    if let Some(primary) = jsonx::extract_string(&json, "Vpcs[0].CidrBlock") {
        blocks.extend(parse_cidr(&primary));
    }
    if let Some(associations) = json
        .pointer("/Vpcs/0/CidrBlockAssociationSet")
        .and_then(Value::as_array)
    {
        for assoc in associations {
            if let Some(cidr) = assoc.get("CidrBlock").and_then(Value::as_str) {
                if let Some(parsed) = parse_cidr(cidr) {
                    if !blocks.contains(&parsed) {
                        blocks.push(parsed);
                    }
                }
            }
        }
    }
    Ok(blocks)
}

async fn subnet_cidr_blocks(ctx: &ExecCtx<'_>, vpc_id: &str) -> Result<Vec<(u32, u8)>> {
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
    let mut blocks = Vec::new();
    if let Some(subnets) = json.get("Subnets").and_then(Value::as_array) {
        for subnet in subnets {
            if let Some(cidr) = subnet.get("CidrBlock").and_then(Value::as_str) {
                blocks.extend(parse_cidr(cidr));
            }
        }
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_failure;
    use crate::domain::{ExecOptions, LogSink};
    use crate::fakes::ScriptedRunner;
    use crate::BindingStore;

    fn opts() -> ExecOptions {
        ExecOptions {
            log: LogSink::capture().0,
            ..Default::default()
        }
    }

    fn scope_for<'a>(
        tokens: &[&str],
        output: &str,
        bindings: &'a mut BindingStore,
    ) -> ArmScope<'a> {
        let args: Vec<String> = tokens.iter().map(|s| s.to_string()).collect();
        let failure = classify_failure(&args, output);
        ArmScope::new(args, None, failure, output.to_string(), bindings)
    }

    #[test]
    fn test_cidr_arithmetic() {
        assert_eq!(parse_cidr("10.0.0.0/16"), Some((10 << 24, 16)));
        assert!(cidrs_overlap(
            parse_cidr("10.0.0.0/16").expect("a"),
            parse_cidr("10.0.3.0/24").expect("b")
        ));
        assert!(!cidrs_overlap(
            parse_cidr("10.0.0.0/24").expect("a"),
            parse_cidr("10.0.1.0/24").expect("b")
        ));
    }

    #[test]
    fn test_free_slash24_skips_used() {
        let containers = [parse_cidr("10.0.0.0/16").expect("vpc")];
        let used = [
            parse_cidr("10.0.0.0/24").expect("u0"),
            parse_cidr("10.0.1.0/24").expect("u1"),
        ];
        assert_eq!(free_slash24(&containers, &used).as_deref(), Some("10.0.2.0/24"));
        assert_eq!(free_slash24(&containers, &[]).as_deref(), Some("10.0.0.0/24"));
    }

    #[test]
    fn test_instance_id_argv_surgery() {
        let mut args: Vec<String> = [
            "ec2",
            "terminate-instances",
            "--instance-ids",
            "i-aaa",
            "i-bbb",
            "i-ccc",
            "--no-paginate",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(instance_ids(&args), vec!["i-aaa", "i-bbb", "i-ccc"]);
        replace_instance_ids(&mut args, &["i-aaa".to_string(), "i-ccc".to_string()]);
        assert_eq!(instance_ids(&args), vec!["i-aaa", "i-ccc"]);
        assert!(args.contains(&"--no-paginate".to_string()));
    }

    #[test]
    fn test_profile_name_forms() {
        assert_eq!(profile_name("Name=web-profile").as_deref(), Some("web-profile"));
        assert_eq!(
            profile_name("Arn=arn:aws:iam::1:instance-profile/web-profile").as_deref(),
            Some("web-profile")
        );
        assert!(profile_name("web-profile").is_none());
    }

    #[tokio::test]
    async fn test_subnet_pivot_rewrites_to_free_block() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(
            &["describe-vpcs"],
            ScriptedRunner::ok(
                r#"{"Vpcs":[{"VpcId":"vpc-1","CidrBlock":"10.0.0.0/16",
                    "CidrBlockAssociationSet":[{"CidrBlock":"10.0.0.0/16"}]}]}"#,
            ),
        );
        runner.stub(
            &["describe-subnets"],
            ScriptedRunner::ok(
                r#"{"Subnets":[{"CidrBlock":"10.0.0.0/24"},{"CidrBlock":"10.0.1.0/24"}]}"#,
            ),
        );
        runner.stub(
            &["create-subnet"],
            ScriptedRunner::ok(r#"{"Subnet":{"SubnetId":"subnet-new"}}"#),
        );
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["ec2", "create-subnet", "--vpc-id", "vpc-1", "--cidr-block", "192.168.0.0/24"],
            "InvalidSubnet.Range: The CIDR '192.168.0.0/24' is invalid.",
            &mut bindings,
        );
        let outcome = subnet_cidr_pivot(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert_eq!(
            flag_value(&scope.args, "--cidr-block"),
            Some("10.0.2.0/24")
        );
        assert_eq!(bindings.get("SUBNET_A"), Some("subnet-new"));
    }

    #[tokio::test]
    async fn test_terminate_drops_missing_ids_and_succeeds() {
        let opts = ExecOptions {
            destroyer: true,
            log: LogSink::capture().0,
            ..Default::default()
        };
        let runner = ScriptedRunner::new();
        runner.stub_times(
            &["terminate-instances"],
            1,
            ScriptedRunner::fail("InvalidInstanceID.NotFound: The instance ID 'i-ccc' does not exist"),
        );
        runner.stub(&["terminate-instances"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["ec2", "terminate-instances", "--instance-ids", "i-aaa", "i-bbb", "i-ccc"],
            "InvalidInstanceID.NotFound: The instance ID 'i-bbb' does not exist",
            &mut bindings,
        );
        let outcome = terminate_missing_ids(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        // First retry dropped i-bbb, second dropped i-ccc.
        assert_eq!(instance_ids(&scope.args), vec!["i-aaa"]);
        assert_eq!(runner.count_calls("terminate-instances"), 2);
    }

    #[tokio::test]
    async fn test_terminate_all_gone_declares_success() {
        let opts = ExecOptions {
            destroyer: true,
            log: LogSink::capture().0,
            ..Default::default()
        };
        let (sink, capture) = LogSink::capture();
        let opts = ExecOptions { log: sink, ..opts };
        let runner = ScriptedRunner::new();
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["ec2", "terminate-instances", "--instance-ids", "i-aaa"],
            "InvalidInstanceID.NotFound: The instance ID 'i-aaa' does not exist",
            &mut bindings,
        );
        let outcome = terminate_missing_ids(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert_eq!(runner.count_calls("terminate-instances"), 0);
        assert!(capture.contents().contains("all instance ids already gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sg_dependency_violation_revokes_then_retries() {
        let opts = ExecOptions {
            destroyer: true,
            log: LogSink::capture().0,
            ..Default::default()
        };
        let runner = ScriptedRunner::new();
        runner.stub(
            &["describe-security-groups"],
            ScriptedRunner::ok(
                r#"{"SecurityGroups":[
                    {"GroupId":"sg-other","IpPermissions":[
                        {"IpProtocol":"tcp","FromPort":443,"ToPort":443,
                         "UserIdGroupPairs":[{"GroupId":"sg-target"}]}
                    ],"IpPermissionsEgress":[]}
                ]}"#,
            ),
        );
        runner.stub(&["revoke-security-group-ingress"], ScriptedRunner::ok("{}"));
        runner.stub(&["delete-security-group"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["ec2", "delete-security-group", "--group-id", "sg-target"],
            "DependencyViolation: resource sg-target has a dependent object",
            &mut bindings,
        );
        let outcome = sg_dependency_violation(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));

        let lines = runner.call_lines();
        let revoke = lines
            .iter()
            .position(|l| l.contains("revoke-security-group-ingress"))
            .expect("revoke");
        let delete = lines
            .iter()
            .position(|l| l.contains("delete-security-group"))
            .expect("delete");
        assert!(revoke < delete);
    }

    #[tokio::test]
    async fn test_igw_already_attached_binds_existing() {
        let opts = opts();
        let (sink, capture) = LogSink::capture();
        let opts = ExecOptions { log: sink, ..opts };
        let runner = ScriptedRunner::new();
        runner.stub(
            &["describe-internet-gateways"],
            ScriptedRunner::ok(r#"{"InternetGateways":[{"InternetGatewayId":"igw-real"}]}"#),
        );
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["ec2", "attach-internet-gateway", "--internet-gateway-id", "igw-spare", "--vpc-id", "vpc-1"],
            "Resource.AlreadyAssociated: vpc-1 already has an internet gateway attached",
            &mut bindings,
        );
        let outcome = igw_already_attached(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert_eq!(bindings.get("IGW_ID"), Some("igw-real"));
        // Non-destroyer: the spare is left in place, not deleted.
        assert_eq!(runner.count_calls("delete-internet-gateway"), 0);
        assert!(capture.contents().contains("igw-spare"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_instances_profile_polls_then_rewrites() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub_times(
            &["get-instance-profile"],
            1,
            ScriptedRunner::fail("NoSuchEntity"),
        );
        runner.stub(
            &["get-instance-profile"],
            ScriptedRunner::ok(
                r#"{"InstanceProfile":{"Arn":"arn:aws:iam::1:instance-profile/web"}}"#,
            ),
        );
        runner.stub(
            &["run-instances"],
            ScriptedRunner::ok(r#"{"Instances":[{"InstanceId":"i-new"}]}"#),
        );
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["ec2", "run-instances", "--iam-instance-profile", "Name=web"],
            "InvalidParameterValue: IamInstanceProfile is invalid",
            &mut bindings,
        );
        let outcome = run_instances_profile(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert_eq!(
            flag_value(&scope.args, "--iam-instance-profile"),
            Some("Arn=arn:aws:iam::1:instance-profile/web")
        );
        assert_eq!(bindings.get("INSTANCE_ID"), Some("i-new"));
    }

    #[tokio::test]
    async fn test_cfn_template_rewrite() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(&["create-stack"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("template.json");
        std::fs::write(
            &path,
            r#"{"Resources":{
                "Vpc":{"Type":"AWS::EC2::VPC","Properties":{"CidrBlock":"10.0.0.0/16"}},
                "SubnetA":{"Type":"AWS::EC2::Subnet","Properties":{"CidrBlock":"192.168.0.0/24"}},
                "SubnetB":{"Type":"AWS::EC2::Subnet","Properties":{"CidrBlock":"192.168.1.0/24"}}
            }}"#,
        )
        .expect("write template");

        let body = format!("file://{}", path.display());
        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["cloudformation", "create-stack", "--stack-name", "s", "--template-body", &body],
            "InvalidSubnet.Range: subnet cidr is outside the vpc",
            &mut bindings,
        );
        let outcome = cfn_template_cidr_rewrite(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));

        let rewritten: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        let a = rewritten.pointer("/Resources/SubnetA/Properties/CidrBlock").expect("a");
        let b = rewritten.pointer("/Resources/SubnetB/Properties/CidrBlock").expect("b");
        assert_eq!(a, "10.0.0.0/24");
        assert_eq!(b, "10.0.1.0/24");
    }
}
