//! Resource-state waiters.
//!
//! Every waiter polls a describe verb (or delegates to a provider-native
//! wait) until a terminal condition, within a bounded attempt budget and
//! with attempt-proportional sleeps. All sleeps honor cancellation.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use crate::context::ExecCtx;
use crate::domain::{MakerError, Result};
use crate::jsonx;

/// Outcome of a single poll.
enum Poll {
    Ready,
    Pending(String),
    Failed(String),
}

/// Drive a describe-poll loop to a terminal condition.
///
/// Describe errors count as pending: most of them are propagation windows
/// where the resource is not yet visible.
async fn poll_until<F>(
    ctx: &ExecCtx<'_>,
    what: &str,
    args: &[String],
    max_attempts: u32,
    step: Duration,
    check: F,
) -> Result<()>
where
    F: Fn(&Value) -> Poll,
{
    for attempt in 1..=max_attempts {
        match ctx.run_aws_json(args).await {
            Ok(json) => match check(&json) {
                Poll::Ready => return Ok(()),
                Poll::Failed(reason) => {
                    return Err(MakerError::Provider {
                        op: what.to_string(),
                        output: reason,
                    });
                }
                Poll::Pending(state) => {
                    debug!(what, attempt, state = %state, "waiter pending");
                }
            },
            Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
            Err(err) => {
                debug!(what, attempt, err = %err, "waiter describe failed; still waiting");
            }
        }
        ctx.sleep(step * attempt).await?;
    }

    Err(MakerError::Provider {
        op: what.to_string(),
        output: format!("not ready after {max_attempts} attempts"),
    })
}

fn argv(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|s| s.to_string()).collect()
}

/// Delegate to a provider-native wait verb.
async fn native_wait(ctx: &ExecCtx<'_>, args: &[String]) -> Result<()> {
    let out = ctx.run_aws(args, None).await?;
    if out.success() {
        Ok(())
    } else {
        Err(MakerError::Provider {
            op: args.get(1).cloned().unwrap_or_default(),
            output: out.output,
        })
    }
}

/// Lambda function `State=Active`.
pub async fn wait_lambda_active(ctx: &ExecCtx<'_>, function_name: &str) -> Result<()> {
    let args = argv(&[
        "lambda",
        "get-function-configuration",
        "--function-name",
        function_name,
    ]);
    poll_until(
        ctx,
        "lambda function active",
        &args,
        40,
        Duration::from_millis(450),
        |json| match jsonx::extract_string(json, "State").as_deref() {
            Some("Active") => Poll::Ready,
            Some("Failed") => Poll::Failed("function entered Failed state".to_string()),
            other => Poll::Pending(other.unwrap_or("unknown").to_string()),
        },
    )
    .await
}

/// DynamoDB `TableStatus=ACTIVE`.
pub async fn wait_dynamodb_table_active(ctx: &ExecCtx<'_>, table_name: &str) -> Result<()> {
    let args = argv(&["dynamodb", "describe-table", "--table-name", table_name]);
    poll_until(
        ctx,
        "dynamodb table active",
        &args,
        40,
        Duration::from_millis(500),
        |json| match jsonx::extract_string(json, "Table.TableStatus").as_deref() {
            Some("ACTIVE") => Poll::Ready,
            other => Poll::Pending(other.unwrap_or("unknown").to_string()),
        },
    )
    .await
}

/// RDS `DBInstanceStatus=available`.
pub async fn wait_rds_available(ctx: &ExecCtx<'_>, instance_id: &str) -> Result<()> {
    let args = argv(&[
        "rds",
        "describe-db-instances",
        "--db-instance-identifier",
        instance_id,
    ]);
    poll_until(
        ctx,
        "rds instance available",
        &args,
        60,
        Duration::from_millis(900),
        |json| {
            match jsonx::extract_string(json, "DBInstances[0].DBInstanceStatus").as_deref() {
                Some("available") => Poll::Ready,
                Some("failed") | Some("incompatible-parameters") => {
                    Poll::Failed("db instance entered a failed state".to_string())
                }
                other => Poll::Pending(other.unwrap_or("unknown").to_string()),
            }
        },
    )
    .await
}

/// EFS `LifeCycleState=available`.
pub async fn wait_efs_available(ctx: &ExecCtx<'_>, file_system_id: &str) -> Result<()> {
    let args = argv(&[
        "efs",
        "describe-file-systems",
        "--file-system-id",
        file_system_id,
    ]);
    poll_until(
        ctx,
        "efs file system available",
        &args,
        40,
        Duration::from_millis(500),
        |json| {
            match jsonx::extract_string(json, "FileSystems[0].LifeCycleState").as_deref() {
                Some("available") => Poll::Ready,
                other => Poll::Pending(other.unwrap_or("unknown").to_string()),
            }
        },
    )
    .await
}

/// OpenSearch domain `Created && !Processing`.
pub async fn wait_opensearch_ready(ctx: &ExecCtx<'_>, domain_name: &str) -> Result<()> {
    let args = argv(&["opensearch", "describe-domain", "--domain-name", domain_name]);
    poll_until(
        ctx,
        "opensearch domain ready",
        &args,
        60,
        Duration::from_millis(900),
        |json| {
            let created = jsonx::lookup_path(json, "DomainStatus.Created")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let processing = jsonx::lookup_path(json, "DomainStatus.Processing")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            if created && !processing {
                Poll::Ready
            } else {
                Poll::Pending(format!("created={created} processing={processing}"))
            }
        },
    )
    .await
}

/// MSK cluster `State=ACTIVE`.
pub async fn wait_msk_active(ctx: &ExecCtx<'_>, cluster_arn: &str) -> Result<()> {
    let args = argv(&["kafka", "describe-cluster-v2", "--cluster-arn", cluster_arn]);
    poll_until(
        ctx,
        "msk cluster active",
        &args,
        60,
        Duration::from_millis(900),
        |json| match jsonx::extract_string(json, "ClusterInfo.State").as_deref() {
            Some("ACTIVE") => Poll::Ready,
            Some("FAILED") => Poll::Failed("cluster entered FAILED state".to_string()),
            other => Poll::Pending(other.unwrap_or("unknown").to_string()),
        },
    )
    .await
}

/// ELBv2 load balancer `State.Code=active`; fails fast on `failed`.
pub async fn wait_elbv2_active(ctx: &ExecCtx<'_>, lb_arn: &str) -> Result<()> {
    let args = argv(&[
        "elbv2",
        "describe-load-balancers",
        "--load-balancer-arns",
        lb_arn,
    ]);
    poll_until(
        ctx,
        "load balancer active",
        &args,
        40,
        Duration::from_millis(600),
        |json| match jsonx::extract_string(json, "LoadBalancers[0].State.Code").as_deref() {
            Some("active") => Poll::Ready,
            Some("failed") => Poll::Failed("load balancer provisioning failed".to_string()),
            other => Poll::Pending(other.unwrap_or("unknown").to_string()),
        },
    )
    .await
}

/// ACM certificate `Status=ISSUED`.
///
/// Fails fast on `FAILED|EXPIRED|REVOKED`. On `PENDING_VALIDATION`, makes a
/// one-time best-effort Route53 UPSERT of the DNS validation record into the
/// longest-suffix-matching hosted zone, then keeps polling.
pub async fn wait_acm_issued(ctx: &ExecCtx<'_>, cert_arn: &str) -> Result<()> {
    let describe = argv(&["acm", "describe-certificate", "--certificate-arn", cert_arn]);
    let mut dns_upsert_attempted = false;

    for attempt in 1..=60u32 {
        match ctx.run_aws_json(&describe).await {
            Ok(json) => {
                let status = jsonx::extract_string(&json, "Certificate.Status");
                match status.as_deref() {
                    Some("ISSUED") => return Ok(()),
                    Some("FAILED") | Some("EXPIRED") | Some("REVOKED") => {
                        return Err(MakerError::Provider {
                            op: "acm certificate issued".to_string(),
                            output: format!(
                                "certificate in terminal state {}",
                                status.unwrap_or_default()
                            ),
                        });
                    }
                    Some("PENDING_VALIDATION") if !dns_upsert_attempted => {
                        dns_upsert_attempted = true;
                        if let Err(err) = upsert_dns_validation(ctx, &json).await {
                            ctx.log().note(&format!(
                                "dns validation upsert failed, continuing to wait: {err}"
                            ));
                        }
                    }
                    _ => {}
                }
            }
            Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
            Err(err) => {
                debug!(attempt, err = %err, "acm describe failed; still waiting");
            }
        }
        ctx.sleep(Duration::from_millis(900) * attempt).await?;
    }

    Err(MakerError::Provider {
        op: "acm certificate issued".to_string(),
        output: "not ISSUED after 60 attempts".to_string(),
    })
}

/// Create the certificate's DNS validation record in the best-matching zone.
async fn upsert_dns_validation(ctx: &ExecCtx<'_>, cert: &Value) -> Result<()> {
    let record_name =
        jsonx::extract_string(cert, "Certificate.DomainValidationOptions[0].ResourceRecord.Name")
            .ok_or_else(|| MakerError::Provider {
                op: "acm dns validation".to_string(),
                output: "no validation record in describe output".to_string(),
            })?;
    let record_type =
        jsonx::extract_string(cert, "Certificate.DomainValidationOptions[0].ResourceRecord.Type")
            .unwrap_or_else(|| "CNAME".to_string());
    let record_value =
        jsonx::extract_string(cert, "Certificate.DomainValidationOptions[0].ResourceRecord.Value")
            .ok_or_else(|| MakerError::Provider {
                op: "acm dns validation".to_string(),
                output: "no validation record value".to_string(),
            })?;

    let zones = ctx
        .run_aws_json(&argv(&["route53", "list-hosted-zones"]))
        .await?;
    let zone_id = best_zone_for(&zones, &record_name).ok_or_else(|| MakerError::Provider {
        op: "acm dns validation".to_string(),
        output: format!("no hosted zone matches {record_name}"),
    })?;

    let batch = json!({
        "Changes": [{
            "Action": "UPSERT",
            "ResourceRecordSet": {
                "Name": record_name,
                "Type": record_type,
                "TTL": 300,
                "ResourceRecords": [{"Value": record_value}],
            }
        }]
    });

    let change = vec![
        "route53".to_string(),
        "change-resource-record-sets".to_string(),
        "--hosted-zone-id".to_string(),
        zone_id,
        "--change-batch".to_string(),
        batch.to_string(),
    ];
    let out = ctx.run_aws(&change, None).await?;
    if out.success() {
        ctx.log()
            .remediation(&format!("upserted dns validation record {record_name}"));
        Ok(())
    } else {
        Err(MakerError::Provider {
            op: "route53 change-resource-record-sets".to_string(),
            output: out.output,
        })
    }
}

/// Hosted zone id whose name is the longest suffix of `record_name`.
fn best_zone_for(zones: &Value, record_name: &str) -> Option<String> {
    let record = record_name.trim_end_matches('.');
    let mut best: Option<(usize, String)> = None;
    for zone in zones.get("HostedZones")?.as_array()? {
        let name = zone.get("Name")?.as_str()?.trim_end_matches('.');
        if record == name || record.ends_with(&format!(".{name}")) {
            let id = zone.get("Id")?.as_str()?.to_string();
            if best.as_ref().map(|(len, _)| name.len() > *len).unwrap_or(true) {
                best = Some((name.len(), id));
            }
        }
    }
    best.map(|(_, id)| id.trim_start_matches("/hostedzone/").to_string())
}

/// Tagging-API visibility for ARNs with no service-native waiter.
pub async fn wait_arn_visible(ctx: &ExecCtx<'_>, arn: &str) -> Result<()> {
    let args = argv(&[
        "resourcegroupstaggingapi",
        "get-resources",
        "--resource-arn-list",
        arn,
    ]);
    poll_until(
        ctx,
        "arn visible to tagging api",
        &args,
        20,
        Duration::from_millis(500),
        |json| {
            let found = json
                .get("ResourceTagMappingList")
                .and_then(Value::as_array)
                .map(|l| !l.is_empty())
                .unwrap_or(false);
            if found {
                Poll::Ready
            } else {
                Poll::Pending("not visible".to_string())
            }
        },
    )
    .await
}

/// EKS cluster active, via the provider-native waiter.
pub async fn wait_eks_cluster_active(ctx: &ExecCtx<'_>, name: &str) -> Result<()> {
    native_wait(ctx, &argv(&["eks", "wait", "cluster-active", "--name", name])).await
}

/// EKS nodegroup deleted, via the provider-native waiter.
pub async fn wait_eks_nodegroup_deleted(
    ctx: &ExecCtx<'_>,
    cluster: &str,
    nodegroup: &str,
) -> Result<()> {
    native_wait(
        ctx,
        &argv(&[
            "eks",
            "wait",
            "nodegroup-deleted",
            "--cluster-name",
            cluster,
            "--nodegroup-name",
            nodegroup,
        ]),
    )
    .await
}

/// CloudFront distribution deployed, via the provider-native waiter.
pub async fn wait_cloudfront_deployed(ctx: &ExecCtx<'_>, distribution_id: &str) -> Result<()> {
    native_wait(
        ctx,
        &argv(&["cloudfront", "wait", "distribution-deployed", "--id", distribution_id]),
    )
    .await
}
