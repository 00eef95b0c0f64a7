//! S3 bucket teardown: empty the bucket, then delete it.

use serde_json::{json, Value};

use super::{retry_original, ArmScope, Remediation};
use crate::context::ExecCtx;
use crate::domain::{MakerError, Result};

/// Deletion batch cap enforced by the DeleteObjects API.
const DELETE_BATCH: usize = 1000;

/// Pagination rounds; a bucket churning faster than this is not drainable.
const MAX_ROUNDS: usize = 64;

/// Drain versions, delete markers, and plain objects, then retry the
/// bucket delete.
pub(super) async fn empty_then_delete(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(bucket) = bucket_name(&scope.args) else {
        return Ok(Remediation::NotHandled);
    };
    ctx.log().remediation(&format!(
        "emptying bucket {bucket} before delete (versions, markers, objects)"
    ));

    for _round in 0..MAX_ROUNDS {
        let listed = list_json(
            ctx,
            &[
                "s3api",
                "list-object-versions",
                "--bucket",
                &bucket,
                "--max-items",
                "1000",
            ],
        )
        .await?;
        let mut objects = collect_keyed(&listed, "Versions");
        objects.extend(collect_keyed(&listed, "DeleteMarkers"));
        if objects.is_empty() {
            break;
        }
        for batch in objects.chunks(DELETE_BATCH) {
            delete_batch(ctx, &bucket, batch).await?;
        }
    }

    for _round in 0..MAX_ROUNDS {
        let listed = list_json(
            ctx,
            &["s3api", "list-objects-v2", "--bucket", &bucket, "--max-items", "1000"],
        )
        .await?;
        let objects: Vec<Value> = listed
            .get("Contents")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|o| o.get("Key").and_then(Value::as_str))
                    .map(|key| json!({"Key": key}))
                    .collect()
            })
            .unwrap_or_default();
        if objects.is_empty() {
            break;
        }
        for batch in objects.chunks(DELETE_BATCH) {
            delete_batch(ctx, &bucket, batch).await?;
        }
    }

    retry_original(ctx, scope).await
}

/// `{Key, VersionId}` pairs from a list-object-versions field.
fn collect_keyed(listed: &Value, field: &str) -> Vec<Value> {
    listed
        .get(field)
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|entry| {
                    let key = entry.get("Key")?.as_str()?;
                    let version = entry.get("VersionId")?.as_str()?;
                    Some(json!({"Key": key, "VersionId": version}))
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn delete_batch(ctx: &ExecCtx<'_>, bucket: &str, batch: &[Value]) -> Result<()> {
    let payload = json!({"Objects": batch, "Quiet": true});
    let args = vec![
        "s3api".to_string(),
        "delete-objects".to_string(),
        "--bucket".to_string(),
        bucket.to_string(),
        "--delete".to_string(),
        payload.to_string(),
    ];
    let out = ctx.run_aws(&args, None).await?;
    if !out.success() {
        return Err(MakerError::Provider {
            op: "delete-objects".to_string(),
            output: out.output,
        });
    }
    Ok(())
}

async fn list_json(ctx: &ExecCtx<'_>, tokens: &[&str]) -> Result<Value> {
    let args: Vec<String> = tokens.iter().map(|s| s.to_string()).collect();
    match ctx.run_aws_json(&args).await {
        Ok(json) => Ok(json),
        Err(MakerError::Cancelled) => Err(MakerError::Cancelled),
        Err(_) => Ok(Value::Null),
    }
}

/// Bucket from `--bucket` or an `s3://` uri (the `s3 rb` form).
fn bucket_name(args: &[String]) -> Option<String> {
    if let Some(bucket) = crate::normalize::flag_value(args, "--bucket") {
        return Some(bucket.to_string());
    }
    for arg in args {
        if let Some(rest) = arg.strip_prefix("s3://") {
            let bucket = rest.split('/').next().unwrap_or(rest);
            if !bucket.is_empty() {
                return Some(bucket.to_string());
            }
        }
    }
    None
}
