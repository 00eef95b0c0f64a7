//! Lambda teardown expansion.

use super::{argv, iam, step};
use crate::context::ExecCtx;
use crate::domain::{MakerError, PlanStep, Result};
use crate::jsonx;
use crate::normalize::flag_value;
use serde_json::Value;

/// Expand `lambda delete-function` into its drain-then-delete chain.
///
/// Event-source mappings and a function URL block deletion or leak; the log
/// group survives it. With a full-teardown question, the execution role and
/// VPC security groups are torn down too.
pub(super) async fn expand_delete_function(
    ctx: &ExecCtx<'_>,
    original: &PlanStep,
    full_teardown: bool,
    notes: &mut Vec<String>,
) -> Result<Option<Vec<PlanStep>>> {
    let Some(function_name) = flag_value(&original.args, "--function-name") else {
        return Ok(None);
    };
    let mut steps = Vec::new();

    match ctx
        .run_aws_json(&argv(&[
            "lambda",
            "list-event-source-mappings",
            "--function-name",
            function_name,
        ]))
        .await
    {
        Ok(json) => {
            if let Some(mappings) = json.get("EventSourceMappings").and_then(Value::as_array) {
                for mapping in mappings {
                    if let Some(uuid) = mapping.get("UUID").and_then(Value::as_str) {
                        steps.push(step(
                            argv(&["lambda", "delete-event-source-mapping", "--uuid", uuid]),
                            "drain event source mapping before function delete",
                        ));
                    }
                }
            }
        }
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => {}
    }

    let url_config = ctx
        .run_aws_json(&argv(&[
            "lambda",
            "get-function-url-config",
            "--function-name",
            function_name,
        ]))
        .await;
    match url_config {
        Ok(json) if json.get("FunctionUrl").is_some() => {
            steps.push(step(
                argv(&[
                    "lambda",
                    "delete-function-url-config",
                    "--function-name",
                    function_name,
                ]),
                "remove function url before delete",
            ));
        }
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        _ => {}
    }

    // Full teardown needs the configuration before the function is gone.
    let mut role_teardown = Vec::new();
    let mut sg_teardowns = Vec::new();
    if full_teardown {
        match ctx
            .run_aws_json(&argv(&["lambda", "get-function", "--function-name", function_name]))
            .await
        {
            Ok(json) => {
                if let Some(role_arn) = jsonx::extract_string(&json, "Configuration.Role") {
                    let delete_role = PlanStep::new([
                        "iam",
                        "delete-role",
                        "--role-name",
                        role_arn.rsplit("role/").next().unwrap_or(&role_arn),
                    ]);
                    role_teardown = iam::expand_delete_role(ctx, &delete_role)
                        .await?
                        .unwrap_or_else(|| vec![delete_role]);
                }
                if let Some(groups) =
                    jsonx::lookup_path(&json, "Configuration.VpcConfig.SecurityGroupIds")
                        .and_then(Value::as_array)
                {
                    for group in groups.iter().filter_map(Value::as_str) {
                        let delete_sg =
                            PlanStep::new(["ec2", "delete-security-group", "--group-id", group]);
                        let expanded =
                            super::ec2::expand_delete_security_group(ctx, &delete_sg, notes)
                                .await?
                                .unwrap_or_else(|| vec![delete_sg]);
                        sg_teardowns.extend(expanded);
                    }
                }
            }
            Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
            Err(_) => {}
        }
    }

    steps.push(original.clone());
    steps.push(step(
        vec![
            "logs".to_string(),
            "delete-log-group".to_string(),
            "--log-group-name".to_string(),
            format!("/aws/lambda/{function_name}"),
        ],
        "remove the function's log group",
    ));
    steps.extend(role_teardown);
    steps.extend(sg_teardowns);

    Ok(Some(steps))
}
