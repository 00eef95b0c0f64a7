//! API Gateway pivots.

use super::{argv, retry_original, ArmScope, Remediation};
use crate::context::ExecCtx;
use crate::domain::{MakerError, Result};
use crate::jsonx;
use crate::normalize::{flag_value, set_flag_value};

/// `apigateway delete-rest-api --api-id` uses the v1 flag name; rewrite to
/// `--rest-api-id`. If the API still cannot be found the id belongs to an
/// HTTP API, so tear it down through `apigatewayv2 delete-api` instead.
pub(super) async fn rest_api_flag_pivot(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let api_id = flag_value(&scope.args, "--api-id")
        .or_else(|| flag_value(&scope.args, "--rest-api-id"))
        .map(String::from);
    let Some(api_id) = api_id else {
        return Ok(Remediation::NotHandled);
    };

    if let Some(pos) = scope.args.iter().position(|a| a == "--api-id") {
        scope.args[pos] = "--rest-api-id".to_string();
        ctx.log()
            .remediation("rewrote apigateway --api-id to --rest-api-id");
        let outcome = retry_original(ctx, scope).await?;
        if matches!(outcome, Remediation::Handled) {
            return Ok(outcome);
        }
        if !scope
            .output
            .to_lowercase()
            .contains("invalid api identifier specified")
        {
            return Ok(outcome);
        }
    }

    // v1 persistently rejects the identifier: the id is an HTTP (v2) api.
    scope.args = argv(&["apigatewayv2", "delete-api", "--api-id", &api_id]);
    ctx.log().remediation(&format!(
        "falling back to apigatewayv2 delete-api for {api_id}"
    ));
    retry_original(ctx, scope).await
}

/// `apigatewayv2 create-api --target` rejected over the target resolves the
/// account id and rebuilds the canonical Lambda function ARN.
pub(super) async fn lambda_target_arn(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
) -> Result<Remediation> {
    let Some(target) = flag_value(&scope.args, "--target").map(String::from) else {
        return Ok(Remediation::NotHandled);
    };
    let Some(function_name) = lambda_function_name(&target) else {
        return Ok(Remediation::NotHandled);
    };

    let identity = match ctx
        .run_aws_json(&argv(&["sts", "get-caller-identity"]))
        .await
    {
        Ok(json) => json,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => return Ok(Remediation::NotHandled),
    };
    let Some(account) = jsonx::extract_string(&identity, "Account") else {
        return Ok(Remediation::NotHandled);
    };
    let region = if ctx.opts.region.is_empty() {
        "us-east-1".to_string()
    } else {
        ctx.opts.region.clone()
    };

    let arn = format!("arn:aws:lambda:{region}:{account}:function:{function_name}");
    set_flag_value(&mut scope.args, "--target", &arn);
    ctx.log()
        .remediation(&format!("rebuilt apigatewayv2 target as {arn}"));
    retry_original(ctx, scope).await
}

/// Function name from a bare name, partial ARN, or region-less ARN.
fn lambda_function_name(target: &str) -> Option<String> {
    if target.starts_with("arn:") {
        return target
            .rsplit_once(":function:")
            .map(|(_, name)| name.split(':').next().unwrap_or(name).to_string());
    }
    if target.starts_with('<') || target.contains("://") {
        return None;
    }
    Some(target.to_string())
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
            region: "eu-west-1".to_string(),
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
    fn test_lambda_function_name_forms() {
        assert_eq!(lambda_function_name("my-fn").as_deref(), Some("my-fn"));
        assert_eq!(
            lambda_function_name("arn:aws:lambda:us-east-1:1:function:my-fn").as_deref(),
            Some("my-fn")
        );
        assert_eq!(
            lambda_function_name("arn:aws:lambda:us-east-1:1:function:my-fn:PROD").as_deref(),
            Some("my-fn")
        );
        assert!(lambda_function_name("<LAMBDA_ARN>").is_none());
    }

    #[tokio::test]
    async fn test_flag_rewrite_succeeds() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(&["delete-rest-api"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["apigateway", "delete-rest-api", "--api-id", "abc123"],
            "Unknown options: --api-id",
            &mut bindings,
        );
        let outcome = rest_api_flag_pivot(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert!(scope.args.contains(&"--rest-api-id".to_string()));
    }

    #[tokio::test]
    async fn test_falls_back_to_v2_delete() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(
            &["delete-rest-api"],
            ScriptedRunner::fail("NotFoundException: Invalid API identifier specified 1:abc123"),
        );
        runner.stub(&["apigatewayv2 delete-api"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["apigateway", "delete-rest-api", "--api-id", "abc123"],
            "NotFoundException: Invalid API identifier specified 1:abc123",
            &mut bindings,
        );
        let outcome = rest_api_flag_pivot(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert_eq!(scope.args[..2], ["apigatewayv2", "delete-api"]);
        assert!(scope.args.contains(&"abc123".to_string()));
    }

    #[tokio::test]
    async fn test_target_arn_rebuild() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(
            &["get-caller-identity"],
            ScriptedRunner::ok(r#"{"Account":"123456789012"}"#),
        );
        runner.stub(&["create-api"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        let mut scope = scope_for(
            &["apigatewayv2", "create-api", "--name", "api", "--protocol-type", "HTTP", "--target", "my-fn"],
            "BadRequestException: target is not a valid integration uri",
            &mut bindings,
        );
        let outcome = lambda_target_arn(&ctx, &mut scope).await.expect("arm");
        assert!(matches!(outcome, Remediation::Handled));
        assert_eq!(
            flag_value(&scope.args, "--target"),
            Some("arn:aws:lambda:eu-west-1:123456789012:function:my-fn")
        );
    }
}
