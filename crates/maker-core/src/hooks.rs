//! Post-run hooks.
//!
//! Domain-specific guidance printed after a successful plan, gated on the
//! question and the bindings that survived execution. Hooks only write to
//! the log; they never mutate state.

use crate::bindings::BindingStore;
use crate::context::ExecCtx;
use crate::domain::Plan;

/// Run every applicable hook.
pub fn run_post_hooks(ctx: &ExecCtx<'_>, plan: &Plan, bindings: &BindingStore) {
    if plan.question.to_lowercase().contains("openclaw") {
        openclaw_hook(ctx, bindings);
    }
}

/// Connect/pairing instructions for an openclaw gateway deployment.
fn openclaw_hook(ctx: &ExecCtx<'_>, bindings: &BindingStore) {
    let endpoint = bindings
        .get("CLOUDFRONT_DOMAIN")
        .or_else(|| bindings.get("ALB_DNS"));
    let Some(endpoint) = endpoint else {
        return;
    };
    let port = bindings.get("APP_PORT").unwrap_or("8080");

    let log = ctx.log();
    log.line("");
    log.line("openclaw gateway deployed:");
    log.line(&format!("  connect: https://{endpoint}:{port}"));
    if let Some(instance) = bindings.get("INSTANCE_ID") {
        log.line(&format!(
            "  shell:   aws ssm start-session --target {instance}"
        ));
    }
    if let Ok(token) = std::env::var("OPENCLAW_GATEWAY_TOKEN") {
        if !token.is_empty() {
            log.line("  pairing: use the OPENCLAW_GATEWAY_TOKEN already set in this shell");
        }
    } else {
        log.line("  pairing: set OPENCLAW_GATEWAY_TOKEN before first connect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecOptions, LogSink};
    use crate::fakes::ScriptedRunner;

    #[test]
    fn test_openclaw_hook_prints_endpoints() {
        let (sink, capture) = LogSink::capture();
        let opts = ExecOptions {
            log: sink,
            ..Default::default()
        };
        let runner = ScriptedRunner::new();
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        bindings.set("ALB_DNS", "my-alb.us-east-1.elb.amazonaws.com");
        bindings.set("APP_PORT", "18789");
        bindings.set("INSTANCE_ID", "i-0abc");

        let plan = Plan {
            question: "deploy openclaw on ec2".to_string(),
            ..Default::default()
        };
        run_post_hooks(&ctx, &plan, &bindings);

        let contents = capture.contents();
        assert!(contents.contains("my-alb.us-east-1.elb.amazonaws.com:18789"));
        assert!(contents.contains("i-0abc"));
    }

    #[test]
    fn test_hook_skipped_without_question_match() {
        let (sink, capture) = LogSink::capture();
        let opts = ExecOptions {
            log: sink,
            ..Default::default()
        };
        let runner = ScriptedRunner::new();
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut bindings = BindingStore::new();
        bindings.set("ALB_DNS", "my-alb.elb.amazonaws.com");
        let plan = Plan {
            question: "create a vpc".to_string(),
            ..Default::default()
        };
        run_post_hooks(&ctx, &plan, &bindings);
        assert!(capture.contents().is_empty());
    }

    #[test]
    fn test_hook_needs_an_endpoint_binding() {
        let (sink, capture) = LogSink::capture();
        let opts = ExecOptions {
            log: sink,
            ..Default::default()
        };
        let runner = ScriptedRunner::new();
        let ctx = ExecCtx::new(&opts, &runner, None);

        let plan = Plan {
            question: "openclaw please".to_string(),
            ..Default::default()
        };
        run_post_hooks(&ctx, &plan, &BindingStore::new());
        assert!(capture.contents().is_empty());
    }
}
