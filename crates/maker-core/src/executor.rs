//! Top-level plan execution loop.
//!
//! Steps run strictly sequentially; within a step the engine normalizes,
//! validates, substitutes bindings, resolves placeholders, runs the provider
//! CLI, and on failure hands the captured output to the remediation
//! pipeline. Bindings learned from output feed every later step.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::bindings::BindingStore;
use crate::classify::classify_failure;
use crate::context::ExecCtx;
use crate::domain::{Failure, FailureCategory, MakerError, Plan, Result};
use crate::gcp;
use crate::hooks;
use crate::normalize::{
    apply_plan_bindings, is_delete_like_op, normalize_args, validate_command,
};
use crate::remediate::{remediate, ArmScope, Remediation};
use crate::resolve::resolve_placeholders;
use crate::userdata;

/// Summary of a completed plan run.
#[derive(Debug, Clone)]
pub struct PlanReport {
    /// Run identifier, stamped into the structured log events.
    pub run_id: Uuid,

    /// When execution began.
    pub started_at: DateTime<Utc>,

    /// Steps executed (enriched count, not the planner's original count).
    pub steps_executed: usize,

    /// Final binding snapshot.
    pub bindings: BTreeMap<String, String>,

    /// Diagnostics accumulated by enrichment and execution.
    pub notes: Vec<String>,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

/// Execute every step of the plan, remediating failures as they come.
///
/// Returns the report on success; the first unrecoverable failure aborts
/// with an error naming the step index and reason.
pub async fn execute_plan(ctx: &ExecCtx<'_>, plan: &mut Plan) -> Result<PlanReport> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let started = Instant::now();
    let mut bindings = BindingStore::new();
    let steps = plan.steps.clone();
    let total = steps.len();

    info!(run_id = %run_id, steps = total, "starting plan execution");

    for (index, step) in steps.iter().enumerate() {
        if ctx.opts.cancel.is_cancelled() {
            return Err(MakerError::Cancelled);
        }

        if gcp::is_gcloud_step(&step.args) {
            execute_gcloud_step(ctx, plan, index, total, step, &mut bindings).await?;
            continue;
        }

        let mut args = normalize_args(&step.args);
        validate_command(&args, ctx.opts.destroyer)?;
        args = apply_plan_bindings(&args, &bindings);
        resolve_placeholders(ctx, index, &mut args, &mut bindings, "").await?;
        userdata::apply_user_data(&mut args, &bindings);
        if !step.produces.is_empty() {
            args.push("--output".to_string());
            args.push("json".to_string());
        }

        ctx.log()
            .line(&format!("running {}/{}: aws {}", index + 1, total, args.join(" ")));
        let out = ctx.run_aws(&args, None).await?;

        if out.success() {
            bindings.learn_from_produces(&step.produces, &out.output);
            bindings.learn_plan_bindings(&args, &out.output);
            continue;
        }

        let failure = classify_failure(&args, &out.output);
        info!(
            run_id = %run_id,
            step = index,
            code = %failure.code,
            category = ?failure.category,
            "step failed, entering remediation"
        );

        let (outcome, final_args, final_output, final_failure) = {
            let mut scope = ArmScope::new(
                args.clone(),
                None,
                failure,
                out.output.clone(),
                &mut bindings,
            );
            let outcome = remediate(ctx, &mut scope).await?;
            (
                outcome,
                scope.args.clone(),
                scope.output.clone(),
                scope.failure.clone(),
            )
        };

        match outcome {
            Remediation::Handled => {
                bindings.learn_from_produces(&step.produces, &final_output);
                bindings.learn_plan_bindings(&final_args, &final_output);
            }
            Remediation::HandledWithError(err) => {
                if should_ignore_failure(&final_args, &final_failure, ctx.opts.destroyer) {
                    ctx.log().note("ignoring non-fatal error");
                    plan.notes
                        .push(format!("step {index} ignored after remediation: {err}"));
                } else {
                    return Err(abort_error(index, &final_args, &err.to_string(), &final_output));
                }
            }
            Remediation::NotHandled => {
                return Err(abort_error(
                    index,
                    &final_args,
                    &describe_failure(&final_failure),
                    &final_output,
                ));
            }
        }
    }

    hooks::run_post_hooks(ctx, plan, &bindings);

    let report = PlanReport {
        run_id,
        started_at,
        steps_executed: total,
        bindings: bindings.snapshot(),
        notes: plan.notes.clone(),
        duration_ms: started.elapsed().as_millis() as u64,
    };
    info!(run_id = %run_id, duration_ms = report.duration_ms, "plan execution complete");
    Ok(report)
}

/// gcloud steps share validation and binding learning; the remediation
/// pack is AWS-only, so a gcloud failure aborts directly.
async fn execute_gcloud_step(
    ctx: &ExecCtx<'_>,
    plan: &mut Plan,
    index: usize,
    total: usize,
    step: &crate::domain::PlanStep,
    bindings: &mut BindingStore,
) -> Result<()> {
    let mut args = normalize_args(&step.args);
    gcp::validate_gcloud_command(&args, ctx.opts.destroyer)?;
    args = apply_plan_bindings(&args, bindings);
    if crate::normalize::has_unresolved_placeholders(&args) {
        return Err(MakerError::PlaceholderUnresolved {
            step: index,
            placeholders: crate::normalize::unresolved_placeholders(&args),
        });
    }

    let argv = gcp::gcloud_argv(ctx.opts, &args, !step.produces.is_empty());
    ctx.log()
        .line(&format!("running {}/{}: {}", index + 1, total, argv.join(" ")));
    let out = ctx.runner.run(ctx.opts, &argv, None).await?;

    if out.success() {
        bindings.learn_from_produces(&step.produces, &out.output);
        return Ok(());
    }

    let failure = classify_failure(&args, &out.output);
    if should_ignore_failure(&args, &failure, ctx.opts.destroyer) {
        ctx.log().note("ignoring non-fatal error");
        plan.notes
            .push(format!("gcloud step {index} ignored: {}", failure.code));
        return Ok(());
    }
    Err(abort_error(index, &args, &describe_failure(&failure), &out.output))
}

/// Destroyer teardown steps tolerate targets that are already gone.
pub fn should_ignore_failure(args: &[String], failure: &Failure, destroyer: bool) -> bool {
    if !destroyer {
        return false;
    }
    let op = args.get(1).map(String::as_str).unwrap_or("");
    is_delete_like_op(op) && failure.category == FailureCategory::NotFound
}

fn abort_error(step: usize, args: &[String], reason: &str, output: &str) -> MakerError {
    MakerError::CommandAborted {
        step,
        command: args.join(" "),
        service: args.first().cloned().unwrap_or_default(),
        op: args.get(1).cloned().unwrap_or_default(),
        reason: reason.to_string(),
        output: output.to_string(),
    }
}

fn describe_failure(failure: &Failure) -> String {
    if failure.code.is_empty() {
        format!("{:?} failure", failure.category)
    } else {
        failure.code.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecOptions, LogSink, PlanStep, ValidationErrorKind};
    use crate::fakes::{ScriptedLlm, ScriptedRunner};

    fn opts_with_capture() -> (ExecOptions, crate::domain::options::LogCapture) {
        let (sink, capture) = LogSink::capture();
        (
            ExecOptions {
                log: sink,
                ..Default::default()
            },
            capture,
        )
    }

    #[tokio::test]
    async fn test_plan_success_learns_produces() {
        let (opts, _capture) = opts_with_capture();
        let runner = ScriptedRunner::new();
        runner.stub(
            &["create-vpc"],
            ScriptedRunner::ok(r#"{"Vpc":{"VpcId":"vpc-123"}}"#),
        );
        runner.stub(&["create-subnet"], ScriptedRunner::ok(r#"{"Subnet":{"SubnetId":"subnet-1"}}"#));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut create_vpc = PlanStep::new(["ec2", "create-vpc", "--cidr-block", "10.0.0.0/16"]);
        create_vpc
            .produces
            .insert("VPC_ID".to_string(), "Vpc.VpcId".to_string());
        let mut plan = Plan {
            steps: vec![
                create_vpc,
                PlanStep::new(["ec2", "create-subnet", "--vpc-id", "<VPC_ID>", "--cidr-block", "10.0.0.0/24"]),
            ],
            ..Default::default()
        };

        let report = execute_plan(&ctx, &mut plan).await.expect("plan");
        assert_eq!(report.steps_executed, 2);
        assert_eq!(report.bindings["VPC_ID"], "vpc-123");

        // The learned binding reached the second command's argv.
        assert!(runner
            .call_lines()
            .iter()
            .any(|l| l.contains("create-subnet") && l.contains("vpc-123")));
    }

    #[tokio::test]
    async fn test_scenario_create_to_update_pivot() {
        let (opts, capture) = opts_with_capture();
        let runner = ScriptedRunner::new();
        runner.stub_times(
            &["create-schedule"],
            1,
            ScriptedRunner::fail("ConflictException: schedule s1 already exists"),
        );
        runner.stub(&["update-schedule"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut plan = Plan {
            steps: vec![PlanStep::new([
                "scheduler",
                "create-schedule",
                "--name",
                "s1",
                "--schedule-expression",
                "rate(5 minutes)",
            ])],
            ..Default::default()
        };

        execute_plan(&ctx, &mut plan).await.expect("plan");
        assert_eq!(runner.count_calls("update-schedule"), 1);
        assert!(capture
            .contents()
            .contains("[maker] remediation attempted: rewrote scheduler create-schedule to update-schedule"));
    }

    #[tokio::test]
    async fn test_validation_abort_before_spawn() {
        let (opts, _capture) = opts_with_capture();
        let runner = ScriptedRunner::new();
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut plan = Plan {
            steps: vec![PlanStep::new(["ec2", "delete-vpc", "--vpc-id", "vpc-1"])],
            ..Default::default()
        };
        let err = execute_plan(&ctx, &mut plan).await.expect_err("rejected");
        assert_eq!(
            err.validation_kind(),
            Some(ValidationErrorKind::DestructiveVerb)
        );
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_destroyer_ignores_not_found_delete() {
        let (opts, capture) = opts_with_capture();
        let opts = ExecOptions {
            destroyer: true,
            ..opts
        };
        let runner = ScriptedRunner::new();
        runner.stub(
            &["delete-queue"],
            ScriptedRunner::fail("AWS.SimpleQueueService.NonExistentQueue: does not exist"),
        );
        runner.stub(&["list-buckets"], ScriptedRunner::ok(r#"{"Buckets":[]}"#));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut plan = Plan {
            steps: vec![
                PlanStep::new(["sqs", "delete-queue", "--queue-url", "https://q"]),
                PlanStep::new(["s3api", "list-buckets"]),
            ],
            ..Default::default()
        };
        let report = execute_plan(&ctx, &mut plan).await.expect("plan");
        // Glue's delete idempotency makes this a clean success, not a note,
        // so the plan simply continues.
        assert_eq!(report.steps_executed, 2);
        assert!(capture.contents().contains("[maker] remediation attempted"));
    }

    #[tokio::test]
    async fn test_unhandled_failure_aborts_with_step_index() {
        let (opts, _capture) = opts_with_capture();
        let runner = ScriptedRunner::new();
        runner.stub(&["describe-vpcs"], ScriptedRunner::fail("inexplicable"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut plan = Plan {
            steps: vec![PlanStep::new(["ec2", "describe-vpcs"])],
            ..Default::default()
        };
        let err = execute_plan(&ctx, &mut plan).await.expect_err("abort");
        match err {
            MakerError::CommandAborted { step, service, op, .. } => {
                assert_eq!(step, 0);
                assert_eq!(service, "ec2");
                assert_eq!(op, "describe-vpcs");
            }
            other => panic!("expected CommandAborted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_placeholder_aborts() {
        let (opts, _capture) = opts_with_capture();
        let runner = ScriptedRunner::new();
        let llm = ScriptedLlm::with_responses(["{}", "{}", "{}", "{}"]);
        let ctx = ExecCtx::new(&opts, &runner, Some(&llm));

        let mut plan = Plan {
            steps: vec![PlanStep::new(["ec2", "create-subnet", "--vpc-id", "<NEVER_BOUND>"])],
            ..Default::default()
        };
        let err = execute_plan(&ctx, &mut plan).await.expect_err("unresolved");
        assert!(matches!(err, MakerError::PlaceholderUnresolved { step: 0, .. }));
        assert_eq!(runner.count_calls("create-subnet"), 0);
    }

    #[tokio::test]
    async fn test_user_data_placeholder_reaches_generator_not_cli() {
        let (opts, _capture) = opts_with_capture();
        let runner = ScriptedRunner::new();
        runner.stub(&["run-instances"], ScriptedRunner::ok("{}"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut plan = Plan {
            steps: vec![PlanStep::new([
                "ec2",
                "run-instances",
                "--image-id",
                "ami-1",
                "--user-data",
                "<USER_DATA>",
            ])],
            ..Default::default()
        };
        execute_plan(&ctx, &mut plan).await.expect("plan");

        let call = runner
            .call_lines()
            .into_iter()
            .find(|l| l.contains("run-instances"))
            .expect("call");
        assert!(!call.contains("<USER_DATA>"));
        assert!(call.contains("#!/bin/bash"));
    }

    #[tokio::test]
    async fn test_gcloud_step_qualified_and_validated() {
        let (opts, _capture) = opts_with_capture();
        let opts = ExecOptions {
            gcp_project: "proj".to_string(),
            ..opts
        };
        let runner = ScriptedRunner::new();
        runner.stub(&["gcloud compute"], ScriptedRunner::ok("[]"));
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut plan = Plan {
            steps: vec![PlanStep::new(["gcloud", "compute", "instances", "list"])],
            ..Default::default()
        };
        execute_plan(&ctx, &mut plan).await.expect("plan");

        let call = runner.call_lines().pop().expect("call");
        assert!(call.starts_with("gcloud"));
        assert!(call.contains("--quiet"));
        assert!(call.contains("--project proj"));
    }

    #[tokio::test]
    async fn test_no_destructive_leakage_through_remediation() {
        // A non-destroyer plan whose remediation path runs: every executed
        // argv must stay free of destructive verbs.
        let (opts, _capture) = opts_with_capture();
        let runner = ScriptedRunner::new();
        runner.stub_times(
            &["create-schedule"],
            1,
            ScriptedRunner::fail("ConflictException: already exists"),
        );
        runner.stub(&["update-schedule"], ScriptedRunner::ok("{}"));
        runner.stub(
            &["put-parameter"],
            ScriptedRunner::ok("{}"),
        );
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut plan = Plan {
            steps: vec![
                PlanStep::new(["scheduler", "create-schedule", "--name", "s1"]),
                PlanStep::new(["ssm", "put-parameter", "--name", "p", "--value", "v"]),
            ],
            ..Default::default()
        };
        execute_plan(&ctx, &mut plan).await.expect("plan");

        for line in runner.call_lines() {
            for verb in crate::normalize::DESTRUCTIVE_VERBS {
                assert!(!line.contains(verb), "destructive verb {verb} leaked into {line}");
            }
        }
    }
}
