//! Planning-time plan enrichment.
//!
//! Before execution, destructive and role-bearing steps are expanded into
//! ordered prerequisite chains (detach, drain, delete). Enrichment is
//! side-effect-free aside from read-only describes and never mutates
//! bindings; the runtime remediation path may still expand further.

mod ec2;
mod iam;
mod lambda;
mod roles;

pub use roles::service_principal_for;

use crate::context::ExecCtx;
use crate::domain::{Plan, PlanStep, Result};

/// Expand the plan in place: role ensurance, teardown chains, dedupe.
pub async fn enrich_plan(ctx: &ExecCtx<'_>, plan: &mut Plan) -> Result<()> {
    roles::ensure_roles(ctx, plan).await?;
    expand_teardowns(ctx, plan).await?;
    plan.steps = dedupe_steps(std::mem::take(&mut plan.steps));
    Ok(())
}

/// Per-step teardown expanders keyed on (service, op).
async fn expand_teardowns(ctx: &ExecCtx<'_>, plan: &mut Plan) -> Result<()> {
    let full_teardown = plan.wants_full_teardown();
    let mut out = Vec::with_capacity(plan.steps.len());
    let mut notes = Vec::new();

    for step in &plan.steps {
        let replacement = match (step.service(), step.op()) {
            ("lambda", "delete-function") => {
                lambda::expand_delete_function(ctx, step, full_teardown, &mut notes).await?
            }
            ("iam", "delete-role") => iam::expand_delete_role(ctx, step).await?,
            ("iam", "delete-policy") => iam::expand_delete_policy(ctx, step).await?,
            ("ec2", "delete-security-group") => {
                ec2::expand_delete_security_group(ctx, step, &mut notes).await?
            }
            _ => None,
        };
        match replacement {
            Some(steps) => out.extend(steps),
            None => out.push(step.clone()),
        }
    }

    plan.steps = out;
    plan.notes.extend(notes);
    Ok(())
}

/// Drop later steps whose argv exactly repeats an earlier one.
///
/// Expansion can conceptually introduce cycles (a role prelude referenced
/// from several steps); argv-equality dedupe preserving first occurrence
/// suppresses them. The planner's source order is load-bearing, so no
/// reordering happens here.
pub fn dedupe_steps(steps: Vec<PlanStep>) -> Vec<PlanStep> {
    let mut seen: Vec<Vec<String>> = Vec::new();
    let mut out = Vec::with_capacity(steps.len());
    for step in steps {
        if seen.contains(&step.args) {
            continue;
        }
        seen.push(step.args.clone());
        out.push(step);
    }
    out
}

/// Synthesized prerequisite step.
pub(crate) fn step(args: Vec<String>, reason: &str) -> PlanStep {
    PlanStep {
        args,
        reason: reason.to_string(),
        produces: Default::default(),
    }
}

pub(crate) fn argv(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|s| s.to_string()).collect()
}
