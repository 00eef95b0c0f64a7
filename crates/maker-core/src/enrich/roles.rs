//! Role-ensurance expansion.
//!
//! Every non-IAM step carrying a role flag or an inline `RoleArn` gets a
//! prelude that creates the role, sets a merged trust policy, and attaches
//! the baseline managed policies for its service principal. Principals are
//! aggregated per role name across the whole plan so a role shared by
//! several services trusts all of them.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};

use super::{argv, step};
use crate::context::ExecCtx;
use crate::domain::{MakerError, Plan, PlanStep, Result};
use crate::jsonx;

const LAMBDA_BASIC_EXECUTION: &str =
    "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole";
const ECS_TASK_EXECUTION: &str =
    "arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy";

/// What kind of role a flag denotes; picks the service principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoleKind {
    Generic,
    Execution,
    Task,
}

/// The service principal a (service, op, kind) triple must trust.
pub fn service_principal_for(service: &str, op: &str, kind_is_execution_or_task: bool) -> String {
    match (service, op) {
        ("ecs", _) if kind_is_execution_or_task => "ecs-tasks.amazonaws.com".to_string(),
        ("lambda", _) => "lambda.amazonaws.com".to_string(),
        ("eks", "create-nodegroup") => "ec2.amazonaws.com".to_string(),
        ("eks", _) => "eks.amazonaws.com".to_string(),
        ("ec2", _) | ("autoscaling", _) => "ec2.amazonaws.com".to_string(),
        ("apigateway", _) | ("apigatewayv2", _) => "apigateway.amazonaws.com".to_string(),
        (service, _) => format!("{service}.amazonaws.com"),
    }
}

#[derive(Debug, Default)]
struct RoleRequirement {
    principals: BTreeSet<String>,
    baseline_policies: BTreeSet<&'static str>,
    first_step: usize,
}

/// Monotonic per-role emission state.
#[derive(Debug, Default, Clone, Copy)]
struct RoleState {
    created: bool,
    trust_set: bool,
    policies_attached: bool,
}

/// Aggregate role requirements and inject preludes before first use.
pub(super) async fn ensure_roles(ctx: &ExecCtx<'_>, plan: &mut Plan) -> Result<()> {
    let mut requirements: BTreeMap<String, RoleRequirement> = BTreeMap::new();

    for (index, plan_step) in plan.steps.iter().enumerate() {
        if plan_step.service() == "iam" {
            continue;
        }
        for (role_name, kind) in role_references(plan_step) {
            let req = requirements.entry(role_name).or_default();
            if req.principals.is_empty() {
                req.first_step = index;
            }
            let execish = matches!(kind, RoleKind::Execution | RoleKind::Task);
            req.principals
                .insert(service_principal_for(plan_step.service(), plan_step.op(), execish));
            if plan_step.service() == "lambda" {
                req.baseline_policies.insert(LAMBDA_BASIC_EXECUTION);
            }
            if plan_step.service() == "ecs" && kind == RoleKind::Execution {
                req.baseline_policies.insert(ECS_TASK_EXECUTION);
            }
        }
    }

    if requirements.is_empty() {
        return Ok(());
    }

    let mut out = Vec::with_capacity(plan.steps.len() + requirements.len() * 3);
    let mut states: BTreeMap<String, RoleState> = BTreeMap::new();

    for (index, plan_step) in plan.steps.iter().enumerate() {
        for (role_name, req) in &requirements {
            if req.first_step != index {
                continue;
            }
            let state = states.entry(role_name.clone()).or_default();
            if state.policies_attached {
                continue;
            }
            let prelude = role_prelude(ctx, role_name, req).await?;
            out.extend(prelude);
            state.created = true;
            state.trust_set = true;
            state.policies_attached = true;
        }
        out.push(plan_step.clone());
    }

    plan.steps = out;
    Ok(())
}

/// Build create-role + update-assume-role-policy + baseline attachments.
async fn role_prelude(
    ctx: &ExecCtx<'_>,
    role_name: &str,
    req: &RoleRequirement,
) -> Result<Vec<PlanStep>> {
    let mut principals = req.principals.clone();

    // Merge with the role's existing trust policy so we never clobber
    // principals another system installed.
    match fetch_trust_principals(ctx, role_name).await {
        Ok(existing) => principals.extend(existing),
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(_) => {} // role does not exist yet
    }

    let doc = trust_policy_document(&principals).to_string();
    let mut steps = vec![
        step(
            vec![
                "iam".to_string(),
                "create-role".to_string(),
                "--role-name".to_string(),
                role_name.to_string(),
                "--assume-role-policy-document".to_string(),
                doc.clone(),
            ],
            "ensure execution role exists",
        ),
        step(
            vec![
                "iam".to_string(),
                "update-assume-role-policy".to_string(),
                "--role-name".to_string(),
                role_name.to_string(),
                "--policy-document".to_string(),
                doc,
            ],
            "merge trusted service principals",
        ),
    ];
    for policy_arn in &req.baseline_policies {
        steps.push(step(
            vec![
                "iam".to_string(),
                "attach-role-policy".to_string(),
                "--role-name".to_string(),
                role_name.to_string(),
                "--policy-arn".to_string(),
                policy_arn.to_string(),
            ],
            "attach baseline managed policy",
        ));
    }
    Ok(steps)
}

fn trust_policy_document(principals: &BTreeSet<String>) -> Value {
    let services: Vec<&str> = principals.iter().map(String::as_str).collect();
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": {"Service": services},
            "Action": "sts:AssumeRole",
        }]
    })
}

/// Current trusted service principals of an existing role.
async fn fetch_trust_principals(ctx: &ExecCtx<'_>, role_name: &str) -> Result<Vec<String>> {
    let json = ctx
        .run_aws_json(&argv(&["iam", "get-role", "--role-name", role_name]))
        .await?;
    let mut principals = Vec::new();
    let Some(statements) = jsonx::lookup_path(&json, "Role.AssumeRolePolicyDocument.Statement")
        .and_then(Value::as_array)
    else {
        return Ok(principals);
    };
    for statement in statements {
        match statement.pointer("/Principal/Service") {
            Some(Value::String(s)) => principals.push(s.clone()),
            Some(Value::Array(list)) => {
                principals.extend(list.iter().filter_map(Value::as_str).map(String::from));
            }
            _ => {}
        }
    }
    Ok(principals)
}

/// Role names referenced by a step, with the kind the flag implies.
fn role_references(plan_step: &PlanStep) -> Vec<(String, RoleKind)> {
    const ROLE_FLAGS: &[(&str, RoleKind)] = &[
        ("--role", RoleKind::Generic),
        ("--role-arn", RoleKind::Generic),
        ("--execution-role-arn", RoleKind::Execution),
        ("--task-role-arn", RoleKind::Task),
        ("--service-role", RoleKind::Generic),
        ("--node-role", RoleKind::Generic),
    ];

    let mut refs = Vec::new();
    let args = &plan_step.args;
    for (i, token) in args.iter().enumerate() {
        for (flag, kind) in ROLE_FLAGS {
            if token == flag {
                if let Some(value) = args.get(i + 1) {
                    if let Some(name) = role_name_from(value) {
                        refs.push((name, *kind));
                    }
                }
            }
        }
        // Inline JSON args (task definitions, targets) reference roles too.
        if let Some(inline) = crate::jsonx::parse_inline_json(token) {
            collect_inline_role_arns(&inline, &mut refs);
        }
    }
    refs
}

fn collect_inline_role_arns(value: &Value, refs: &mut Vec<(String, RoleKind)>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                let lowered = key.to_lowercase();
                if lowered == "rolearn" || lowered == "executionrolearn" || lowered == "taskrolearn"
                {
                    if let Some(name) = val.as_str().and_then(role_name_from) {
                        let kind = if lowered == "executionrolearn" {
                            RoleKind::Execution
                        } else if lowered == "taskrolearn" {
                            RoleKind::Task
                        } else {
                            RoleKind::Generic
                        };
                        refs.push((name, kind));
                    }
                }
                collect_inline_role_arns(val, refs);
            }
        }
        Value::Array(list) => {
            for val in list {
                collect_inline_role_arns(val, refs);
            }
        }
        _ => {}
    }
}

/// Role name from an ARN or bare name; placeholders are skipped.
fn role_name_from(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.starts_with('<') {
        return None;
    }
    if let Some(rest) = value.strip_prefix("arn:") {
        return rest.rsplit_once("role/").map(|(_, name)| name.to_string());
    }
    // Bare names only; anything with a path separator is not a role token.
    if value.contains('/') || value.contains(':') {
        return None;
    }
    Some(value.to_string())
}
