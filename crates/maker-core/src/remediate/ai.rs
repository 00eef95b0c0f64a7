//! LLM-proposed prerequisite remediation.
//!
//! The last layer: ask the oracle for a minimal list of prerequisite
//! commands, validate each one under the same rules as planned commands,
//! execute them, then retry the original. The LLM path never recurses into
//! itself.

use std::time::Duration;

use serde_json::Value;

use super::{retry_original, retry_with_backoff, ArmScope, Remediation};
use crate::context::ExecCtx;
use crate::domain::{MakerError, Result};
use crate::llm::extract_json_block;
use crate::normalize::validate_command;

const SYSTEM_PROMPT: &str = "You fix failing AWS CLI commands. Given a failed command and its \
output, respond with a JSON array of the minimal prerequisite commands (as argument arrays \
without the aws binary or --profile/--region flags) that would make the original succeed. \
Respond with [] if no prerequisite helps. No destructive commands unless the failure is \
itself a teardown.";

/// Ask for prerequisites, run them, retry the original.
///
/// `with_backoff` is set when escalation came through the exhausted generic
/// path; the final retry then rides a backoff ladder instead of firing once.
pub async fn remediate(
    ctx: &ExecCtx<'_>,
    scope: &mut ArmScope<'_>,
    with_backoff: bool,
) -> Result<Remediation> {
    let Some(llm) = ctx.llm else {
        return Ok(Remediation::NotHandled);
    };

    let user = format!(
        "Command: {}\nOutput:\n{}\n",
        scope.args.join(" "),
        truncate(&scope.output, 6000),
    );
    let raw = match llm.complete(SYSTEM_PROMPT, &user).await {
        Ok(raw) => raw,
        Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
        Err(err) => {
            ctx.log().note(&format!("llm remediation unavailable: {err}"));
            return Ok(Remediation::NotHandled);
        }
    };
    let Some(block) = extract_json_block(&raw) else {
        return Ok(Remediation::NotHandled);
    };
    let commands = match parse_commands(&block) {
        Some(commands) => commands,
        None => return Ok(Remediation::NotHandled),
    };
    if commands.is_empty() {
        return Ok(Remediation::NotHandled);
    }

    for command in &commands {
        // A proposal that fails validation is fatal for the step: the
        // oracle is asking for something the plan's safety gates forbid.
        validate_command(command, ctx.opts.destroyer).map_err(|err| {
            MakerError::RemediationRejected(format!(
                "llm proposed {:?}: {err}",
                command.join(" ")
            ))
        })?;

        ctx.log().remediation(&format!(
            "running llm prerequisite: {}",
            command.join(" ")
        ));
        let out = ctx.run_aws(command, None).await?;
        if !out.success() {
            scope.set_output(&out.output);
            return Ok(Remediation::HandledWithError(MakerError::Provider {
                op: command.get(1).cloned().unwrap_or_default(),
                output: out.output,
            }));
        }
    }

    if with_backoff {
        retry_with_backoff(ctx, scope, 4, Duration::from_secs(1)).await
    } else {
        retry_original(ctx, scope).await
    }
}

/// Accept `[["iam","create-role",...]]` or `[{"args": [...]}]`.
fn parse_commands(block: &str) -> Option<Vec<Vec<String>>> {
    let value: Value = serde_json::from_str(block).ok()?;
    let list = value.as_array()?;
    let mut commands = Vec::with_capacity(list.len());
    for entry in list {
        let tokens = match entry {
            Value::Array(tokens) => tokens
                .iter()
                .map(|t| t.as_str().map(String::from))
                .collect::<Option<Vec<_>>>()?,
            Value::Object(map) => map
                .get("args")?
                .as_array()?
                .iter()
                .map(|t| t.as_str().map(String::from))
                .collect::<Option<Vec<_>>>()?,
            _ => return None,
        };
        if !tokens.is_empty() {
            commands.push(tokens);
        }
    }
    Some(commands)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
