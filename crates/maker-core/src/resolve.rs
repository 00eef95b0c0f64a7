//! Placeholder resolution.
//!
//! Runs when `<NAME>` residues survive binding substitution. Three phases,
//! each short-circuiting once nothing is left unresolved: environment and
//! deterministic derivation, one bounded LLM discovery round, then up to
//! three more LLM rounds with exponential backoff. All proposed bindings
//! pass the store's compatibility checks before acceptance.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::bindings::BindingStore;
use crate::context::ExecCtx;
use crate::domain::{MakerError, Result};
use crate::jsonx;
use crate::llm::extract_json_block;
use crate::normalize::{apply_plan_bindings, has_unresolved_placeholders, unresolved_placeholders};

/// Fixed ip-echo endpoint for `<ADMIN_CIDR>` derivation.
const IP_ECHO_URL: &str = "https://checkip.amazonaws.com";

/// Services the discovery subagent may touch, read-only.
const DISCOVERY_SERVICES: &[&str] = &[
    "ec2", "iam", "ssm", "elbv2", "ecr", "autoscaling", "cloudfront", "sts",
];

/// Discovery command budget per LLM round.
const MAX_DISCOVERY_COMMANDS: usize = 4;

/// Binding keys never forwarded to the LLM in safe mode.
const SENSITIVE_KEY_MARKERS: &[&str] = &["TOKEN", "PASSWORD", "SECRET", "API_KEY", "ACCESS_KEY"];

/// Resolve placeholders in `args` in place.
///
/// Returns [`MakerError::PlaceholderUnresolved`] when every phase is
/// exhausted with placeholders remaining; `<USER_DATA>` never counts.
pub async fn resolve_placeholders(
    ctx: &ExecCtx<'_>,
    step_index: usize,
    args: &mut Vec<String>,
    bindings: &mut BindingStore,
    last_output: &str,
) -> Result<()> {
    if !has_unresolved_placeholders(args) {
        return Ok(());
    }

    resolve_from_env(ctx, args, bindings).await?;
    *args = apply_plan_bindings(args, bindings);
    if !has_unresolved_placeholders(args) {
        return Ok(());
    }

    // One bounded discovery round, then three inference retries with backoff.
    for attempt in 0..4u32 {
        if attempt > 0 {
            ctx.sleep(Duration::from_secs(1 << (attempt - 1))).await?;
        }
        match llm_discovery_round(ctx, args, bindings, last_output).await {
            Ok(()) => {}
            Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
            Err(err) => {
                debug!(attempt, err = %err, "llm discovery round failed");
            }
        }
        *args = apply_plan_bindings(args, bindings);
        if !has_unresolved_placeholders(args) {
            return Ok(());
        }
    }

    Err(MakerError::PlaceholderUnresolved {
        step: step_index,
        placeholders: unresolved_placeholders(args)
            .into_iter()
            .filter(|p| p != "<USER_DATA>")
            .collect(),
    })
}

/// Phase 1: environment variables and deterministic derivations.
async fn resolve_from_env(
    ctx: &ExecCtx<'_>,
    args: &[String],
    bindings: &mut BindingStore,
) -> Result<()> {
    for placeholder in unresolved_placeholders(args) {
        let name = placeholder.trim_matches(['<', '>']);
        if name == "USER_DATA" || bindings.has(name) {
            continue;
        }

        if let Ok(value) = std::env::var(name) {
            if !value.trim().is_empty() {
                bindings.set(name, value.trim());
                continue;
            }
        }

        match name {
            "ADMIN_CIDR" => match derive_admin_cidr().await {
                Ok(cidr) => {
                    ctx.log()
                        .note(&format!("derived ADMIN_CIDR {cidr} from public ip"));
                    bindings.set(name, &cidr);
                }
                Err(err) => debug!(err = %err, "admin cidr derivation failed"),
            },
            "EC2_KEYPAIR_NAME" => match derive_keypair_name(ctx).await {
                Ok(Some(key)) => bindings.set(name, &key),
                Ok(None) => {}
                Err(MakerError::Cancelled) => return Err(MakerError::Cancelled),
                Err(err) => debug!(err = %err, "keypair derivation failed"),
            },
            _ => {}
        }
    }
    Ok(())
}

/// Public IP via the ip-echo endpoint, as a host `/32`.
async fn derive_admin_cidr() -> Result<String> {
    let body = reqwest::get(IP_ECHO_URL).await?.text().await?;
    let ip = body.trim();
    if ip.is_empty() || !ip.chars().all(|c| c.is_ascii_hexdigit() || c == '.' || c == ':') {
        return Err(MakerError::Http(format!("unexpected ip-echo body: {body:?}")));
    }
    Ok(format!("{ip}/32"))
}

/// Smallest lexicographic key-pair name in the account.
async fn derive_keypair_name(ctx: &ExecCtx<'_>) -> Result<Option<String>> {
    let json = ctx
        .run_aws_json(&["ec2".to_string(), "describe-key-pairs".to_string()])
        .await?;
    let mut names: Vec<String> = json
        .get("KeyPairs")
        .and_then(Value::as_array)
        .map(|pairs| {
            pairs
                .iter()
                .filter_map(|p| p.get("KeyName").and_then(Value::as_str))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    Ok(names.into_iter().next())
}

#[derive(Debug, Default, Deserialize)]
struct DiscoveryPlan {
    #[serde(default)]
    bindings: BTreeMap<String, String>,
    #[serde(default)]
    commands: Vec<DiscoveryCommand>,
    #[serde(default)]
    rewritten_args: Vec<String>,
    #[serde(default)]
    notes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryCommand {
    args: Vec<String>,
    /// "json" (default) or "text".
    #[serde(default)]
    parse: Option<String>,
    /// Binding name -> extraction path; "." binds the whole text.
    #[serde(default)]
    bind: BTreeMap<String, String>,
}

/// One LLM round: direct bindings, bounded read-only discovery, and an
/// optional argv rewrite that must strictly reduce unresolved placeholders.
async fn llm_discovery_round(
    ctx: &ExecCtx<'_>,
    args: &mut Vec<String>,
    bindings: &mut BindingStore,
    last_output: &str,
) -> Result<()> {
    let Some(llm) = ctx.llm else {
        return Err(MakerError::Llm("no llm client configured".to_string()));
    };

    let unresolved = unresolved_placeholders(args);
    let sanitized = sanitize_bindings(bindings, ctx.opts.safe_llm_bindings);
    let user = format!(
        "Unresolved placeholders: {unresolved:?}\n\
         Command: {}\n\
         Known bindings: {}\n\
         Last output:\n{}\n",
        args.join(" "),
        serde_json::to_string(&sanitized).unwrap_or_default(),
        truncate(last_output, 4000),
    );

    let raw = llm.complete(DISCOVERY_SYSTEM_PROMPT, &user).await?;
    let block = extract_json_block(&raw)
        .ok_or_else(|| MakerError::Llm("discovery response had no json".to_string()))?;
    let plan: DiscoveryPlan = serde_json::from_str(&block)?;

    for note in &plan.notes {
        ctx.log().note(note);
    }
    for (name, value) in &plan.bindings {
        bindings.set_if_absent(name, value);
    }

    for command in plan.commands.iter().take(MAX_DISCOVERY_COMMANDS) {
        if let Err(reason) = discovery_command_allowed(&command.args) {
            ctx.log()
                .note(&format!("skipping llm discovery command: {reason}"));
            continue;
        }
        let out = ctx.run_aws(&command.args, None).await?;
        if !out.success() {
            continue;
        }
        bind_discovery_output(command, &out.output, bindings);
    }

    if !plan.rewritten_args.is_empty() {
        let before = count_unresolved(args);
        let rewritten = apply_plan_bindings(&plan.rewritten_args, bindings);
        let after = count_unresolved(&rewritten);
        if after < before
            && crate::normalize::validate_command(&rewritten, ctx.opts.destroyer).is_ok()
        {
            ctx.log().remediation(&format!(
                "accepted rewritten args from llm discovery: {}",
                rewritten.join(" ")
            ));
            *args = rewritten;
        }
    }

    Ok(())
}

const DISCOVERY_SYSTEM_PROMPT: &str = "You resolve placeholder values for AWS CLI commands. \
Respond with a JSON object: {\"bindings\": {NAME: value}, \"commands\": \
[{\"args\": [service, op, ...], \"parse\": \"json\"|\"text\", \"bind\": {NAME: path}}], \
\"rewritten_args\": [...], \"notes\": [...]}. Discovery commands must be read-only \
(describe-*/list-*/get-*). Propose at most 4 commands. Omit fields you have nothing for.";

/// Read-only allowlist gate for discovery commands.
fn discovery_command_allowed(args: &[String]) -> std::result::Result<(), String> {
    let service = args.first().map(String::as_str).unwrap_or("");
    let op = args.get(1).map(String::as_str).unwrap_or("");
    if !DISCOVERY_SERVICES.contains(&service) {
        return Err(format!("service {service:?} not in discovery allowlist"));
    }
    if !(op.starts_with("describe-") || op.starts_with("list-") || op.starts_with("get-")) {
        return Err(format!("operation {op:?} is not read-only"));
    }
    if args.iter().any(|a| a.contains(';') || a.contains('|') || a.contains("&&")) {
        return Err("shell operator in discovery command".to_string());
    }
    Ok(())
}

fn bind_discovery_output(command: &DiscoveryCommand, output: &str, bindings: &mut BindingStore) {
    let parse_json = command.parse.as_deref().unwrap_or("json") == "json";
    if parse_json {
        let Ok(json) = serde_json::from_str::<Value>(output.trim()) else {
            return;
        };
        for (name, path) in &command.bind {
            if let Some(value) = jsonx::extract_string(&json, path) {
                bindings.set_if_absent(name, &value);
            }
        }
    } else {
        for (name, path) in &command.bind {
            if path.is_empty() || path == "." {
                bindings.set_if_absent(name, output.trim());
            }
        }
    }
}

fn count_unresolved(args: &[String]) -> usize {
    unresolved_placeholders(args)
        .iter()
        .filter(|p| *p != "<USER_DATA>")
        .count()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Bindings view safe to put in an LLM prompt.
///
/// Safe mode drops sensitive-looking keys and `ENV_`-prefixed ones and
/// truncates values to 500 chars; unsafe forwarding keeps everything at
/// 2000 chars.
pub fn sanitize_bindings(bindings: &BindingStore, safe: bool) -> BTreeMap<String, String> {
    let cap = if safe { 500 } else { 2000 };
    bindings
        .snapshot()
        .into_iter()
        .filter(|(key, _)| {
            if !safe {
                return true;
            }
            let upper = key.to_uppercase();
            !upper.starts_with("ENV_")
                && !SENSITIVE_KEY_MARKERS.iter().any(|m| upper.contains(m))
        })
        .map(|(key, value)| (key, truncate(&value, cap).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecOptions, LogSink};
    use crate::fakes::{ScriptedLlm, ScriptedRunner};

    fn opts() -> ExecOptions {
        ExecOptions {
            log: LogSink::capture().0,
            ..Default::default()
        }
    }

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_env_resolution() {
        std::env::set_var("MAKER_TEST_BUCKET_NAME", "my-bucket");
        let opts = opts();
        let runner = ScriptedRunner::new();
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut args = argv(&["s3api", "create-bucket", "--bucket", "<MAKER_TEST_BUCKET_NAME>"]);
        let mut bindings = BindingStore::new();
        resolve_placeholders(&ctx, 0, &mut args, &mut bindings, "")
            .await
            .expect("resolve");
        assert_eq!(args[3], "my-bucket");
        std::env::remove_var("MAKER_TEST_BUCKET_NAME");
    }

    #[tokio::test]
    async fn test_keypair_derivation_picks_smallest() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(
            &["describe-key-pairs"],
            ScriptedRunner::ok(r#"{"KeyPairs":[{"KeyName":"zeta"},{"KeyName":"alpha"}]}"#),
        );
        let ctx = ExecCtx::new(&opts, &runner, None);

        let mut args = argv(&["ec2", "run-instances", "--key-name", "<EC2_KEYPAIR_NAME>"]);
        let mut bindings = BindingStore::new();
        resolve_placeholders(&ctx, 0, &mut args, &mut bindings, "")
            .await
            .expect("resolve");
        assert_eq!(args[3], "alpha");
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_discovery_binds_from_command_output() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        runner.stub(
            &["describe-vpcs"],
            ScriptedRunner::ok(r#"{"Vpcs":[{"VpcId":"vpc-77"}]}"#),
        );
        let llm = ScriptedLlm::with_responses([r#"{
            "commands": [{"args": ["ec2", "describe-vpcs"], "parse": "json",
                          "bind": {"VPC_ID": "Vpcs[0].VpcId"}}]
        }"#]);
        let ctx = ExecCtx::new(&opts, &runner, Some(&llm));

        let mut args = argv(&["ec2", "create-subnet", "--vpc-id", "<VPC_ID>"]);
        let mut bindings = BindingStore::new();
        resolve_placeholders(&ctx, 0, &mut args, &mut bindings, "previous failure")
            .await
            .expect("resolve");
        assert_eq!(args[3], "vpc-77");
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_discovery_rejects_mutating_commands() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        let llm = ScriptedLlm::with_responses([
            r#"{"commands": [{"args": ["ec2", "create-vpc", "--cidr-block", "10.0.0.0/16"],
                              "bind": {"VPC_ID": "Vpc.VpcId"}}]}"#,
            "{}",
            "{}",
            "{}",
        ]);
        let ctx = ExecCtx::new(&opts, &runner, Some(&llm));

        let mut args = argv(&["ec2", "create-subnet", "--vpc-id", "<VPC_ID>"]);
        let mut bindings = BindingStore::new();
        let err = resolve_placeholders(&ctx, 2, &mut args, &mut bindings, "")
            .await
            .expect_err("unresolved");
        assert!(matches!(err, MakerError::PlaceholderUnresolved { step: 2, .. }));
        assert_eq!(runner.count_calls("create-vpc"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewritten_args_must_reduce_placeholders() {
        let opts = opts();
        let runner = ScriptedRunner::new();
        let llm = ScriptedLlm::with_responses([
            // Rewrite that resolves nothing new; must be rejected, and the
            // engine keeps asking until attempts run out.
            r#"{"rewritten_args": ["ec2", "create-subnet", "--vpc-id", "<VPC_ID>", "--cidr-block", "<CIDR>"]}"#,
            r#"{"bindings": {"VPC_ID": "vpc-1"},
                "rewritten_args": ["ec2", "create-subnet", "--vpc-id", "<VPC_ID>"]}"#,
        ]);
        let ctx = ExecCtx::new(&opts, &runner, Some(&llm));

        let mut args = argv(&["ec2", "create-subnet", "--vpc-id", "<VPC_ID>"]);
        let mut bindings = BindingStore::new();
        resolve_placeholders(&ctx, 0, &mut args, &mut bindings, "")
            .await
            .expect("resolve");
        assert_eq!(args, argv(&["ec2", "create-subnet", "--vpc-id", "vpc-1"]));
    }

    #[test]
    fn test_sanitize_bindings_safe_mode() {
        let mut bindings = BindingStore::new();
        bindings.set("VPC_ID", "vpc-1");
        bindings.set("DB_PASSWORD", "hunter2");
        bindings.set("ENV_HOME", "/root");
        bindings.set("GITHUB_TOKEN_VALUE", "gh_abc");

        let safe = sanitize_bindings(&bindings, true);
        assert!(safe.contains_key("VPC_ID"));
        assert!(!safe.contains_key("DB_PASSWORD"));
        assert!(!safe.contains_key("ENV_HOME"));
        assert!(!safe.contains_key("GITHUB_TOKEN_VALUE"));

        let unsafe_view = sanitize_bindings(&bindings, false);
        assert!(unsafe_view.contains_key("DB_PASSWORD"));
    }

    #[test]
    fn test_sanitize_bindings_truncates() {
        let mut bindings = BindingStore::new();
        bindings.set("BIG", &"x".repeat(3000));
        assert_eq!(sanitize_bindings(&bindings, true)["BIG"].len(), 500);
        assert_eq!(sanitize_bindings(&bindings, false)["BIG"].len(), 2000);
    }

    #[test]
    fn test_discovery_allowlist() {
        assert!(discovery_command_allowed(&argv(&["ec2", "describe-vpcs"])).is_ok());
        assert!(discovery_command_allowed(&argv(&["sts", "get-caller-identity"])).is_ok());
        assert!(discovery_command_allowed(&argv(&["s3api", "list-buckets"])).is_err());
        assert!(discovery_command_allowed(&argv(&["ec2", "create-vpc"])).is_err());
    }
}
