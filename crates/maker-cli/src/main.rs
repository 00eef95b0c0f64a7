//! maker - AI-assisted executor for cloud-provider CLI plans
//!
//! The `maker` command loads a planner-produced JSON plan and drives it
//! against a live account through the execution and remediation engine.
//!
//! ## Commands
//!
//! - `run`: execute a plan file (enrichment, remediation, bindings)
//! - `validate`: check a plan file without executing anything
//! - `enrich`: expand a plan's prerequisite chains and print the result

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use maker_core::{
    enrich, execute_plan, gcp, normalize_args, validate_command, CliRunner, ExecCtx, ExecOptions,
    HttpLlmClient, LlmClient, LogSink, Plan,
};

#[derive(Parser)]
#[command(name = "maker")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "AI-assisted executor for cloud-provider CLI plans", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan against the live account
    Run {
        /// Path to the plan JSON file
        plan: PathBuf,

        /// AWS CLI profile
        #[arg(long, env = "AWS_PROFILE", default_value = "")]
        profile: String,

        /// AWS region
        #[arg(long, env = "AWS_REGION", default_value = "")]
        region: String,

        /// Permit destructive verbs and destructive remediations
        #[arg(long)]
        destroyer: bool,

        /// LLM provider (openai, groq, ollama, or a base URL)
        #[arg(long, env = "MAKER_AI_PROVIDER", default_value = "")]
        ai_provider: String,

        /// LLM API key
        #[arg(long, env = "MAKER_AI_API_KEY", default_value = "", hide_env_values = true)]
        ai_api_key: String,

        /// LLM model identifier
        #[arg(long, env = "MAKER_AI_PROFILE", default_value = "")]
        ai_profile: String,

        /// GCP project for gcloud steps
        #[arg(long, env = "GCP_PROJECT", default_value = "")]
        gcp_project: String,

        /// Extra engine diagnostics
        #[arg(long)]
        debug: bool,
    },

    /// Validate a plan file without executing anything
    Validate {
        /// Path to the plan JSON file
        plan: PathBuf,

        /// Validate destructive steps as permitted
        #[arg(long)]
        destroyer: bool,
    },

    /// Expand prerequisite chains and print the enriched plan as JSON
    Enrich {
        /// Path to the plan JSON file
        plan: PathBuf,

        /// AWS CLI profile for read-only describes
        #[arg(long, env = "AWS_PROFILE", default_value = "")]
        profile: String,

        /// AWS region
        #[arg(long, env = "AWS_REGION", default_value = "")]
        region: String,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string())),
        )
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_plan(path: &PathBuf) -> Result<Plan> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading plan file {}", path.display()))?;
    let plan: Plan =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    anyhow::ensure!(!plan.steps.is_empty(), "plan has no steps");
    Ok(plan)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    match cli.command {
        Commands::Run {
            plan,
            profile,
            region,
            destroyer,
            ai_provider,
            ai_api_key,
            ai_profile,
            gcp_project,
            debug,
        } => {
            let mut loaded = load_plan(&plan)?;

            let opts = ExecOptions {
                profile,
                region,
                destroyer,
                ai_provider,
                ai_api_key,
                ai_profile,
                debug,
                gcp_project,
                safe_llm_bindings: ExecOptions::detect_safe_llm_bindings(),
                log: LogSink::stdout(),
                ..Default::default()
            };

            // Ctrl-C cancels in-flight subprocesses and sleeps.
            let cancel = opts.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let llm = HttpLlmClient::from_options(&opts)?;
            let llm_ref: Option<&dyn LlmClient> = llm.as_ref().map(|c| c as &dyn LlmClient);
            let runner = CliRunner;
            let ctx = ExecCtx::new(&opts, &runner, llm_ref);

            enrich::enrich_plan(&ctx, &mut loaded)
                .await
                .context("enriching plan")?;
            info!(steps = loaded.steps.len(), "plan enriched");

            let report = execute_plan(&ctx, &mut loaded).await?;
            info!(
                run_id = %report.run_id,
                steps = report.steps_executed,
                duration_ms = report.duration_ms,
                "plan succeeded"
            );
            for note in &report.notes {
                opts.log.note(note);
            }
        }

        Commands::Validate { plan, destroyer } => {
            let loaded = load_plan(&plan)?;
            for (index, step) in loaded.steps.iter().enumerate() {
                let args = normalize_args(&step.args);
                let result = if gcp::is_gcloud_step(&args) {
                    gcp::validate_gcloud_command(&args, destroyer)
                } else {
                    validate_command(&args, destroyer)
                };
                result.with_context(|| format!("step {index}: {}", step.display()))?;
            }
            println!("plan ok: {} steps", loaded.steps.len());
        }

        Commands::Enrich {
            plan,
            profile,
            region,
        } => {
            let mut loaded = load_plan(&plan)?;
            let opts = ExecOptions {
                profile,
                region,
                log: LogSink::stdout(),
                ..Default::default()
            };
            let runner = CliRunner;
            let ctx = ExecCtx::new(&opts, &runner, None);
            enrich::enrich_plan(&ctx, &mut loaded)
                .await
                .context("enriching plan")?;
            println!("{}", serde_json::to_string_pretty(&loaded)?);
        }
    }

    Ok(())
}
