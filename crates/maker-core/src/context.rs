//! Shared execution context threaded through the engine.

use std::time::Duration;

use serde_json::Value;

use crate::domain::{ExecOptions, LogSink, MakerError, Result};
use crate::llm::LlmClient;
use crate::runner::{CommandRunner, RunOutput};

/// Bundle of options, runner, and LLM oracle handed to every engine layer.
pub struct ExecCtx<'a> {
    pub opts: &'a ExecOptions,
    pub runner: &'a dyn CommandRunner,
    pub llm: Option<&'a dyn LlmClient>,
}

impl<'a> ExecCtx<'a> {
    pub fn new(
        opts: &'a ExecOptions,
        runner: &'a dyn CommandRunner,
        llm: Option<&'a dyn LlmClient>,
    ) -> Self {
        Self { opts, runner, llm }
    }

    pub fn log(&self) -> &LogSink {
        &self.opts.log
    }

    /// Qualify service args into a full `aws` argv with the global flags.
    pub fn aws_argv(&self, args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 6);
        argv.push("aws".to_string());
        argv.extend(args.iter().cloned());
        argv.push("--no-cli-pager".to_string());
        if !self.opts.profile.is_empty() {
            argv.push("--profile".to_string());
            argv.push(self.opts.profile.clone());
        }
        if !self.opts.region.is_empty() {
            argv.push("--region".to_string());
            argv.push(self.opts.region.clone());
        }
        argv
    }

    /// Run an AWS service command (args without the `aws` binary token).
    pub async fn run_aws(&self, args: &[String], stdin: Option<&str>) -> Result<RunOutput> {
        self.runner.run(self.opts, &self.aws_argv(args), stdin).await
    }

    /// Run an internal AWS call and parse its stdout as JSON.
    ///
    /// Used by waiters, enrichers, and arms for read-only describes; a
    /// non-zero exit surfaces as [`MakerError::Provider`].
    pub async fn run_aws_json(&self, args: &[String]) -> Result<Value> {
        let mut with_json = args.to_vec();
        with_json.push("--output".to_string());
        with_json.push("json".to_string());
        let out = self.run_aws(&with_json, None).await?;
        if !out.success() {
            return Err(MakerError::Provider {
                op: args.get(1).cloned().unwrap_or_default(),
                output: out.output,
            });
        }
        let trimmed = out.output.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(trimmed)?)
    }

    /// Cancel-aware sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.opts.cancel.cancelled() => Err(MakerError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Sleep `base * 2^attempt`, capped at two minutes.
    pub async fn backoff_sleep(&self, attempt: u32, base: Duration) -> Result<()> {
        let factor = 1u32 << attempt.min(16);
        let dur = base
            .checked_mul(factor)
            .unwrap_or(Duration::from_secs(120))
            .min(Duration::from_secs(120));
        self.sleep(dur).await
    }
}
