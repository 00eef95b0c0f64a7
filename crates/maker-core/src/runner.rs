//! Provider CLI subprocess execution.
//!
//! Spawns the provider binary with an already-qualified argv, streams merged
//! stdout/stderr to the plan log while capturing it verbatim for
//! classification, and honors cancellation. No retries at this layer.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::domain::{ExecOptions, MakerError, Result};

/// Captured result of one subprocess invocation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Merged stdout+stderr in arrival order, captured verbatim.
    pub output: String,

    /// Process exit code (-1 when terminated by signal).
    pub exit_code: i32,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Seam for spawning provider CLI subprocesses.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` (first element is the binary), optionally feeding stdin.
    ///
    /// The captured output is returned for zero and non-zero exits alike;
    /// `Err` is reserved for spawn failures and cancellation.
    async fn run(
        &self,
        opts: &ExecOptions,
        argv: &[String],
        stdin: Option<&str>,
    ) -> Result<RunOutput>;
}

/// Real subprocess runner for the `aws` / `gcloud` binaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct CliRunner;

#[async_trait]
impl CommandRunner for CliRunner {
    async fn run(
        &self,
        opts: &ExecOptions,
        argv: &[String],
        stdin: Option<&str>,
    ) -> Result<RunOutput> {
        let (bin, rest) = argv.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv")
        })?;
        debug!(bin = %bin, args = ?rest, "spawning provider cli");

        let mut child = Command::new(bin)
            .args(rest)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
                pipe.shutdown().await?;
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("child stderr not piped"))?;

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut captured = String::new();
        let mut out_done = false;
        let mut err_done = false;

        while !(out_done && err_done) {
            tokio::select! {
                _ = opts.cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(MakerError::Cancelled);
                }
                line = out_lines.next_line(), if !out_done => match line? {
                    Some(line) => tee_line(opts, &mut captured, &line),
                    None => out_done = true,
                },
                line = err_lines.next_line(), if !err_done => match line? {
                    Some(line) => tee_line(opts, &mut captured, &line),
                    None => err_done = true,
                },
            }
        }

        let status = tokio::select! {
            _ = opts.cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(MakerError::Cancelled);
            }
            status = child.wait() => status?,
        };

        Ok(RunOutput {
            output: captured,
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

fn tee_line(opts: &ExecOptions, captured: &mut String, line: &str) {
    opts.log.line(line);
    captured.push_str(line);
    captured.push('\n');
}
