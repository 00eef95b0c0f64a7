//! Scripted runner and LLM fakes for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{ExecOptions, MakerError, Result};
use crate::llm::LlmClient;
use crate::runner::{CommandRunner, RunOutput};

/// One canned subprocess response.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub output: String,
    pub exit_code: i32,
}

struct Rule {
    contains: Vec<String>,
    response: ScriptedCall,
    remaining: Option<u32>,
}

/// Rule-matched fake [`CommandRunner`].
///
/// The first rule whose substrings all appear in the space-joined argv wins;
/// rules registered with [`ScriptedRunner::stub_times`] are consumed.
/// Unmatched calls succeed with an empty JSON object so incidental describes
/// inside arms do not need individual stubs.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful call with the given stdout.
    pub fn ok(output: &str) -> ScriptedCall {
        ScriptedCall {
            output: output.to_string(),
            exit_code: 0,
        }
    }

    /// Failed call (exit 254, the AWS CLI's service-error exit code).
    pub fn fail(output: &str) -> ScriptedCall {
        ScriptedCall {
            output: output.to_string(),
            exit_code: 254,
        }
    }

    /// Respond with `response` whenever all of `contains` appear in the argv.
    pub fn stub(&self, contains: &[&str], response: ScriptedCall) {
        self.push_rule(contains, response, None);
    }

    /// Like [`ScriptedRunner::stub`] but consumed after `times` matches.
    /// Registration order is match order, so a consumable failure followed by
    /// an open-ended success models fail-then-recover sequences.
    pub fn stub_times(&self, contains: &[&str], times: u32, response: ScriptedCall) {
        self.push_rule(contains, response, Some(times));
    }

    fn push_rule(&self, contains: &[&str], response: ScriptedCall, remaining: Option<u32>) {
        self.rules.lock().expect("rules").push(Rule {
            contains: contains.iter().map(|s| s.to_string()).collect(),
            response,
            remaining,
        });
    }

    /// All argvs seen, in call order (including the `aws` binary token).
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("calls").clone()
    }

    /// Space-joined argvs, for substring assertions.
    pub fn call_lines(&self) -> Vec<String> {
        self.calls().iter().map(|argv| argv.join(" ")).collect()
    }

    /// Number of calls whose joined argv contains `needle`.
    pub fn count_calls(&self, needle: &str) -> usize {
        self.call_lines()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        opts: &ExecOptions,
        argv: &[String],
        _stdin: Option<&str>,
    ) -> Result<RunOutput> {
        if opts.cancel.is_cancelled() {
            return Err(MakerError::Cancelled);
        }
        self.calls.lock().expect("calls").push(argv.to_vec());
        let line = argv.join(" ");

        let mut rules = self.rules.lock().expect("rules");
        for rule in rules.iter_mut() {
            if rule.remaining == Some(0) {
                continue;
            }
            if rule.contains.iter().all(|needle| line.contains(needle)) {
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                return Ok(RunOutput {
                    output: rule.response.output.clone(),
                    exit_code: rule.response.exit_code,
                });
            }
        }

        Ok(RunOutput {
            output: "{}".to_string(),
            exit_code: 0,
        })
    }
}

/// Fake [`LlmClient`] replaying queued responses.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let llm = Self::new();
        llm.responses
            .lock()
            .expect("responses")
            .extend(responses.into_iter().map(Into::into));
        llm
    }

    pub fn push(&self, response: &str) {
        self.responses
            .lock()
            .expect("responses")
            .push_back(response.to_string());
    }

    /// User prompts seen so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts").clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _system: &str, user: &str) -> Result<String> {
        self.prompts.lock().expect("prompts").push(user.to_string());
        self.responses
            .lock()
            .expect("responses")
            .pop_front()
            .ok_or_else(|| MakerError::Llm("scripted llm exhausted".to_string()))
    }
}
