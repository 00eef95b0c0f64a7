//! Plan and step types matching the upstream planner's JSON schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One provider CLI invocation.
///
/// `args` carries the exact tokens passed to the provider CLI minus the
/// global flags (`--profile`, `--region`, `--no-cli-pager`, `--quiet`),
/// which the executor appends. The first token is the provider service,
/// the second the operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanStep {
    /// Ordered argument vector; never contains shell metacharacters.
    pub args: Vec<String>,

    /// Planner rationale for this step (may be empty).
    #[serde(default)]
    pub reason: String,

    /// Bindings to learn from stdout JSON after success,
    /// binding name -> dotted extraction path (e.g. `VPC_ID` -> `Vpc.VpcId`).
    #[serde(default)]
    pub produces: BTreeMap<String, String>,
}

impl PlanStep {
    /// Step from bare args, no reason and nothing produced.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            reason: String::new(),
            produces: BTreeMap::new(),
        }
    }

    /// Provider service token (`args[0]`), empty when absent.
    pub fn service(&self) -> &str {
        self.args.first().map(String::as_str).unwrap_or("")
    }

    /// Operation token (`args[1]`), empty when absent.
    pub fn op(&self) -> &str {
        self.args.get(1).map(String::as_str).unwrap_or("")
    }

    /// The args joined for log lines.
    pub fn display(&self) -> String {
        self.args.join(" ")
    }
}

/// Ordered plan of provider CLI invocations.
///
/// Created by the upstream planner, mutated by the enricher and by runtime
/// expansion, frozen after the final step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    /// Free-text question the plan answers; hints destructive intent
    /// ("delete everything related", ...).
    #[serde(default)]
    pub question: String,

    /// The steps, in execution order.
    pub steps: Vec<PlanStep>,

    /// Diagnostics surfaced upward during execution.
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Plan {
    /// Whether the plan question signals "tear down everything related".
    pub fn wants_full_teardown(&self) -> bool {
        let q = self.question.to_lowercase();
        q.contains("everything related") || q.contains("all related")
    }
}
