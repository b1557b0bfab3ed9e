use crate::observability::trace::{RunStatus, RunTrace};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Process-wide aggregate folded from every finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    #[serde(default)]
    pub total_runs: u64,
    #[serde(default)]
    pub runs_by_status: BTreeMap<RunStatus, u64>,
    #[serde(default)]
    pub runs_by_variant: BTreeMap<String, u64>,
    #[serde(default)]
    pub clarifications: u64,
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default)]
    pub round_trips: u64,
    #[serde(default)]
    pub conversation_input_tokens: u64,
    #[serde(default)]
    pub conversation_output_tokens: u64,
    #[serde(default)]
    pub execution_input_tokens: u64,
    #[serde(default)]
    pub execution_output_tokens: u64,
    #[serde(default)]
    pub total_duration_ms: u64,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl MetricsSnapshot {
    pub fn fold(&mut self, trace: &RunTrace, updated_at: String) {
        self.total_runs += 1;
        if let Some(status) = trace.status {
            *self.runs_by_status.entry(status).or_default() += 1;
        }
        if let Some(variant) = trace.variant() {
            *self
                .runs_by_variant
                .entry(variant.as_str().to_string())
                .or_default() += 1;
        }
        self.clarifications += u64::from(trace.clarifications);
        self.confirmations += u64::from(trace.confirmations);
        self.round_trips += u64::from(trace.round_trips);
        self.conversation_input_tokens += trace.conversation_tokens.input;
        self.conversation_output_tokens += trace.conversation_tokens.output;
        self.execution_input_tokens += trace.execution_tokens.input;
        self.execution_output_tokens += trace.execution_tokens.output;
        self.total_duration_ms += trace.duration_ms().unwrap_or(0).unsigned_abs();
        self.updated_at = Some(updated_at);
    }

    pub fn runs_with_status(&self, status: RunStatus) -> u64 {
        self.runs_by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn average_duration_ms(&self) -> Option<u64> {
        self.total_duration_ms.checked_div(self.total_runs)
    }
}

pub fn metrics_path(state_root: &Path) -> PathBuf {
    state_root.join("metrics").join("summary.json")
}
