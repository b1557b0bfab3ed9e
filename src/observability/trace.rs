use crate::orchestration::routing::{ModelRoute, Variant};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
    ClarificationNeeded,
    AwaitingConfirmation,
    Rejected,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::ClarificationNeeded => "clarification_needed",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    Conversation,
    Execution,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn add(&mut self, input: u64, output: u64) {
        self.input += input;
        self.output += output;
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    pub at: String,
    pub at_ms: i64,
    pub phase: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTrace {
    pub run_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub started_at: String,
    pub started_at_ms: i64,
    #[serde(default)]
    pub ended_at: Option<String>,
    #[serde(default)]
    pub ended_at_ms: Option<i64>,
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub route: Option<ModelRoute>,
    #[serde(default)]
    pub clarifications: u32,
    #[serde(default)]
    pub confirmations: u32,
    #[serde(default)]
    pub round_trips: u32,
    #[serde(default)]
    pub conversation_tokens: TokenUsage,
    #[serde(default)]
    pub execution_tokens: TokenUsage,
    #[serde(default)]
    pub events: Vec<TraceEvent>,
}

impl RunTrace {
    pub fn new(
        run_id: impl Into<String>,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        started_at: String,
        started_at_ms: i64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            started_at,
            started_at_ms,
            ended_at: None,
            ended_at_ms: None,
            status: None,
            route: None,
            clarifications: 0,
            confirmations: 0,
            round_trips: 0,
            conversation_tokens: TokenUsage::default(),
            execution_tokens: TokenUsage::default(),
            events: Vec::new(),
        }
    }

    pub fn variant(&self) -> Option<Variant> {
        self.route.as_ref().map(|route| route.variant)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at_ms
            .map(|ended| ended.saturating_sub(self.started_at_ms).max(0))
    }

    pub fn tokens_mut(&mut self, scope: TokenScope) -> &mut TokenUsage {
        match scope {
            TokenScope::Conversation => &mut self.conversation_tokens,
            TokenScope::Execution => &mut self.execution_tokens,
        }
    }
}

pub fn runs_dir(state_root: &Path) -> PathBuf {
    state_root.join("runs")
}

pub fn trace_path(state_root: &Path, run_id: &str) -> PathBuf {
    runs_dir(state_root).join(format!("{run_id}.json"))
}
