use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Execute,
    Question,
    Status,
    Chat,
}

impl IntentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Question => "question",
            Self::Status => "status",
            Self::Chat => "chat",
        }
    }
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub intent_type: IntentType,
    pub goal: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub clarifications_needed: Vec<String>,
}

impl Intent {
    pub fn new(intent_type: IntentType, goal: impl Into<String>) -> Self {
        Self {
            intent_type,
            goal: goal.into(),
            constraints: Vec::new(),
            clarifications_needed: Vec::new(),
        }
    }

    pub fn execute(goal: impl Into<String>) -> Self {
        Self::new(IntentType::Execute, goal)
    }

    pub fn needs_clarification(&self) -> bool {
        !self.clarifications_needed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub token_budget: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCard {
    pub objective: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub done_criteria: Vec<String>,
    pub risk_level: RiskLevel,
    pub budget: Budget,
}

impl TaskCard {
    /// Derives the task card for one intent. Risk is `high` when the goal
    /// names a destructive action, `medium` for any other execution and
    /// `low` for everything conversational.
    pub fn from_intent(
        intent: &Intent,
        attachments: &[String],
        budget: Budget,
        destructive_markers: &[String],
    ) -> Self {
        let risk_level = match intent.intent_type {
            IntentType::Execute if find_marker(&intent.goal, destructive_markers).is_some() => {
                RiskLevel::High
            }
            IntentType::Execute => RiskLevel::Medium,
            IntentType::Question | IntentType::Status | IntentType::Chat => RiskLevel::Low,
        };

        let mut done_criteria = match intent.intent_type {
            IntentType::Execute => vec![
                "requested change is implemented".to_string(),
                "change is reviewed and tested".to_string(),
                "summary of what changed is reported back".to_string(),
            ],
            IntentType::Question => vec!["question is answered directly".to_string()],
            IntentType::Status => vec!["current status is reported".to_string()],
            IntentType::Chat => vec!["reply is relevant and brief".to_string()],
        };
        done_criteria.extend(
            intent
                .constraints
                .iter()
                .map(|constraint| format!("respects constraint: {constraint}")),
        );

        Self {
            objective: intent.goal.trim().to_string(),
            inputs: attachments.to_vec(),
            done_criteria,
            risk_level,
            budget,
        }
    }
}

/// Returns the first marker that occurs in `text`, compared case-insensitively.
pub fn find_marker<'a>(text: &str, markers: &'a [String]) -> Option<&'a str> {
    let haystack = text.to_lowercase();
    markers
        .iter()
        .map(|marker| marker.trim())
        .filter(|marker| !marker.is_empty())
        .find(|marker| haystack.contains(&marker.to_lowercase()))
}
