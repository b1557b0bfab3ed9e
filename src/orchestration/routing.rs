use crate::orchestration::intent::{Intent, IntentType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const COMPLEXITY_MARKERS: &[&str] = &[
    "complex",
    "refactor",
    "architecture",
    "redesign",
    "migrate",
    "复杂",
    "重构",
    "架构",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fast,
    Balanced,
    Quality,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::Quality => "quality",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    A,
    B,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRoute {
    pub conversation_tier: Tier,
    pub execution_tier: Tier,
    pub variant: Variant,
    /// Name of the rule that picked the tiers.
    pub reason: String,
}

pub fn resolve_route(intent: &Intent, seed: &str) -> ModelRoute {
    let (conversation_tier, execution_tier, reason) = match intent.intent_type {
        IntentType::Status | IntentType::Chat => (Tier::Fast, Tier::Fast, "lightweight"),
        IntentType::Question => (Tier::Balanced, Tier::Balanced, "question"),
        IntentType::Execute if is_complex_goal(&intent.goal) => {
            (Tier::Balanced, Tier::Quality, "complex_execution")
        }
        IntentType::Execute => (Tier::Balanced, Tier::Quality, "execution_default"),
    };

    ModelRoute {
        conversation_tier,
        execution_tier,
        variant: variant_for_seed(seed),
        reason: reason.to_string(),
    }
}

pub fn variant_for_seed(seed: &str) -> Variant {
    let digest = Sha256::digest(seed.as_bytes());
    if digest[digest.len() - 1] % 2 == 0 {
        Variant::A
    } else {
        Variant::B
    }
}

fn is_complex_goal(goal: &str) -> bool {
    let lowered = goal.to_lowercase();
    COMPLEXITY_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
