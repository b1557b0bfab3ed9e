use crate::bridge::BridgeRequest;
use crate::config::ConfirmationSettings;
use crate::orchestration::intent::{find_marker, Intent, IntentType, RiskLevel, TaskCard};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CONFIRMATION_TOKEN_LEN: usize = 6;

const CONFIRM_WORDS: &[&str] = &["confirm", "yes", "y", "ok", "approve", "确认", "执行", "同意"];
const CANCEL_WORDS: &[&str] = &[
    "cancel", "no", "n", "abort", "deny", "reject", "取消", "算了", "不要",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationReason {
    Policy,
    HighRisk,
    DestructiveMarker,
}

impl ConfirmationReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Policy => "this workspace asks for confirmation before every execution",
            Self::HighRisk => "the task is rated high risk",
            Self::DestructiveMarker => "the request looks destructive",
        }
    }
}

/// The stored payload a confirmation releases. Execution always uses this
/// copy, never anything rebuilt from the confirming message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedRequest {
    pub intent: Intent,
    pub task_card: TaskCard,
    pub bridge_request: BridgeRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub intent: Intent,
    pub task_card: TaskCard,
    pub bridge_request: BridgeRequest,
    pub confirmation_token: String,
    pub created_at_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reminder_at_ms: Option<i64>,
}

impl PendingApproval {
    pub fn new(approved: ApprovedRequest, confirmation_token: String, created_at_ms: i64) -> Self {
        Self {
            intent: approved.intent,
            task_card: approved.task_card,
            bridge_request: approved.bridge_request,
            confirmation_token,
            created_at_ms,
            last_reminder_at_ms: None,
        }
    }

    pub fn into_approved(self) -> ApprovedRequest {
        ApprovedRequest {
            intent: self.intent,
            task_card: self.task_card,
            bridge_request: self.bridge_request,
        }
    }

    pub fn is_expired(&self, now_ms: i64, ttl_ms: i64) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > ttl_ms
    }

    /// Records a reminder at `now_ms` unless one (or the original prompt) went
    /// out less than `debounce_ms` ago.
    fn remind(&mut self, now_ms: i64, debounce_ms: i64) -> bool {
        let last = self.last_reminder_at_ms.unwrap_or(self.created_at_ms);
        if now_ms.saturating_sub(last) < debounce_ms {
            return false;
        }
        self.last_reminder_at_ms = Some(now_ms);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationReply {
    Confirm { token: Option<String> },
    Cancel { token: Option<String> },
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// No approval is pending and the message is a new request.
    Fresh,
    Execute(Box<ApprovedRequest>),
    AwaitingConfirmation {
        token: String,
        reason: ConfirmationReason,
    },
    Cancelled,
    Mismatch {
        token: String,
    },
    Reminder {
        token: String,
    },
    /// An ambiguous reply arrived inside the reminder debounce window.
    Suppressed,
    Expired,
    /// A confirm or cancel reply with nothing waiting for it.
    NothingPending,
}

/// Deterministic token derived from the triggering message timestamp: the
/// first six uppercase hex digits of its SHA-256 digest.
pub fn confirmation_token(ts: &str) -> String {
    let digest = Sha256::digest(ts.as_bytes());
    digest
        .iter()
        .take(CONFIRMATION_TOKEN_LEN / 2)
        .map(|byte| format!("{byte:02X}"))
        .collect()
}

pub fn confirmation_reason(
    intent: &Intent,
    task_card: &TaskCard,
    settings: &ConfirmationSettings,
) -> Option<ConfirmationReason> {
    if intent.intent_type != IntentType::Execute {
        return None;
    }
    if settings.always_confirm {
        return Some(ConfirmationReason::Policy);
    }
    if task_card.risk_level == RiskLevel::High {
        return Some(ConfirmationReason::HighRisk);
    }
    find_marker(&intent.goal, &settings.destructive_markers)
        .map(|_| ConfirmationReason::DestructiveMarker)
}

pub fn requires_confirmation(
    intent: &Intent,
    task_card: &TaskCard,
    settings: &ConfirmationSettings,
) -> bool {
    confirmation_reason(intent, task_card, settings).is_some()
}

/// Parses `confirm [TOKEN]` / `cancel [TOKEN]` style replies. A leading slash
/// is accepted, and CJK keywords may be followed directly by the token.
pub fn parse_reply(text: &str) -> ConfirmationReply {
    let trimmed = text.trim();
    let trimmed = trimmed.strip_prefix('/').unwrap_or(trimmed);
    let mut parts = trimmed.split_whitespace();
    let Some(first) = parts.next() else {
        return ConfirmationReply::Other;
    };
    let second = parts.next();
    if parts.next().is_some() {
        return ConfirmationReply::Other;
    }
    let first = first.to_lowercase();

    if let Some(token) = match_keyword(&first, second, CONFIRM_WORDS) {
        return ConfirmationReply::Confirm { token };
    }
    if let Some(token) = match_keyword(&first, second, CANCEL_WORDS) {
        return ConfirmationReply::Cancel { token };
    }
    ConfirmationReply::Other
}

fn match_keyword(first: &str, second: Option<&str>, words: &[&str]) -> Option<Option<String>> {
    for word in words {
        if first == *word {
            return Some(second.map(str::to_string));
        }
        if !word.is_ascii() && second.is_none() {
            if let Some(rest) = first.strip_prefix(word) {
                if !rest.is_empty() {
                    return Some(Some(rest.to_string()));
                }
            }
        }
    }
    None
}

fn token_matches(given: &str, expected: &str) -> bool {
    given.trim().eq_ignore_ascii_case(expected)
}

/// Per-channel confirmation state machine. The caller owns the
/// `Option<PendingApproval>` slot; the gate only decides transitions.
#[derive(Debug, Clone)]
pub struct ConfirmationGate {
    settings: ConfirmationSettings,
}

impl ConfirmationGate {
    pub fn new(settings: ConfirmationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ConfirmationSettings {
        &self.settings
    }

    /// Passes `approved` straight through, or parks it in `pending` when it
    /// needs confirmation.
    pub fn admit(
        &self,
        pending: &mut Option<PendingApproval>,
        approved: ApprovedRequest,
        now_ms: i64,
    ) -> GateDecision {
        let Some(reason) =
            confirmation_reason(&approved.intent, &approved.task_card, &self.settings)
        else {
            return GateDecision::Execute(Box::new(approved));
        };
        let token = confirmation_token(&approved.bridge_request.ts);
        *pending = Some(PendingApproval::new(approved, token.clone(), now_ms));
        GateDecision::AwaitingConfirmation { token, reason }
    }

    pub fn on_reply(
        &self,
        pending: &mut Option<PendingApproval>,
        text: &str,
        now_ms: i64,
    ) -> GateDecision {
        let reply = parse_reply(text);
        let Some(current) = pending.as_ref() else {
            return match reply {
                ConfirmationReply::Other => GateDecision::Fresh,
                _ => GateDecision::NothingPending,
            };
        };
        if current.is_expired(now_ms, self.settings.ttl_ms) {
            *pending = None;
            return GateDecision::Expired;
        }
        let expected = current.confirmation_token.clone();

        match reply {
            ConfirmationReply::Cancel { token: Some(given) }
                if !token_matches(&given, &expected) =>
            {
                GateDecision::Mismatch { token: expected }
            }
            ConfirmationReply::Cancel { .. } => {
                *pending = None;
                GateDecision::Cancelled
            }
            ConfirmationReply::Confirm { token: Some(given) }
                if token_matches(&given, &expected) =>
            {
                match pending.take() {
                    Some(approval) => GateDecision::Execute(Box::new(approval.into_approved())),
                    None => GateDecision::NothingPending,
                }
            }
            ConfirmationReply::Confirm { .. } => GateDecision::Mismatch { token: expected },
            ConfirmationReply::Other => {
                let debounce_ms = self.settings.reminder_debounce_ms;
                let reminded = pending
                    .as_mut()
                    .is_some_and(|approval| approval.remind(now_ms, debounce_ms));
                if reminded {
                    GateDecision::Reminder { token: expected }
                } else {
                    GateDecision::Suppressed
                }
            }
        }
    }
}
