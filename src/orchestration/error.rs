use crate::bridge::BridgeError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("clarification needed: {}", .questions.join("; "))]
    ClarificationNeeded { questions: Vec<String> },
    #[error("confirmation required; reply with token `{token}`")]
    ConfirmationRequired { token: String },
    #[error("confirmation token mismatch")]
    ConfirmationMismatch,
    #[error("confirmation window expired")]
    ConfirmationExpired,
    #[error("bridge request `{id}` timed out after {timeout_ms}ms")]
    BridgeTimeout { id: String, timeout_ms: u64 },
    #[error("bridge request `{id}` was aborted")]
    BridgeAborted { id: String },
    #[error(
        "token budget exceeded at step `{step_id}`: {required} tokens required, budget is {token_budget}"
    )]
    BudgetExceeded {
        step_id: String,
        required: u64,
        token_budget: u64,
    },
    #[error("plan is stuck; no runnable step among: {}", .remaining.join(", "))]
    PlanStuck { remaining: Vec<String> },
    #[error("invalid execution plan: {reason}")]
    InvalidPlan { reason: String },
    #[error("worker reported an error: {message}")]
    WorkerReportedError { message: String },
    #[error("step execution failed for step `{step_id}`: {reason}")]
    StepExecution { step_id: String, reason: String },
    #[error("bridge transport failed: {0}")]
    BridgeTransport(#[source] BridgeError),
}

impl OrchestratorError {
    /// Soft outcomes end the turn without counting as a failure.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::ClarificationNeeded { .. } | Self::ConfirmationRequired { .. }
        )
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::BridgeAborted { .. })
    }

    /// Errors that end the run as failed, with no retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BridgeTimeout { .. }
                | Self::BudgetExceeded { .. }
                | Self::PlanStuck { .. }
                | Self::InvalidPlan { .. }
                | Self::WorkerReportedError { .. }
                | Self::StepExecution { .. }
                | Self::BridgeTransport(_)
        )
    }
}

impl From<BridgeError> for OrchestratorError {
    fn from(value: BridgeError) -> Self {
        match value {
            BridgeError::Timeout { id, timeout_ms } => Self::BridgeTimeout { id, timeout_ms },
            BridgeError::Aborted { id } => Self::BridgeAborted { id },
            BridgeError::WorkerReported { message, .. } => Self::WorkerReportedError { message },
            other => Self::BridgeTransport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_errors_map_onto_run_taxonomy() {
        let err = OrchestratorError::from(BridgeError::Timeout {
            id: "req-1".to_string(),
            timeout_ms: 10,
        });
        assert!(matches!(err, OrchestratorError::BridgeTimeout { .. }));
        assert!(err.is_fatal());

        let err = OrchestratorError::from(BridgeError::Aborted {
            id: "req-1".to_string(),
        });
        assert!(err.is_abort());
        assert!(!err.is_fatal());

        let err = OrchestratorError::from(BridgeError::WorkerReported {
            id: "req-1".to_string(),
            message: "quota".to_string(),
        });
        assert_eq!(err.to_string(), "worker reported an error: quota");
    }

    #[test]
    fn confirmation_outcomes_are_classified() {
        let required = OrchestratorError::ConfirmationRequired {
            token: "A1B2C3".to_string(),
        };
        assert!(required.is_soft());
        assert!(required.to_string().contains("A1B2C3"));
        for err in [
            OrchestratorError::ConfirmationMismatch,
            OrchestratorError::ConfirmationExpired,
        ] {
            assert!(!err.is_soft());
            assert!(!err.is_fatal());
            assert!(!err.is_abort());
        }
    }

    #[test]
    fn soft_outcomes_are_not_fatal() {
        let err = OrchestratorError::ClarificationNeeded {
            questions: vec!["which repo?".to_string(), "which branch?".to_string()],
        };
        assert!(err.is_soft());
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "clarification needed: which repo?; which branch?"
        );
    }
}
