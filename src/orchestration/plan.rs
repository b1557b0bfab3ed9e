use crate::orchestration::error::OrchestratorError;
use crate::orchestration::intent::{Intent, IntentType, TaskCard};
use crate::shared::unique_id;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const VERIFY_GROUP: &str = "verify";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Planner,
    Coder,
    Reviewer,
    Tester,
    Docs,
    Synthesizer,
}

impl WorkerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Coder => "coder",
            Self::Reviewer => "reviewer",
            Self::Tester => "tester",
            Self::Docs => "docs",
            Self::Synthesizer => "synthesizer",
        }
    }

    pub fn instructions(self) -> &'static str {
        match self {
            Self::Planner => "Break the objective into concrete steps and name the files or areas involved. Do not make changes yet.",
            Self::Coder => "Implement the plan. Keep changes minimal and report exactly what you changed.",
            Self::Reviewer => "Review the implementation for correctness, regressions and missed requirements. List concrete issues.",
            Self::Tester => "Run or write the checks that prove the done criteria hold. Report commands and results.",
            Self::Docs => "Update user-facing documentation and changelogs affected by the change.",
            Self::Synthesizer => "Write the final reply for the user: what was done, the outcome, and anything left open.",
        }
    }
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub worker: WorkerRole,
    pub summary: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
}

impl Step {
    pub fn new(worker: WorkerRole, summary: impl Into<String>, depends_on: &[&str]) -> Self {
        Self {
            id: worker.as_str().to_string(),
            worker,
            summary: summary.into(),
            depends_on: depends_on.iter().map(|id| id.to_string()).collect(),
            parallel_group: None,
        }
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.parallel_group = Some(group.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub run_id: String,
    pub steps: Vec<Step>,
    /// Step whose output becomes the run's final text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_step_id: Option<String>,
}

impl ExecutionPlan {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// Rejects duplicate ids and dependencies on steps that do not exist.
    /// Cycles are left to the runner, which reports them as stuck.
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(OrchestratorError::InvalidPlan {
                    reason: format!("duplicate step id `{}`", step.id),
                });
            }
        }
        for step in &self.steps {
            if let Some(missing) = step
                .depends_on
                .iter()
                .find(|dep| !seen.contains(dep.as_str()))
            {
                return Err(OrchestratorError::InvalidPlan {
                    reason: format!("step `{}` depends on unknown step `{missing}`", step.id),
                });
            }
        }
        if let Some(final_step_id) = &self.final_step_id {
            if !seen.contains(final_step_id.as_str()) {
                return Err(OrchestratorError::InvalidPlan {
                    reason: format!("final step `{final_step_id}` is not part of the plan"),
                });
            }
        }
        Ok(())
    }

    /// Substitutes a single synthesizer step when the plan has none at all.
    pub fn or_single_step(mut self, objective: &str) -> Self {
        if self.steps.is_empty() {
            let step = Step::new(WorkerRole::Synthesizer, objective.to_string(), &[]);
            self.final_step_id = Some(step.id.clone());
            self.steps.push(step);
        }
        self
    }
}

pub fn build_plan(intent: &Intent, task_card: &TaskCard) -> ExecutionPlan {
    let objective = task_card.objective.as_str();
    let steps = match intent.intent_type {
        IntentType::Execute => vec![
            Step::new(WorkerRole::Planner, format!("Plan: {objective}"), &[]),
            Step::new(WorkerRole::Coder, format!("Implement: {objective}"), &["planner"]),
            Step::new(WorkerRole::Reviewer, "Review the implementation", &["coder"])
                .in_group(VERIFY_GROUP),
            Step::new(WorkerRole::Tester, "Verify against the done criteria", &["coder"])
                .in_group(VERIFY_GROUP),
            Step::new(
                WorkerRole::Docs,
                "Document the change",
                &["reviewer", "tester"],
            ),
            Step::new(WorkerRole::Synthesizer, "Summarize the outcome", &["docs"]),
        ],
        IntentType::Question | IntentType::Status | IntentType::Chat => vec![
            Step::new(WorkerRole::Planner, format!("Work out how to answer: {objective}"), &[]),
            Step::new(WorkerRole::Synthesizer, "Answer the user", &["planner"]),
        ],
    };

    ExecutionPlan {
        run_id: unique_id("run"),
        steps,
        final_step_id: Some(WorkerRole::Synthesizer.as_str().to_string()),
    }
}
