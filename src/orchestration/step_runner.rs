use crate::bridge::{Bridge, BridgeRequest, BridgeStatus};
use crate::config::RunnerSettings;
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::intent::TaskCard;
use crate::orchestration::plan::{ExecutionPlan, Step, WorkerRole};
use crate::orchestration::prompt_render::{estimate_tokens, render_step_prompt};
use crate::shared::CancelToken;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub worker: WorkerRole,
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub wave: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    pub final_text: String,
    pub step_results: Vec<StepResult>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Step ids per wave, in dispatch order.
    pub waves: Vec<Vec<String>>,
}

/// A failed run together with everything it had already spent.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PlanFailure {
    #[source]
    pub error: OrchestratorError,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub step_results: Vec<StepResult>,
}

/// Steps of one wave sharing a `parallel_group`; an ungrouped step forms a
/// group keyed by its own id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepGroup {
    pub key: String,
    pub step_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum StepEvent<'a> {
    WaveStarted {
        wave: usize,
        groups: &'a [StepGroup],
    },
    StepStarted {
        step: &'a Step,
        wave: usize,
    },
    StepStatus {
        step: &'a Step,
        status: &'a BridgeStatus,
    },
    StepCompleted {
        result: &'a StepResult,
        completed: usize,
        total: usize,
    },
}

pub type StepEventSink<'a> = &'a (dyn Fn(StepEvent<'_>) + Sync);

#[derive(Debug, Default)]
struct TokenLedger {
    input: u64,
    output: u64,
}

impl TokenLedger {
    fn reserve_input(
        &mut self,
        step_id: &str,
        estimate: u64,
        token_budget: u64,
    ) -> Result<(), OrchestratorError> {
        let required = self.input + estimate;
        if required > token_budget {
            return Err(OrchestratorError::BudgetExceeded {
                step_id: step_id.to_string(),
                required,
                token_budget,
            });
        }
        self.input = required;
        Ok(())
    }

    fn settle_output(
        &mut self,
        step_id: &str,
        estimate: u64,
        token_budget: u64,
    ) -> Result<(), OrchestratorError> {
        self.output += estimate;
        let required = self.input + self.output;
        if required > token_budget {
            return Err(OrchestratorError::BudgetExceeded {
                step_id: step_id.to_string(),
                required,
                token_budget,
            });
        }
        Ok(())
    }
}

struct WaveContext<'a> {
    base: &'a BridgeRequest,
    task_card: &'a TaskCard,
    prior: &'a [StepResult],
    ledger: &'a Mutex<TokenLedger>,
    cancel: &'a CancelToken,
    on_step: StepEventSink<'a>,
    completed: &'a AtomicUsize,
    total: usize,
    wave: usize,
}

pub struct StepRunner<'a> {
    bridge: &'a dyn Bridge,
    limits: RunnerSettings,
    step_timeout: Option<Duration>,
}

impl<'a> StepRunner<'a> {
    pub fn new(bridge: &'a dyn Bridge, limits: RunnerSettings) -> Self {
        Self {
            bridge,
            limits,
            step_timeout: None,
        }
    }

    /// Per-call bridge timeout; `None` keeps the bridge default.
    pub fn with_step_timeout(mut self, step_timeout: Option<Duration>) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    /// Runs `plan` wave by wave after validating it. A step is dispatched
    /// only once all of its dependencies have completed; every step that
    /// becomes ready in the same wave runs concurrently.
    pub fn execute_plan(
        &self,
        base: &BridgeRequest,
        plan: &ExecutionPlan,
        task_card: &TaskCard,
        cancel: &CancelToken,
        on_step: StepEventSink<'_>,
    ) -> Result<PlanOutcome, PlanFailure> {
        let plan: Cow<'_, ExecutionPlan> = if plan.steps.is_empty() {
            Cow::Owned(plan.clone().or_single_step(&task_card.objective))
        } else {
            Cow::Borrowed(plan)
        };
        let ledger = Mutex::new(TokenLedger::default());
        if let Err(error) = plan.validate() {
            return Err(failure(error, &ledger, Vec::new()));
        }
        let completed_count = AtomicUsize::new(0);
        let total = plan.steps.len();

        let mut results: Vec<StepResult> = Vec::new();
        let mut waves: Vec<Vec<String>> = Vec::new();
        let mut completed: HashSet<String> = HashSet::new();
        let mut remaining: Vec<&Step> = plan.steps.iter().collect();

        while !remaining.is_empty() {
            if cancel.is_cancelled() {
                let error = OrchestratorError::BridgeAborted {
                    id: plan.run_id.clone(),
                };
                return Err(failure(error, &ledger, results));
            }

            let (ready, blocked): (Vec<&Step>, Vec<&Step>) =
                remaining.into_iter().partition(|step| {
                    step.depends_on
                        .iter()
                        .all(|dep| completed.contains(dep.as_str()))
                });
            if ready.is_empty() {
                let error = OrchestratorError::PlanStuck {
                    remaining: blocked.iter().map(|step| step.id.clone()).collect(),
                };
                return Err(failure(error, &ledger, results));
            }
            remaining = blocked;

            let wave = waves.len();
            let groups = group_ready_steps(&ready);
            on_step(StepEvent::WaveStarted {
                wave,
                groups: &groups,
            });
            waves.push(ready.iter().map(|step| step.id.clone()).collect());

            let wave_cancel = cancel.child();
            let context = WaveContext {
                base,
                task_card,
                prior: &results,
                ledger: &ledger,
                cancel: &wave_cancel,
                on_step,
                completed: &completed_count,
                total,
                wave,
            };
            let outcomes = self.run_wave(&context, &ready);

            let mut first_error: Option<OrchestratorError> = None;
            let mut wave_results = Vec::with_capacity(outcomes.len());
            for outcome in outcomes {
                match outcome {
                    Ok(result) => wave_results.push(result),
                    Err(err) => {
                        // A sibling aborted by this wave's failure must not
                        // hide the failure itself.
                        let replace = first_error
                            .as_ref()
                            .map_or(true, |existing| existing.is_abort() && !err.is_abort());
                        if replace {
                            first_error = Some(err);
                        }
                    }
                }
            }
            for result in &wave_results {
                completed.insert(result.step_id.clone());
            }
            results.extend(wave_results);

            if let Some(error) = first_error {
                return Err(failure(error, &ledger, results));
            }
        }

        let final_text = select_final_text(&plan, &results);
        let ledger = ledger.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok(PlanOutcome {
            final_text,
            step_results: results,
            total_input_tokens: ledger.input,
            total_output_tokens: ledger.output,
            waves,
        })
    }

    fn run_wave(
        &self,
        context: &WaveContext<'_>,
        ready: &[&Step],
    ) -> Vec<Result<StepResult, OrchestratorError>> {
        if let [step] = ready {
            return vec![self.run_step(context, step)];
        }

        thread::scope(|scope| {
            let handles: Vec<_> = ready
                .iter()
                .map(|step| {
                    let step: &Step = step;
                    scope.spawn(move || {
                        let outcome = self.run_step(context, step);
                        if outcome.is_err() {
                            context.cancel.cancel();
                        }
                        outcome
                    })
                })
                .collect();
            handles
                .into_iter()
                .zip(ready)
                .map(|(handle, step)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(OrchestratorError::StepExecution {
                            step_id: step.id.clone(),
                            reason: "step worker thread panicked".to_string(),
                        })
                    })
                })
                .collect()
        })
    }

    fn run_step(
        &self,
        context: &WaveContext<'_>,
        step: &Step,
    ) -> Result<StepResult, OrchestratorError> {
        if context.cancel.is_cancelled() {
            return Err(OrchestratorError::BridgeAborted {
                id: step.id.clone(),
            });
        }

        let token_budget = context.task_card.budget.token_budget;
        let prompt = render_step_prompt(
            context.base,
            context.task_card,
            step,
            context.prior,
            &self.limits,
        );
        let input_tokens = estimate_tokens(&prompt);
        context
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reserve_input(&step.id, input_tokens, token_budget)?;

        (context.on_step)(StepEvent::StepStarted {
            step,
            wave: context.wave,
        });

        let mut request = context.base.clone();
        request.text = prompt;
        request.step_id = Some(step.id.clone());
        let on_step = context.on_step;
        let relay = |status: &BridgeStatus| on_step(StepEvent::StepStatus { step, status });
        let response =
            self.bridge
                .request(request, context.cancel, Some(&relay), self.step_timeout)?;

        let text = response.text.unwrap_or_default();
        let output_tokens = estimate_tokens(&text);
        context
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settle_output(&step.id, output_tokens, token_budget)?;

        let result = StepResult {
            step_id: step.id.clone(),
            worker: step.worker,
            text,
            input_tokens,
            output_tokens,
            wave: context.wave,
        };
        let completed = context.completed.fetch_add(1, Ordering::SeqCst) + 1;
        on_step(StepEvent::StepCompleted {
            result: &result,
            completed,
            total: context.total,
        });
        Ok(result)
    }
}

/// Groups keep first-seen order, and steps keep plan order within a group.
pub fn group_ready_steps(ready: &[&Step]) -> Vec<StepGroup> {
    let mut groups: Vec<StepGroup> = Vec::new();
    for step in ready {
        let key = step.parallel_group.as_deref().unwrap_or(&step.id);
        match groups.iter_mut().find(|group| group.key == key) {
            Some(group) => group.step_ids.push(step.id.clone()),
            None => groups.push(StepGroup {
                key: key.to_string(),
                step_ids: vec![step.id.clone()],
            }),
        }
    }
    groups
}

fn failure(
    error: OrchestratorError,
    ledger: &Mutex<TokenLedger>,
    step_results: Vec<StepResult>,
) -> PlanFailure {
    let ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
    PlanFailure {
        error,
        total_input_tokens: ledger.input,
        total_output_tokens: ledger.output,
        step_results,
    }
}

/// The declared final step wins, then the last synthesizer, then whatever
/// finished last.
fn select_final_text(plan: &ExecutionPlan, results: &[StepResult]) -> String {
    if let Some(final_step_id) = &plan.final_step_id {
        if let Some(result) = results.iter().find(|r| &r.step_id == final_step_id) {
            return result.text.clone();
        }
    }
    results
        .iter()
        .rev()
        .find(|result| result.worker == WorkerRole::Synthesizer)
        .or_else(|| results.last())
        .map(|result| result.text.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeError, BridgeResponse, StatusCallback, StatusPhase};
    use crate::orchestration::intent::{Budget, Intent, RiskLevel};
    use crate::orchestration::plan::build_plan;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct ScriptedBridge {
        dependencies: HashMap<String, Vec<String>>,
        dispatched: Mutex<Vec<String>>,
        finished: Mutex<HashSet<String>>,
        violations: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
        fail_step: Option<String>,
        hang_step: Option<String>,
        reply_len: Option<usize>,
    }

    impl ScriptedBridge {
        fn for_plan(plan: &ExecutionPlan) -> Self {
            Self {
                dependencies: plan
                    .steps
                    .iter()
                    .map(|step| (step.id.clone(), step.depends_on.clone()))
                    .collect(),
                delay: Duration::from_millis(20),
                ..Self::default()
            }
        }

        fn dispatched(&self) -> Vec<String> {
            self.dispatched.lock().expect("lock").clone()
        }
    }

    impl Bridge for ScriptedBridge {
        fn request(
            &self,
            request: BridgeRequest,
            cancel: &CancelToken,
            on_status: Option<StatusCallback<'_>>,
            _timeout: Option<Duration>,
        ) -> Result<BridgeResponse, BridgeError> {
            let step_id = request.step_id.clone().expect("step id on request");
            {
                let finished = self.finished.lock().expect("lock");
                for dep in self.dependencies.get(&step_id).into_iter().flatten() {
                    if !finished.contains(dep) {
                        self.violations
                            .lock()
                            .expect("lock")
                            .push(format!("{step_id} before {dep}"));
                    }
                }
            }
            self.dispatched.lock().expect("lock").push(step_id.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if let Some(callback) = on_status {
                callback(&BridgeStatus {
                    id: step_id.clone(),
                    phase: StatusPhase::Running,
                    text: format!("{step_id} running"),
                    updated_at: "t".to_string(),
                    details: None,
                });
            }

            let outcome = if self.fail_step.as_deref() == Some(step_id.as_str()) {
                Err(BridgeError::WorkerReported {
                    id: step_id.clone(),
                    message: format!("{step_id} exploded"),
                })
            } else if self.hang_step.as_deref() == Some(step_id.as_str()) {
                cancel.sleep(Duration::from_secs(10));
                Err(BridgeError::Aborted {
                    id: step_id.clone(),
                })
            } else if !cancel.sleep(self.delay) {
                Err(BridgeError::Aborted {
                    id: step_id.clone(),
                })
            } else {
                let text = match self.reply_len {
                    Some(len) => "y".repeat(len),
                    None => format!("{step_id} output"),
                };
                Ok(BridgeResponse::success(step_id.clone(), text))
            };

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if outcome.is_ok() {
                self.finished.lock().expect("lock").insert(step_id);
            }
            outcome
        }
    }

    fn base_request() -> BridgeRequest {
        BridgeRequest {
            id: String::new(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            channel_id: "C1".to_string(),
            user_id: "U1".to_string(),
            text: "add request retries to the http client".to_string(),
            attachments: vec![],
            is_event: false,
            ts: "1.0".to_string(),
            intent: None,
            task_card: None,
            execution_plan: None,
            run_id: None,
            model_route: None,
            step_id: None,
        }
    }

    fn card(token_budget: u64) -> TaskCard {
        TaskCard {
            objective: "add request retries".to_string(),
            inputs: vec![],
            done_criteria: vec!["retries are covered by tests".to_string()],
            risk_level: RiskLevel::Medium,
            budget: Budget {
                token_budget,
                timeout_ms: 5_000,
            },
        }
    }

    fn execute_plan_fixture() -> ExecutionPlan {
        build_plan(&Intent::execute("add request retries"), &card(1_000_000))
    }

    fn no_events(_: StepEvent<'_>) {}

    #[test]
    fn execute_plan_runs_in_dependency_waves_and_returns_synthesizer_text() {
        let plan = execute_plan_fixture();
        let bridge = ScriptedBridge::for_plan(&plan);
        let runner = StepRunner::new(&bridge, RunnerSettings::default());

        let outcome = runner
            .execute_plan(
                &base_request(),
                &plan,
                &card(1_000_000),
                &CancelToken::new(),
                &no_events,
            )
            .expect("plan succeeds");

        assert_eq!(
            outcome.waves,
            vec![
                vec!["planner".to_string()],
                vec!["coder".to_string()],
                vec!["reviewer".to_string(), "tester".to_string()],
                vec!["docs".to_string()],
                vec!["synthesizer".to_string()],
            ]
        );
        assert_eq!(outcome.final_text, "synthesizer output");
        assert!(bridge.violations.lock().expect("lock").is_empty());

        let mut dispatched = bridge.dispatched();
        dispatched.sort();
        let mut expected: Vec<String> = plan.steps.iter().map(|s| s.id.clone()).collect();
        expected.sort();
        assert_eq!(dispatched, expected);

        let summed_in: u64 = outcome.step_results.iter().map(|r| r.input_tokens).sum();
        let summed_out: u64 = outcome.step_results.iter().map(|r| r.output_tokens).sum();
        assert_eq!(outcome.total_input_tokens, summed_in);
        assert_eq!(outcome.total_output_tokens, summed_out);
    }

    fn custom_step(id: &str, worker: WorkerRole, depends_on: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            ..Step::new(worker, format!("do {id}"), depends_on)
        }
    }

    #[test]
    fn hand_built_dag_dispatches_each_step_once_after_its_dependencies() {
        // Diamond a -> {b, c} -> d, plus an independent root e, a fan-in f
        // over d, e and a, and a side branch g; listed out of order.
        let plan = ExecutionPlan {
            run_id: "run-dag".to_string(),
            steps: vec![
                custom_step("h", WorkerRole::Synthesizer, &["f", "g"]),
                custom_step("f", WorkerRole::Docs, &["d", "e", "a"]),
                custom_step("d", WorkerRole::Reviewer, &["b", "c"]),
                custom_step("b", WorkerRole::Coder, &["a"]),
                custom_step("g", WorkerRole::Tester, &["c"]),
                custom_step("c", WorkerRole::Coder, &["a"]),
                custom_step("e", WorkerRole::Planner, &[]),
                custom_step("a", WorkerRole::Planner, &[]),
            ],
            final_step_id: None,
        };
        let bridge = ScriptedBridge::for_plan(&plan);
        let runner = StepRunner::new(&bridge, RunnerSettings::default());

        let outcome = runner
            .execute_plan(
                &base_request(),
                &plan,
                &card(1_000_000),
                &CancelToken::new(),
                &no_events,
            )
            .expect("plan succeeds");

        let wave = |ids: &[&str]| ids.iter().map(|id| id.to_string()).collect::<Vec<_>>();
        assert_eq!(
            outcome.waves,
            vec![
                wave(&["e", "a"]),
                wave(&["b", "c"]),
                wave(&["d", "g"]),
                wave(&["f"]),
                wave(&["h"]),
            ]
        );
        assert!(bridge.violations.lock().expect("lock").is_empty());

        let mut dispatched = bridge.dispatched();
        dispatched.sort();
        assert_eq!(dispatched, wave(&["a", "b", "c", "d", "e", "f", "g", "h"]));
        assert_eq!(outcome.final_text, "h output");
    }

    #[test]
    fn verify_group_steps_run_concurrently() {
        let plan = execute_plan_fixture();
        let mut bridge = ScriptedBridge::for_plan(&plan);
        bridge.delay = Duration::from_millis(80);
        let runner = StepRunner::new(&bridge, RunnerSettings::default());

        runner
            .execute_plan(
                &base_request(),
                &plan,
                &card(1_000_000),
                &CancelToken::new(),
                &no_events,
            )
            .expect("plan succeeds");
        assert_eq!(bridge.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn two_cycle_is_reported_as_stuck_without_dispatching() {
        let plan = ExecutionPlan {
            run_id: "run-cycle".to_string(),
            steps: vec![
                Step::new(WorkerRole::Coder, "a", &["tester"]),
                Step::new(WorkerRole::Tester, "b", &["coder"]),
            ],
            final_step_id: None,
        };
        let bridge = ScriptedBridge::for_plan(&plan);
        let runner = StepRunner::new(&bridge, RunnerSettings::default());

        let failure = runner
            .execute_plan(
                &base_request(),
                &plan,
                &card(1_000_000),
                &CancelToken::new(),
                &no_events,
            )
            .expect_err("stuck");
        match failure.error {
            OrchestratorError::PlanStuck { remaining } => {
                assert_eq!(remaining, vec!["coder", "tester"])
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(bridge.dispatched().is_empty());
    }

    #[test]
    fn unknown_dependency_is_rejected_up_front() {
        let plan = ExecutionPlan {
            run_id: "run-bad".to_string(),
            steps: vec![Step::new(WorkerRole::Coder, "a", &["ghost"])],
            final_step_id: None,
        };
        let bridge = ScriptedBridge::for_plan(&plan);
        let runner = StepRunner::new(&bridge, RunnerSettings::default());

        let failure = runner
            .execute_plan(
                &base_request(),
                &plan,
                &card(1_000_000),
                &CancelToken::new(),
                &no_events,
            )
            .expect_err("invalid");
        assert!(matches!(failure.error, OrchestratorError::InvalidPlan { .. }));
        assert!(bridge.dispatched().is_empty());
    }

    #[test]
    fn tiny_budget_fails_before_first_bridge_call() {
        let plan = execute_plan_fixture();
        let bridge = ScriptedBridge::for_plan(&plan);
        let runner = StepRunner::new(&bridge, RunnerSettings::default());

        let failure = runner
            .execute_plan(
                &base_request(),
                &plan,
                &card(1),
                &CancelToken::new(),
                &no_events,
            )
            .expect_err("budget");
        assert!(matches!(
            failure.error,
            OrchestratorError::BudgetExceeded { ref step_id, token_budget: 1, .. } if step_id == "planner"
        ));
        assert!(bridge.dispatched().is_empty());
        assert_eq!(failure.total_input_tokens, 0);
    }

    #[test]
    fn oversized_response_fails_after_the_call_and_keeps_spent_tokens() {
        let plan = execute_plan_fixture();
        let mut bridge = ScriptedBridge::for_plan(&plan);
        bridge.reply_len = Some(40_000);
        let runner = StepRunner::new(&bridge, RunnerSettings::default());

        let failure = runner
            .execute_plan(
                &base_request(),
                &plan,
                &card(5_000),
                &CancelToken::new(),
                &no_events,
            )
            .expect_err("budget");
        assert!(matches!(
            failure.error,
            OrchestratorError::BudgetExceeded { ref step_id, .. } if step_id == "planner"
        ));
        assert_eq!(bridge.dispatched(), vec!["planner"]);
        assert!(failure.total_input_tokens > 0);
        assert_eq!(failure.total_output_tokens, 10_000);
    }

    #[test]
    fn failing_sibling_aborts_the_rest_of_its_wave() {
        let plan = execute_plan_fixture();
        let mut bridge = ScriptedBridge::for_plan(&plan);
        bridge.fail_step = Some("reviewer".to_string());
        bridge.hang_step = Some("tester".to_string());
        let runner = StepRunner::new(&bridge, RunnerSettings::default());

        let started = std::time::Instant::now();
        let failure = runner
            .execute_plan(
                &base_request(),
                &plan,
                &card(1_000_000),
                &CancelToken::new(),
                &no_events,
            )
            .expect_err("worker failure");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            failure.error,
            OrchestratorError::WorkerReportedError { ref message } if message == "reviewer exploded"
        ));
        assert!(!bridge.dispatched().contains(&"docs".to_string()));
        let finished: Vec<&str> = failure
            .step_results
            .iter()
            .map(|r| r.step_id.as_str())
            .collect();
        assert_eq!(finished, vec!["planner", "coder"]);
    }

    #[test]
    fn cancelled_run_stops_issuing_steps() {
        let plan = execute_plan_fixture();
        let bridge = ScriptedBridge::for_plan(&plan);
        let runner = StepRunner::new(&bridge, RunnerSettings::default());
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let on_step = move |event: StepEvent<'_>| {
            if let StepEvent::StepCompleted { result, .. } = event {
                if result.step_id == "coder" {
                    trigger.cancel();
                }
            }
        };

        let failure = runner
            .execute_plan(&base_request(), &plan, &card(1_000_000), &cancel, &on_step)
            .expect_err("aborted");
        assert!(failure.error.is_abort());
        assert_eq!(bridge.dispatched(), vec!["planner", "coder"]);
    }

    #[test]
    fn final_text_falls_back_to_last_completed_step() {
        let plan = ExecutionPlan {
            run_id: "run-x".to_string(),
            steps: vec![
                Step::new(WorkerRole::Planner, "p", &[]),
                Step::new(WorkerRole::Coder, "c", &["planner"]),
            ],
            final_step_id: None,
        };
        let bridge = ScriptedBridge::for_plan(&plan);
        let runner = StepRunner::new(&bridge, RunnerSettings::default());

        let outcome = runner
            .execute_plan(
                &base_request(),
                &plan,
                &card(1_000_000),
                &CancelToken::new(),
                &no_events,
            )
            .expect("plan succeeds");
        assert_eq!(outcome.final_text, "coder output");
    }

    #[test]
    fn empty_plan_runs_a_single_synthesizer_step() {
        let plan = ExecutionPlan {
            run_id: "run-empty".to_string(),
            steps: vec![],
            final_step_id: None,
        };
        let bridge = ScriptedBridge::default();
        let runner = StepRunner::new(&bridge, RunnerSettings::default());

        let outcome = runner
            .execute_plan(
                &base_request(),
                &plan,
                &card(1_000_000),
                &CancelToken::new(),
                &no_events,
            )
            .expect("plan succeeds");
        assert_eq!(outcome.final_text, "synthesizer output");
        assert_eq!(outcome.waves, vec![vec!["synthesizer".to_string()]]);
    }

    #[test]
    fn ready_steps_group_by_parallel_group_or_own_id() {
        let plan = execute_plan_fixture();
        let reviewer = plan.step("reviewer").expect("reviewer");
        let tester = plan.step("tester").expect("tester");
        let solo = Step::new(WorkerRole::Docs, "docs", &[]);

        let groups = group_ready_steps(&[reviewer, &solo, tester]);
        assert_eq!(
            groups,
            vec![
                StepGroup {
                    key: "verify".to_string(),
                    step_ids: vec!["reviewer".to_string(), "tester".to_string()],
                },
                StepGroup {
                    key: "docs".to_string(),
                    step_ids: vec!["docs".to_string()],
                },
            ]
        );
    }

    #[test]
    fn step_events_relay_status_and_completion_counts() {
        let plan = execute_plan_fixture();
        let bridge = ScriptedBridge::for_plan(&plan);
        let runner = StepRunner::new(&bridge, RunnerSettings::default());
        let statuses = Mutex::new(Vec::new());
        let completions = Mutex::new(Vec::new());
        let on_step = |event: StepEvent<'_>| match event {
            StepEvent::StepStatus { step, status } => statuses
                .lock()
                .expect("lock")
                .push(format!("{}:{}", step.id, status.text)),
            StepEvent::StepCompleted {
                completed, total, ..
            } => completions.lock().expect("lock").push((completed, total)),
            _ => {}
        };

        runner
            .execute_plan(
                &base_request(),
                &plan,
                &card(1_000_000),
                &CancelToken::new(),
                &on_step,
            )
            .expect("plan succeeds");

        assert!(statuses
            .lock()
            .expect("lock")
            .contains(&"docs:docs running".to_string()));
        let mut completions = completions.into_inner().expect("lock");
        completions.sort();
        assert_eq!(completions.last(), Some(&(6, 6)));
        assert_eq!(completions.len(), 6);
    }
}
