use crate::bridge::{Bridge, BridgeRequest};
use crate::channels::{post_chunked, AttachmentStore, ChatTransport};
use crate::config::Settings;
use crate::observability::{RunObservability, RunStatus, TokenScope};
use crate::orchestration::confirmation::{
    ApprovedRequest, ConfirmationGate, ConfirmationReason, GateDecision, PendingApproval,
};
use crate::orchestration::error::OrchestratorError;
use crate::orchestration::intent::{Budget, TaskCard};
use crate::orchestration::lexical_router::{IntentClassifier, LexicalClassifier};
use crate::orchestration::plan::build_plan;
use crate::orchestration::progress::{ProgressMessage, ProgressSnapshot};
use crate::orchestration::prompt_render::estimate_tokens;
use crate::orchestration::routing::resolve_route;
use crate::orchestration::step_runner::{StepEvent, StepRunner};
use crate::shared::logging::append_runtime_log;
use crate::shared::time::{now_millis, now_rfc3339};
use crate::shared::{unique_id, CancelToken};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const STOP_COMMANDS: &[&str] = &["stop", "/stop", "停止"];

const BUSY_TEXT: &str = "A run is already in progress in this channel. Send `stop` to cancel it.";
const CANCELLED_TEXT: &str = "Cancelled. Nothing was executed.";
const EXPIRED_TEXT: &str =
    "The confirmation window expired and the pending request was dropped. Please send it again.";
const NOTHING_PENDING_TEXT: &str =
    "There is no pending task to confirm. Tell me what you want done first.";
const STOPPING_TEXT: &str = "Stopping the current run.";
const NOTHING_RUNNING_TEXT: &str = "Nothing is running in this channel.";
const STOPPED_TEXT: &str = "Stopped. The run was cancelled before it finished.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel_id: String,
    pub user_id: String,
    pub text: String,
    pub ts: String,
    pub attachments: Vec<String>,
    /// Automated triggers queue behind an active run instead of being
    /// rejected.
    pub is_event: bool,
    pub thread_ts: Option<String>,
}

impl InboundMessage {
    pub fn new(
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
        ts: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            text: text.into(),
            ts: ts.into(),
            attachments: Vec::new(),
            is_event: false,
            thread_ts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { run_id: String, final_text: String },
    Failed { run_id: String, reason: String },
    Stopped { run_id: String },
    ClarificationRequested { questions: Vec<String> },
    AwaitingConfirmation { token: String },
    ConfirmationCancelled,
    ConfirmationMismatch { token: String },
    Reminder { token: String },
    /// Ambiguous reply inside the reminder debounce window; nothing is sent.
    Suppressed,
    ConfirmationExpired,
    NothingPending,
    Busy,
    Queued,
    StopRequested { active: bool },
    Ignored,
}

#[derive(Debug, Default)]
struct ChannelState {
    running: bool,
    stop_requested: bool,
    cancel: Option<CancelToken>,
    pending: Option<PendingApproval>,
    queued: VecDeque<InboundMessage>,
}

impl ChannelState {
    fn begin_run(&mut self) -> CancelToken {
        let cancel = CancelToken::new();
        self.running = true;
        self.stop_requested = false;
        self.cancel = Some(cancel.clone());
        cancel
    }

    /// Returns whether a stop was requested during the run.
    fn end_run(&mut self) -> bool {
        let stop_requested = self.stop_requested;
        self.running = false;
        self.stop_requested = false;
        self.cancel = None;
        stop_requested
    }
}

enum Admission {
    Run {
        approved: Box<ApprovedRequest>,
        cancel: CancelToken,
        confirmed: bool,
    },
    Reply {
        outcome: TurnOutcome,
        text: Option<String>,
        record: Option<RunStatus>,
        reason: Option<OrchestratorError>,
    },
}

impl Admission {
    fn reply(outcome: TurnOutcome, text: impl Into<String>, record: Option<RunStatus>) -> Self {
        Self::Reply {
            outcome,
            text: Some(text.into()),
            record,
            reason: None,
        }
    }

    /// Attaches the taxonomy error that ended the turn.
    fn because(self, error: OrchestratorError) -> Self {
        match self {
            Self::Reply {
                outcome,
                text,
                record,
                ..
            } => Self::Reply {
                outcome,
                text,
                record,
                reason: Some(error),
            },
            run => run,
        }
    }

    fn silent(outcome: TurnOutcome) -> Self {
        Self::Reply {
            outcome,
            text: None,
            record: None,
            reason: None,
        }
    }
}

/// Per-channel sequencer. At most one run is active per channel; other
/// channels proceed independently. Gate decisions are taken under the
/// channel lock, runs execute outside it.
pub struct RunCoordinator {
    settings: Settings,
    bridge: Arc<dyn Bridge>,
    transport: Arc<dyn ChatTransport>,
    classifier: Box<dyn IntentClassifier>,
    attachments: Option<Arc<dyn AttachmentStore>>,
    gate: ConfirmationGate,
    observability: RunObservability,
    channels: Mutex<HashMap<String, ChannelState>>,
}

impl RunCoordinator {
    pub fn new(
        settings: Settings,
        bridge: Arc<dyn Bridge>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            gate: ConfirmationGate::new(settings.confirmation.clone()),
            observability: RunObservability::new(settings.state_root.clone()),
            settings,
            bridge,
            transport,
            classifier: Box::new(LexicalClassifier::default()),
            attachments: None,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: Box<dyn IntentClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_attachment_store(mut self, store: Arc<dyn AttachmentStore>) -> Self {
        self.attachments = Some(store);
        self
    }

    pub fn observability(&self) -> &RunObservability {
        &self.observability
    }

    pub fn is_running(&self, channel_id: &str) -> bool {
        self.lock_channels()
            .get(channel_id)
            .is_some_and(|state| state.running)
    }

    pub fn pending_token(&self, channel_id: &str) -> Option<String> {
        self.lock_channels()
            .get(channel_id)
            .and_then(|state| state.pending.as_ref())
            .map(|pending| pending.confirmation_token.clone())
    }

    /// Requests a stop of the channel's active run. Returns `false` when
    /// nothing is running.
    pub fn stop(&self, channel_id: &str) -> bool {
        let mut channels = self.lock_channels();
        let Some(state) = channels.get_mut(channel_id).filter(|state| state.running) else {
            return false;
        };
        state.stop_requested = true;
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
        true
    }

    pub fn handle_message(&self, message: InboundMessage) -> TurnOutcome {
        self.handle_message_at(message, now_millis())
    }

    /// Handles one message, then any events queued behind a run it started.
    pub fn handle_message_at(&self, message: InboundMessage, now_ms: i64) -> TurnOutcome {
        let (outcome, ran) = self.dispatch(&message, now_ms);
        if ran {
            self.drain_queued(&message.channel_id);
        }
        outcome
    }

    /// Returns the turn outcome and whether a run executed.
    fn dispatch(&self, message: &InboundMessage, now_ms: i64) -> (TurnOutcome, bool) {
        let text = message.text.trim();
        if text.is_empty() && message.attachments.is_empty() {
            return (TurnOutcome::Ignored, false);
        }
        if STOP_COMMANDS.contains(&text.to_lowercase().as_str()) {
            let active = self.stop(&message.channel_id);
            let reply = if active {
                STOPPING_TEXT
            } else {
                NOTHING_RUNNING_TEXT
            };
            self.reply(message, reply);
            return (TurnOutcome::StopRequested { active }, false);
        }

        let attachments = self.resolve_attachments(message);
        match self.admit(message, attachments, now_ms) {
            Admission::Reply {
                outcome,
                text,
                record,
                reason,
            } => {
                if let Some(text) = &text {
                    self.reply(message, text);
                }
                if let Some(reason) = &reason {
                    append_runtime_log(
                        &self.settings.state_root,
                        if reason.is_soft() { "info" } else { "warn" },
                        "coordinator.turn_ended",
                        &format!(
                            "channel={} kind={} {reason}",
                            message.channel_id,
                            error_kind(reason)
                        ),
                    );
                }
                if let Some(status) = record {
                    let reply = text.as_deref().unwrap_or_default();
                    self.record_turn(message, status, reply, reason.as_ref());
                }
                (outcome, false)
            }
            Admission::Run {
                approved,
                cancel,
                confirmed,
            } => (self.execute(message, *approved, &cancel, confirmed), true),
        }
    }

    fn admit(&self, message: &InboundMessage, attachments: Vec<String>, now_ms: i64) -> Admission {
        let mut channels = self.lock_channels();
        let state = channels.entry(message.channel_id.clone()).or_default();
        if state.running {
            if message.is_event {
                state.queued.push_back(message.clone());
                return Admission::silent(TurnOutcome::Queued);
            }
            return Admission::reply(TurnOutcome::Busy, BUSY_TEXT, None);
        }

        match self.gate.on_reply(&mut state.pending, &message.text, now_ms) {
            GateDecision::Fresh => {}
            GateDecision::Execute(approved) => {
                return Admission::Run {
                    approved,
                    cancel: state.begin_run(),
                    confirmed: true,
                }
            }
            GateDecision::AwaitingConfirmation { token, reason } => {
                let text = self.confirmation_prompt(&token, reason);
                return Admission::reply(
                    TurnOutcome::AwaitingConfirmation {
                        token: token.clone(),
                    },
                    text,
                    None,
                )
                .because(OrchestratorError::ConfirmationRequired { token });
            }
            GateDecision::Cancelled => {
                return Admission::reply(
                    TurnOutcome::ConfirmationCancelled,
                    CANCELLED_TEXT,
                    Some(RunStatus::Rejected),
                )
            }
            GateDecision::Mismatch { token } => {
                let text = format!(
                    "That token does not match. Reply `confirm {token}` to proceed or `cancel` to drop the pending request."
                );
                return Admission::reply(TurnOutcome::ConfirmationMismatch { token }, text, None)
                    .because(OrchestratorError::ConfirmationMismatch);
            }
            GateDecision::Reminder { token } => {
                let text = format!(
                    "A request is still waiting for confirmation. Reply `confirm {token}` or `cancel`."
                );
                return Admission::reply(TurnOutcome::Reminder { token }, text, None);
            }
            GateDecision::Suppressed => return Admission::silent(TurnOutcome::Suppressed),
            GateDecision::Expired => {
                return Admission::reply(
                    TurnOutcome::ConfirmationExpired,
                    EXPIRED_TEXT,
                    Some(RunStatus::Rejected),
                )
                .because(OrchestratorError::ConfirmationExpired)
            }
            GateDecision::NothingPending => {
                return Admission::reply(TurnOutcome::NothingPending, NOTHING_PENDING_TEXT, None)
            }
        }

        let intent = self.classifier.classify(&message.text);
        if intent.needs_clarification() {
            let mut text = String::from("I need a bit more detail before starting:");
            for question in &intent.clarifications_needed {
                text.push_str("\n- ");
                text.push_str(question);
            }
            let questions = intent.clarifications_needed.clone();
            return Admission::reply(
                TurnOutcome::ClarificationRequested {
                    questions: questions.clone(),
                },
                text,
                Some(RunStatus::ClarificationNeeded),
            )
            .because(OrchestratorError::ClarificationNeeded { questions });
        }

        let budget = Budget {
            token_budget: self.settings.budget.token_budget,
            timeout_ms: self.settings.budget.timeout_ms,
        };
        let task_card = TaskCard::from_intent(
            &intent,
            &attachments,
            budget,
            &self.settings.confirmation.destructive_markers,
        );
        let approved = ApprovedRequest {
            bridge_request: base_request(message, attachments),
            intent,
            task_card,
        };

        match self.gate.admit(&mut state.pending, approved, now_ms) {
            GateDecision::Execute(approved) => Admission::Run {
                approved,
                cancel: state.begin_run(),
                confirmed: false,
            },
            GateDecision::AwaitingConfirmation { token, reason } => {
                let text = self.confirmation_prompt(&token, reason);
                Admission::reply(
                    TurnOutcome::AwaitingConfirmation {
                        token: token.clone(),
                    },
                    text,
                    Some(RunStatus::AwaitingConfirmation),
                )
                .because(OrchestratorError::ConfirmationRequired { token })
            }
            other => {
                append_runtime_log(
                    &self.settings.state_root,
                    "warn",
                    "coordinator.unexpected_admission",
                    &format!("{other:?}"),
                );
                Admission::silent(TurnOutcome::Ignored)
            }
        }
    }

    fn execute(
        &self,
        message: &InboundMessage,
        approved: ApprovedRequest,
        cancel: &CancelToken,
        confirmed: bool,
    ) -> TurnOutcome {
        let ApprovedRequest {
            intent,
            task_card,
            bridge_request,
        } = approved;
        let state_root = self.settings.state_root.as_path();
        let plan = build_plan(&intent, &task_card);
        let run_id = plan.run_id.clone();
        let route = resolve_route(&intent, &run_id);

        let obs = &self.observability;
        obs.start_run(&run_id, &message.channel_id, &message.user_id);
        obs.record_route(&run_id, &route);
        if confirmed {
            obs.mark_confirmation(&run_id);
        }
        obs.event(
            &run_id,
            "plan",
            &format!("{} intent, {} steps", intent.intent_type, plan.steps.len()),
            serde_json::to_value(&plan).ok(),
        );
        append_runtime_log(
            state_root,
            "info",
            "coordinator.run_started",
            &format!("run={run_id} channel={}", message.channel_id),
        );

        let mut base = bridge_request;
        base.intent = Some(intent.clone());
        base.task_card = Some(task_card.clone());
        base.execution_plan = Some(plan.clone());
        base.run_id = Some(run_id.clone());
        base.model_route = Some(route);

        let progress = ProgressMessage::post(
            self.transport.as_ref(),
            state_root,
            &message.channel_id,
            message.thread_ts.as_deref(),
            ProgressSnapshot::new(&run_id, &task_card.objective, plan.steps.len()),
        );
        let on_step = |event: StepEvent<'_>| match event {
            StepEvent::WaveStarted { wave, groups } => {
                let groups: Vec<&Vec<String>> = groups.iter().map(|g| &g.step_ids).collect();
                obs.event(
                    &run_id,
                    "wave_started",
                    &format!("wave {}", wave + 1),
                    Some(json!({ "groups": groups })),
                );
                progress.update(|snapshot| snapshot.wave = wave);
            }
            StepEvent::StepStarted { step, wave } => {
                obs.event(&run_id, "step_started", &step.id, Some(json!({ "wave": wave })));
                progress.update(|snapshot| {
                    snapshot.current_step_id = Some(step.id.clone());
                    snapshot.last_status = None;
                });
            }
            StepEvent::StepStatus { step, status } => {
                obs.event(
                    &run_id,
                    "step_status",
                    &format!("{}: {}", step.id, status.phase),
                    Some(json!({ "text": status.text })),
                );
                progress.update(|snapshot| {
                    snapshot.current_step_id = Some(step.id.clone());
                    snapshot.last_status = Some(status.text.clone());
                });
            }
            StepEvent::StepCompleted {
                result,
                completed,
                total,
            } => {
                obs.record_round_trip(&run_id);
                obs.event(
                    &run_id,
                    "step_completed",
                    &result.step_id,
                    Some(json!({
                        "inputTokens": result.input_tokens,
                        "outputTokens": result.output_tokens,
                        "completed": completed,
                        "total": total,
                    })),
                );
                progress.update(|snapshot| snapshot.completed_steps = completed);
            }
        };

        let step_timeout =
            (task_card.budget.timeout_ms > 0).then(|| Duration::from_millis(task_card.budget.timeout_ms));
        let runner =
            StepRunner::new(self.bridge.as_ref(), self.settings.runner).with_step_timeout(step_timeout);
        let result = runner.execute_plan(&base, &plan, &task_card, cancel, &on_step);

        let stop_requested = self
            .lock_channels()
            .get_mut(&message.channel_id)
            .is_some_and(ChannelState::end_run);

        let (input_tokens, output_tokens) = match &result {
            Ok(outcome) => (outcome.total_input_tokens, outcome.total_output_tokens),
            Err(failure) => (failure.total_input_tokens, failure.total_output_tokens),
        };
        obs.record_token_usage(&run_id, TokenScope::Execution, input_tokens, output_tokens);

        let (outcome, reply, status) = match result {
            Ok(outcome) => {
                let reply = if outcome.final_text.trim().is_empty() {
                    "Done.".to_string()
                } else {
                    outcome.final_text.clone()
                };
                (
                    TurnOutcome::Completed {
                        run_id: run_id.clone(),
                        final_text: outcome.final_text,
                    },
                    reply,
                    RunStatus::Succeeded,
                )
            }
            Err(failure) if failure.error.is_abort() && stop_requested => (
                TurnOutcome::Stopped {
                    run_id: run_id.clone(),
                },
                STOPPED_TEXT.to_string(),
                RunStatus::Cancelled,
            ),
            Err(failure) => {
                let reason = failure.error.to_string();
                let kind = error_kind(&failure.error);
                obs.event(&run_id, "error", &reason, Some(json!({ "kind": kind })));
                append_runtime_log(
                    state_root,
                    if failure.error.is_fatal() { "error" } else { "warn" },
                    "coordinator.run_failed",
                    &format!("run={run_id} kind={kind} {reason}"),
                );
                (
                    TurnOutcome::Failed {
                        run_id: run_id.clone(),
                        reason: reason.clone(),
                    },
                    format!("Run failed: {reason}"),
                    RunStatus::Failed,
                )
            }
        };

        obs.record_token_usage(
            &run_id,
            TokenScope::Conversation,
            estimate_tokens(&message.text),
            estimate_tokens(&reply),
        );
        self.reply(message, &reply);
        progress.clear();
        obs.finish(&run_id, status);
        append_runtime_log(
            state_root,
            "info",
            "coordinator.run_finished",
            &format!("run={run_id} status={status}"),
        );
        outcome
    }

    fn drain_queued(&self, channel_id: &str) {
        loop {
            let next = {
                let mut channels = self.lock_channels();
                match channels.get_mut(channel_id) {
                    Some(state) if !state.running => state.queued.pop_front(),
                    _ => None,
                }
            };
            let Some(message) = next else {
                return;
            };
            self.dispatch(&message, now_millis());
        }
    }

    /// Traces a turn that ended without a run so counters still reach the
    /// metrics snapshot.
    fn record_turn(
        &self,
        message: &InboundMessage,
        status: RunStatus,
        reply: &str,
        reason: Option<&OrchestratorError>,
    ) {
        let obs = &self.observability;
        let run_id = unique_id("turn");
        obs.start_run(&run_id, &message.channel_id, &message.user_id);
        match status {
            RunStatus::ClarificationNeeded => obs.mark_clarification(&run_id),
            RunStatus::AwaitingConfirmation => obs.mark_confirmation(&run_id),
            _ => {}
        }
        if let Some(reason) = reason {
            obs.event(
                &run_id,
                "turn_ended",
                &reason.to_string(),
                Some(json!({ "kind": error_kind(reason), "soft": reason.is_soft() })),
            );
        }
        obs.record_token_usage(
            &run_id,
            TokenScope::Conversation,
            estimate_tokens(&message.text),
            estimate_tokens(reply),
        );
        obs.finish(&run_id, status);
    }

    fn reply(&self, message: &InboundMessage, text: &str) {
        if let Err(err) = post_chunked(
            self.transport.as_ref(),
            &message.channel_id,
            message.thread_ts.as_deref(),
            text,
        ) {
            append_runtime_log(
                &self.settings.state_root,
                "warn",
                "coordinator.reply_failed",
                &format!("channel={} error={err}", message.channel_id),
            );
        }
    }

    fn resolve_attachments(&self, message: &InboundMessage) -> Vec<String> {
        let Some(store) = &self.attachments else {
            return message.attachments.clone();
        };
        message
            .attachments
            .iter()
            .filter_map(|id| match store.resolve(id) {
                Ok(path) => Some(path.display().to_string()),
                Err(err) => {
                    append_runtime_log(
                        &self.settings.state_root,
                        "warn",
                        "coordinator.attachment_unresolved",
                        &err.to_string(),
                    );
                    None
                }
            })
            .collect()
    }

    fn confirmation_prompt(&self, token: &str, reason: ConfirmationReason) -> String {
        let minutes = (self.settings.confirmation.ttl_ms / 60_000).max(1);
        format!(
            "This request needs confirmation because {}.\nReply `confirm {token}` to proceed or `cancel` to drop it. The request expires in {minutes} minutes.",
            reason.describe()
        )
    }

    fn lock_channels(&self) -> MutexGuard<'_, HashMap<String, ChannelState>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn base_request(message: &InboundMessage, attachments: Vec<String>) -> BridgeRequest {
    BridgeRequest {
        id: String::new(),
        created_at: now_rfc3339(),
        channel_id: message.channel_id.clone(),
        user_id: message.user_id.clone(),
        text: message.text.clone(),
        attachments,
        is_event: message.is_event,
        ts: message.ts.clone(),
        intent: None,
        task_card: None,
        execution_plan: None,
        run_id: None,
        model_route: None,
        step_id: None,
    }
}

fn error_kind(error: &OrchestratorError) -> &'static str {
    match error {
        OrchestratorError::ClarificationNeeded { .. } => "clarification_needed",
        OrchestratorError::ConfirmationRequired { .. } => "confirmation_required",
        OrchestratorError::ConfirmationMismatch => "confirmation_mismatch",
        OrchestratorError::ConfirmationExpired => "confirmation_expired",
        OrchestratorError::BridgeTimeout { .. } => "bridge_timeout",
        OrchestratorError::BridgeAborted { .. } => "bridge_aborted",
        OrchestratorError::BudgetExceeded { .. } => "budget_exceeded",
        OrchestratorError::PlanStuck { .. } => "plan_stuck",
        OrchestratorError::InvalidPlan { .. } => "invalid_plan",
        OrchestratorError::WorkerReportedError { .. } => "worker_reported_error",
        OrchestratorError::StepExecution { .. } => "step_execution",
        OrchestratorError::BridgeTransport(_) => "bridge_transport",
    }
}
