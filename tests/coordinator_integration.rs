use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use taskrelay::bridge::{BridgeClient, BridgeRequest, BridgeResponse, WorkerEndpoint};
use taskrelay::channels::{LocalTransport, TransportEvent};
use taskrelay::config::Settings;
use taskrelay::observability::RunStatus;
use taskrelay::orchestration::confirmation::confirmation_token;
use taskrelay::orchestration::coordinator::{InboundMessage, RunCoordinator, TurnOutcome};
use tempfile::{tempdir, TempDir};

type Reply = dyn Fn(&BridgeRequest) -> BridgeResponse + Send + Sync;

struct FakeWorker {
    stop: Arc<AtomicBool>,
    seen: Arc<Mutex<Vec<BridgeRequest>>>,
    handle: Option<JoinHandle<()>>,
}

impl FakeWorker {
    fn spawn(queue_root: &Path, delay: Duration, reply: Box<Reply>) -> Self {
        let endpoint = WorkerEndpoint::open(queue_root).expect("worker endpoint");
        let stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (flag, log) = (Arc::clone(&stop), Arc::clone(&seen));
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                let Ok(Some(request)) = endpoint.claim_oldest_request() else {
                    thread::sleep(Duration::from_millis(3));
                    continue;
                };
                thread::sleep(delay);
                let response = reply(&request);
                // Requests abandoned by the requester are not counted.
                if let Ok(true) = endpoint.write_response(&response) {
                    log.lock().expect("lock").push(request);
                }
            }
        });
        Self {
            stop,
            seen,
            handle: Some(handle),
        }
    }

    fn seen(&self) -> Vec<BridgeRequest> {
        self.seen.lock().expect("lock").clone()
    }
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn echo_step(request: &BridgeRequest) -> BridgeResponse {
    let step_id = request.step_id.as_deref().unwrap_or("-");
    BridgeResponse::success(&request.id, format!("{step_id}: done"))
}

struct Harness {
    _dir: TempDir,
    settings: Settings,
    transport: Arc<LocalTransport>,
    coordinator: Arc<RunCoordinator>,
}

fn harness() -> Harness {
    let dir = tempdir().expect("tempdir");
    let mut settings = Settings::with_state_root(dir.path());
    settings.bridge.poll_interval_ms = 5;
    let bridge = BridgeClient::from_settings(&settings).expect("bridge");
    let transport = Arc::new(LocalTransport::new());
    let coordinator = Arc::new(RunCoordinator::new(
        settings.clone(),
        Arc::new(bridge),
        transport.clone(),
    ));
    Harness {
        _dir: dir,
        settings,
        transport,
        coordinator,
    }
}

fn message(text: &str, ts: &str) -> InboundMessage {
    InboundMessage::new("C1", "U1", text, ts)
}

fn runtime_log(settings: &Settings) -> String {
    std::fs::read_to_string(settings.state_root.join("logs/runtime.log")).unwrap_or_default()
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn execute_request_runs_every_step_and_posts_the_synthesizer_answer() {
    let h = harness();
    let worker = FakeWorker::spawn(&h.settings.queue_root(), Duration::ZERO, Box::new(echo_step));

    let outcome = h
        .coordinator
        .handle_message(message("add retry with backoff to the webhook sender", "1.1"));
    let TurnOutcome::Completed { run_id, final_text } = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(final_text, "synthesizer: done");
    assert_eq!(worker.seen().len(), 6);

    // Progress message is gone; only the answer stays visible.
    assert_eq!(h.transport.visible_messages("C1"), vec!["synthesizer: done"]);
    assert!(h
        .transport
        .events()
        .iter()
        .any(|event| matches!(event, TransportEvent::Updated { .. })));

    let obs = h.coordinator.observability();
    let trace = obs
        .load_trace(&run_id)
        .expect("read trace")
        .expect("trace on disk");
    assert_eq!(trace.status, Some(RunStatus::Succeeded));
    assert_eq!(trace.round_trips, 6);
    assert!(trace.route.is_some());
    assert!(trace.execution_tokens.input > 0);
    assert!(trace.events.iter().any(|event| event.phase == "wave_started"));

    let metrics = obs.load_metrics().expect("metrics");
    assert_eq!(metrics.runs_with_status(RunStatus::Succeeded), 1);
    assert_eq!(metrics.round_trips, 6);
    assert!(!h.coordinator.is_running("C1"));
}

#[test]
fn destructive_request_waits_for_the_exact_token() {
    let h = harness();
    let worker = FakeWorker::spawn(&h.settings.queue_root(), Duration::ZERO, Box::new(echo_step));
    let original = "delete the stale preview deployments";

    let outcome = h.coordinator.handle_message(message(original, "1700000000.000200"));
    let expected_token = confirmation_token("1700000000.000200");
    assert_eq!(
        outcome,
        TurnOutcome::AwaitingConfirmation {
            token: expected_token.clone()
        }
    );
    assert!(worker.seen().is_empty());
    assert_eq!(h.coordinator.pending_token("C1"), Some(expected_token.clone()));

    let outcome = h.coordinator.handle_message(message("confirm 123456", "1700000001.0"));
    assert!(matches!(outcome, TurnOutcome::ConfirmationMismatch { .. }));
    assert!(worker.seen().is_empty());
    let log = runtime_log(&h.settings);
    assert!(log.contains("kind=confirmation_required"));
    assert!(log.contains("kind=confirmation_mismatch"));

    let outcome = h
        .coordinator
        .handle_message(message(&format!("confirm {expected_token}"), "1700000002.0"));
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));

    let seen = worker.seen();
    assert!(!seen.is_empty());
    for request in &seen {
        let card = request.task_card.as_ref().expect("task card on request");
        assert_eq!(card.objective, original);
        assert_eq!(request.ts, "1700000000.000200");
    }
    let metrics = h.coordinator.observability().load_metrics().expect("metrics");
    assert_eq!(metrics.confirmations, 2);
    assert_eq!(metrics.runs_with_status(RunStatus::AwaitingConfirmation), 1);
}

#[test]
fn expired_confirmation_is_dropped_and_reported() {
    let h = harness();
    let outcome = h
        .coordinator
        .handle_message_at(message("reset the analytics tables", "5.0"), 0);
    let TurnOutcome::AwaitingConfirmation { token } = outcome else {
        panic!("expected prompt, got {outcome:?}");
    };

    let outcome = h
        .coordinator
        .handle_message_at(message(&format!("confirm {token}"), "6.0"), 601_000);
    assert_eq!(outcome, TurnOutcome::ConfirmationExpired);
    assert_eq!(h.coordinator.pending_token("C1"), None);
    assert!(runtime_log(&h.settings).contains("kind=confirmation_expired"));
    assert!(h
        .transport
        .visible_messages("C1")
        .last()
        .is_some_and(|text| text.contains("expired")));
}

#[test]
fn confirmation_words_without_pending_task_are_rejected() {
    let h = harness();
    let outcome = h.coordinator.handle_message(message("yes", "7.0"));
    assert_eq!(outcome, TurnOutcome::NothingPending);
    assert!(h.transport.visible_messages("C1")[0].contains("no pending task"));
}

#[test]
fn vague_request_asks_for_clarification() {
    let h = harness();
    let outcome = h.coordinator.handle_message(message("fix", "8.0"));
    assert!(matches!(outcome, TurnOutcome::ClarificationRequested { .. }));
    let metrics = h.coordinator.observability().load_metrics().expect("metrics");
    assert_eq!(metrics.clarifications, 1);
    assert_eq!(metrics.runs_with_status(RunStatus::ClarificationNeeded), 1);

    assert!(runtime_log(&h.settings).contains("kind=clarification_needed"));
    let turn_id = std::fs::read_dir(h.settings.state_root.join("runs"))
        .expect("runs dir")
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .find_map(|name| {
            name.strip_prefix("turn-")
                .and_then(|_| name.strip_suffix(".json"))
                .map(str::to_string)
        })
        .expect("turn trace");
    let trace = h
        .coordinator
        .observability()
        .load_trace(&turn_id)
        .expect("read")
        .expect("trace");
    let ended = trace
        .events
        .iter()
        .find(|event| event.phase == "turn_ended")
        .expect("turn_ended event");
    let data = ended.data.as_ref().expect("event data");
    assert_eq!(data["kind"], "clarification_needed");
    assert_eq!(data["soft"], true);
}

#[test]
fn worker_failure_is_reported_as_failed_run() {
    let h = harness();
    let _worker = FakeWorker::spawn(
        &h.settings.queue_root(),
        Duration::ZERO,
        Box::new(|request: &BridgeRequest| {
            if request.step_id.as_deref() == Some("coder") {
                BridgeResponse::failure(&request.id, "compiler crashed")
            } else {
                echo_step(request)
            }
        }),
    );

    let outcome = h
        .coordinator
        .handle_message(message("implement the export endpoint", "9.0"));
    let TurnOutcome::Failed { run_id, reason } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(reason.contains("compiler crashed"));
    assert!(h
        .transport
        .visible_messages("C1")
        .iter()
        .any(|text| text.starts_with("Run failed:")));
    let trace = h
        .coordinator
        .observability()
        .load_trace(&run_id)
        .expect("read")
        .expect("trace");
    assert_eq!(trace.status, Some(RunStatus::Failed));
    let log = runtime_log(&h.settings);
    assert!(log.contains("coordinator.run_failed"));
    assert!(log.contains("kind=worker_reported_error"));
}

#[test]
fn busy_channel_rejects_chat_queues_events_and_stops_on_request() {
    let h = harness();
    let worker = FakeWorker::spawn(
        &h.settings.queue_root(),
        Duration::from_millis(250),
        Box::new(echo_step),
    );

    let coordinator = Arc::clone(&h.coordinator);
    let first = thread::spawn(move || {
        coordinator.handle_message(message("refactor the billing retry loop", "10.0"))
    });
    wait_until(|| h.coordinator.is_running("C1"));

    let busy = h.coordinator.handle_message(message("also update the docs", "10.1"));
    assert_eq!(busy, TurnOutcome::Busy);

    let mut event = message("status?", "10.2");
    event.is_event = true;
    assert_eq!(h.coordinator.handle_message(event), TurnOutcome::Queued);

    let other_channel = InboundMessage::new("C2", "U1", "thanks!", "10.3");
    assert_ne!(h.coordinator.handle_message(other_channel), TurnOutcome::Busy);

    let stop = h.coordinator.handle_message(message("stop", "10.4"));
    assert_eq!(stop, TurnOutcome::StopRequested { active: true });

    let outcome = first.join().expect("join");
    assert!(matches!(outcome, TurnOutcome::Stopped { .. }));
    assert!(!h.coordinator.is_running("C1"));

    let texts = h.transport.visible_messages("C1");
    assert!(texts.iter().any(|text| text.starts_with("Stopped.")));
    assert!(texts.iter().any(|text| text.contains("already in progress")));

    // The queued event ran after the stopped run.
    assert!(worker.seen().iter().any(|request| request
        .task_card
        .as_ref()
        .is_some_and(|card| card.objective == "status?")));
    let metrics = h.coordinator.observability().load_metrics().expect("metrics");
    assert_eq!(metrics.runs_with_status(RunStatus::Cancelled), 1);
}

#[test]
fn stop_without_active_run_reports_nothing_running() {
    let h = harness();
    assert!(!h.coordinator.stop("C1"));
    let outcome = h.coordinator.handle_message(message("stop", "11.0"));
    assert_eq!(outcome, TurnOutcome::StopRequested { active: false });
}

#[test]
fn every_queued_event_runs_in_arrival_order_after_the_active_run() {
    let h = harness();
    let worker = FakeWorker::spawn(
        &h.settings.queue_root(),
        Duration::from_millis(40),
        Box::new(echo_step),
    );

    let coordinator = Arc::clone(&h.coordinator);
    let first = thread::spawn(move || {
        coordinator.handle_message(message("add pagination to the audit endpoint", "12.0"))
    });
    wait_until(|| h.coordinator.is_running("C1"));

    let backlog = ["status of deploy one?", "status of deploy two?", "status of deploy three?"];
    for (index, text) in backlog.iter().enumerate() {
        let mut event = message(text, &format!("12.{}", index + 1));
        event.is_event = true;
        assert_eq!(h.coordinator.handle_message(event), TurnOutcome::Queued);
    }

    let outcome = first.join().expect("join");
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    assert!(!h.coordinator.is_running("C1"));

    let mut objectives: Vec<String> = Vec::new();
    for request in worker.seen() {
        let objective = request.task_card.expect("task card").objective;
        if !objectives.contains(&objective) {
            objectives.push(objective);
        }
    }
    let mut expected = vec!["add pagination to the audit endpoint".to_string()];
    expected.extend(backlog.iter().map(|text| text.to_string()));
    assert_eq!(objectives, expected);

    let metrics = h.coordinator.observability().load_metrics().expect("metrics");
    assert_eq!(metrics.runs_with_status(RunStatus::Succeeded), 4);
}
