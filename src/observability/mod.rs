pub mod metrics;
pub mod trace;

pub use metrics::{metrics_path, MetricsSnapshot};
pub use trace::{trace_path, RunStatus, RunTrace, TokenScope, TokenUsage, TraceEvent};

use crate::orchestration::routing::ModelRoute;
use crate::shared::logging::append_runtime_log;
use crate::shared::time::{now_millis, now_rfc3339};
use crate::shared::atomic_write_file;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-run traces plus the cumulative metrics snapshot.
///
/// Every mutation of an active trace is written to
/// `<state_root>/runs/<run_id>.json` before the call returns. Calls naming a
/// run that is not active are ignored, so double finishes and late events
/// from a cancelled run are harmless. Persistence failures are logged and
/// never surface to the caller.
///
/// The metrics file is updated by read-modify-write and assumes a single
/// writing process.
#[derive(Debug)]
pub struct RunObservability {
    state_root: PathBuf,
    active: Mutex<HashMap<String, RunTrace>>,
}

impl RunObservability {
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.lock().contains_key(run_id)
    }

    pub fn start_run(&self, run_id: &str, channel_id: &str, user_id: &str) {
        let mut active = self.lock();
        if active.contains_key(run_id) {
            return;
        }
        let mut trace = RunTrace::new(run_id, channel_id, user_id, now_rfc3339(), now_millis());
        trace.events.push(new_event("start", "run started", None));
        self.persist_trace(&trace);
        active.insert(run_id.to_string(), trace);
    }

    pub fn event(&self, run_id: &str, phase: &str, detail: &str, data: Option<Value>) {
        self.update(run_id, |trace| {
            trace.events.push(new_event(phase, detail, data));
        });
    }

    pub fn mark_clarification(&self, run_id: &str) {
        self.update(run_id, |trace| trace.clarifications += 1);
    }

    pub fn mark_confirmation(&self, run_id: &str) {
        self.update(run_id, |trace| trace.confirmations += 1);
    }

    pub fn record_round_trip(&self, run_id: &str) {
        self.update(run_id, |trace| trace.round_trips += 1);
    }

    pub fn record_token_usage(&self, run_id: &str, scope: TokenScope, input: u64, output: u64) {
        self.update(run_id, |trace| trace.tokens_mut(scope).add(input, output));
    }

    pub fn record_route(&self, run_id: &str, route: &ModelRoute) {
        self.update(run_id, |trace| {
            trace.route = Some(route.clone());
            trace.events.push(new_event(
                "route",
                &format!(
                    "{}/{} variant {}",
                    route.conversation_tier, route.execution_tier, route.variant
                ),
                serde_json::to_value(route).ok(),
            ));
        });
    }

    /// Closes the trace, folds it into the metrics snapshot and evicts it.
    /// Returns the finalized trace, or `None` for an unknown run.
    pub fn finish(&self, run_id: &str, status: RunStatus) -> Option<RunTrace> {
        // The guard spans the metrics read-modify-write.
        let mut active = self.lock();
        let mut trace = active.remove(run_id)?;
        let ended_at = now_rfc3339();
        trace.ended_at = Some(ended_at.clone());
        trace.ended_at_ms = Some(now_millis());
        trace.status = Some(status);
        trace
            .events
            .push(new_event("finish", status.as_str(), None));
        self.persist_trace(&trace);

        let path = metrics_path(&self.state_root);
        let mut snapshot = match read_json_or_default::<MetricsSnapshot>(&path) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.log_failure("observability.metrics_read_failed", &err);
                MetricsSnapshot::default()
            }
        };
        snapshot.fold(&trace, ended_at);
        if let Err(err) = write_json(&path, &snapshot) {
            self.log_failure("observability.metrics_write_failed", &err);
        }
        drop(active);
        Some(trace)
    }

    pub fn load_trace(&self, run_id: &str) -> Result<Option<RunTrace>, ObservabilityError> {
        read_optional_json(&trace_path(&self.state_root, run_id))
    }

    pub fn load_metrics(&self) -> Result<MetricsSnapshot, ObservabilityError> {
        read_json_or_default(&metrics_path(&self.state_root))
    }

    fn update(&self, run_id: &str, apply: impl FnOnce(&mut RunTrace)) {
        let mut active = self.lock();
        let Some(trace) = active.get_mut(run_id) else {
            return;
        };
        apply(trace);
        self.persist_trace(trace);
    }

    fn persist_trace(&self, trace: &RunTrace) {
        let path = trace_path(&self.state_root, &trace.run_id);
        if let Err(err) = write_json(&path, trace) {
            self.log_failure("observability.trace_write_failed", &err);
        }
    }

    fn log_failure(&self, event: &str, err: &ObservabilityError) {
        append_runtime_log(&self.state_root, "warn", event, &err.to_string());
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunTrace>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn new_event(phase: &str, detail: &str, data: Option<Value>) -> TraceEvent {
    TraceEvent {
        at: now_rfc3339(),
        at_ms: now_millis(),
        phase: phase.to_string(),
        detail: detail.to_string(),
        data,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ObservabilityError> {
    let body = serde_json::to_vec_pretty(value).map_err(|source| ObservabilityError::Json {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(path, &body).map_err(|source| ObservabilityError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn read_optional_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ObservabilityError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ObservabilityError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|source| ObservabilityError::Json {
            path: path.display().to_string(),
            source,
        })
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, ObservabilityError> {
    Ok(read_optional_json(path)?.unwrap_or_default())
}
