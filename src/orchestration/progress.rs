use crate::channels::{ChatTransport, MessageRef};
use crate::shared::logging::append_runtime_log;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub run_id: String,
    pub objective: String,
    pub total_steps: usize,
    #[serde(default)]
    pub completed_steps: usize,
    #[serde(default)]
    pub wave: usize,
    #[serde(default)]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub last_status: Option<String>,
}

impl ProgressSnapshot {
    pub fn new(run_id: impl Into<String>, objective: impl Into<String>, total_steps: usize) -> Self {
        Self {
            run_id: run_id.into(),
            objective: objective.into(),
            total_steps,
            completed_steps: 0,
            wave: 0,
            current_step_id: None,
            last_status: None,
        }
    }

    pub fn summary(&self) -> String {
        let mut line = format!(
            "Working on: {}\n{}/{} steps done",
            self.objective, self.completed_steps, self.total_steps
        );
        if let Some(step_id) = &self.current_step_id {
            line.push_str(&format!(", wave {} running `{step_id}`", self.wave + 1));
        }
        if let Some(status) = self.last_status.as_deref().filter(|s| !s.is_empty()) {
            line.push_str(&format!("\n> {status}"));
        }
        line
    }
}

/// The single status message a run keeps updated in its channel. It is
/// posted when the run starts and deleted once the final reply is out.
/// Transport failures are logged and never reach the run.
pub struct ProgressMessage<'a> {
    transport: &'a dyn ChatTransport,
    state_root: &'a Path,
    message: Option<MessageRef>,
    snapshot: Mutex<ProgressSnapshot>,
}

impl<'a> ProgressMessage<'a> {
    pub fn post(
        transport: &'a dyn ChatTransport,
        state_root: &'a Path,
        channel_id: &str,
        thread_ts: Option<&str>,
        snapshot: ProgressSnapshot,
    ) -> Self {
        let text = snapshot.summary();
        let posted = match thread_ts {
            Some(thread_ts) => transport.post_in_thread(channel_id, thread_ts, &text),
            None => transport.post_message(channel_id, &text),
        };
        let message = match posted {
            Ok(message) => Some(message),
            Err(err) => {
                append_runtime_log(state_root, "warn", "progress.post_failed", &err.to_string());
                None
            }
        };
        Self {
            transport,
            state_root,
            message,
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies `apply` and pushes the new summary. The snapshot lock is held
    /// across the transport call, so the channel always ends on the latest
    /// snapshot when steps report concurrently.
    pub fn update(&self, apply: impl FnOnce(&mut ProgressSnapshot)) {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut snapshot);
        let Some(message) = &self.message else {
            return;
        };
        if let Err(err) = self.transport.update_message(message, &snapshot.summary()) {
            append_runtime_log(
                self.state_root,
                "warn",
                "progress.update_failed",
                &err.to_string(),
            );
        }
    }

    pub fn clear(self) {
        let Some(message) = &self.message else {
            return;
        };
        if let Err(err) = self.transport.delete_message(message) {
            append_runtime_log(
                self.state_root,
                "warn",
                "progress.delete_failed",
                &err.to_string(),
            );
        }
    }
}
