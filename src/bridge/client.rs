use super::{BridgeError, BridgeRequest, BridgeResponse, BridgeStatus, FileQueue, MessageQueue};
use crate::config::Settings;
use crate::shared::{append_runtime_log, unique_id, CancelToken};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(150);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

pub type StatusCallback<'a> = &'a (dyn Fn(&BridgeStatus) + Sync);

/// One request/response exchange with the external worker.
pub trait Bridge: Send + Sync {
    /// Sends `request` under a freshly generated id and blocks until the
    /// worker answers, `cancel` fires, or `timeout` elapses.
    fn request(
        &self,
        request: BridgeRequest,
        cancel: &CancelToken,
        on_status: Option<StatusCallback<'_>>,
        timeout: Option<Duration>,
    ) -> Result<BridgeResponse, BridgeError>;
}

#[derive(Debug, Clone)]
pub struct BridgeClient<Q: MessageQueue = FileQueue> {
    queue: Q,
    poll_interval: Duration,
    default_timeout: Duration,
    log_root: Option<PathBuf>,
}

impl BridgeClient<FileQueue> {
    pub fn from_settings(settings: &Settings) -> Result<Self, BridgeError> {
        let queue = FileQueue::open(&settings.queue_root())?;
        Ok(Self::new(queue)
            .with_poll_interval(Duration::from_millis(settings.bridge.poll_interval_ms))
            .with_default_timeout(Duration::from_millis(settings.bridge.default_timeout_ms))
            .with_log_root(settings.state_root.clone()))
    }
}

impl<Q: MessageQueue> BridgeClient<Q> {
    pub fn new(queue: Q) -> Self {
        Self {
            queue,
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_timeout: DEFAULT_TIMEOUT,
            log_root: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_default_timeout(mut self, default_timeout: Duration) -> Self {
        self.default_timeout = default_timeout;
        self
    }

    pub fn with_log_root(mut self, state_root: impl Into<PathBuf>) -> Self {
        self.log_root = Some(state_root.into());
        self
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    fn log(&self, level: &str, event: &str, message: &str) {
        if let Some(root) = &self.log_root {
            append_runtime_log(root, level, event, message);
        }
    }

    fn await_response(
        &self,
        id: &str,
        cancel: &CancelToken,
        on_status: Option<StatusCallback<'_>>,
        timeout: Duration,
    ) -> Result<BridgeResponse, BridgeError> {
        let started = Instant::now();
        let mut last_signature: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(BridgeError::Aborted { id: id.to_string() });
            }

            match self.queue.poll_status(id) {
                Ok(Some(status)) => {
                    let signature = status.signature();
                    if last_signature.as_deref() != Some(signature.as_str()) {
                        if let Some(callback) = on_status {
                            callback(&status);
                        }
                        last_signature = Some(signature);
                    }
                }
                Ok(None) => {}
                // Status updates are advisory; a bad one is skipped.
                Err(err) => self.log("warn", "bridge.status_unreadable", &err.to_string()),
            }

            if let Some(response) = self.queue.poll_response(id)? {
                if !response.ok {
                    return Err(BridgeError::WorkerReported {
                        id: id.to_string(),
                        message: response
                            .error
                            .clone()
                            .filter(|message| !message.trim().is_empty())
                            .unwrap_or_else(|| "worker reported failure".to_string()),
                    });
                }
                return Ok(response);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(BridgeError::Timeout {
                    id: id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let wait = self.poll_interval.min(timeout - elapsed);
            if !cancel.sleep(wait) {
                return Err(BridgeError::Aborted { id: id.to_string() });
            }
        }
    }
}

impl<Q: MessageQueue> Bridge for BridgeClient<Q> {
    fn request(
        &self,
        mut request: BridgeRequest,
        cancel: &CancelToken,
        on_status: Option<StatusCallback<'_>>,
        timeout: Option<Duration>,
    ) -> Result<BridgeResponse, BridgeError> {
        request.id = unique_id("req");
        let id = request.id.clone();
        let _artifacts = ArtifactGuard {
            queue: &self.queue,
            id: &id,
            log_root: self.log_root.as_deref(),
        };

        if cancel.is_cancelled() {
            return Err(BridgeError::Aborted { id: id.clone() });
        }
        self.queue.enqueue(&request)?;
        self.log(
            "info",
            "bridge.enqueued",
            &format!(
                "id={} run_id={} step_id={}",
                id,
                request.run_id.as_deref().unwrap_or("-"),
                request.step_id.as_deref().unwrap_or("-")
            ),
        );

        let timeout = timeout.unwrap_or(self.default_timeout);
        let result = self.await_response(&id, cancel, on_status, timeout);
        if let Err(err) = &result {
            let level = if matches!(err, BridgeError::Aborted { .. }) {
                "info"
            } else {
                "warn"
            };
            self.log(level, "bridge.request_failed", &err.to_string());
        }
        result
    }
}

/// Releases the request, response and status artifacts of one exchange when
/// dropped, so every exit path of [`BridgeClient::request`] cleans up.
struct ArtifactGuard<'a, Q: MessageQueue> {
    queue: &'a Q,
    id: &'a str,
    log_root: Option<&'a Path>,
}

impl<Q: MessageQueue> Drop for ArtifactGuard<'_, Q> {
    fn drop(&mut self) {
        if let Err(err) = self.queue.ack(self.id) {
            if let Some(root) = self.log_root {
                append_runtime_log(root, "error", "bridge.cleanup_failed", &err.to_string());
            }
        }
    }
}
