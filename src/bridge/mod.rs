pub mod client;
pub mod message;
pub mod paths;
pub mod queue;
pub mod worker;

pub use client::{Bridge, BridgeClient, StatusCallback, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};
pub use message::{BridgeRequest, BridgeResponse, BridgeStatus, StatusPhase};
pub use paths::{artifact_filename, is_valid_artifact_filename, BridgePaths};
pub use queue::{FileQueue, MessageQueue};
pub use worker::WorkerEndpoint;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge request `{id}` timed out after {timeout_ms}ms")]
    Timeout { id: String, timeout_ms: u64 },
    #[error("bridge request `{id}` was aborted")]
    Aborted { id: String },
    #[error("worker reported an error for `{id}`: {message}")]
    WorkerReported { id: String, message: String },
    #[error("bridge io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid bridge payload in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
