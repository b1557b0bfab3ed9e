use super::{BridgeError, BridgePaths, BridgeRequest, BridgeResponse, BridgeStatus};
use crate::shared::fs_atomic::{atomic_write_file, remove_if_exists};
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

/// Producer side of the request/response/status exchange.
///
/// The client only talks to this trait, so the transport underneath (files,
/// a local socket, an embedded broker) can change without touching callers.
pub trait MessageQueue: Send + Sync {
    fn enqueue(&self, request: &BridgeRequest) -> Result<(), BridgeError>;

    fn poll_response(&self, id: &str) -> Result<Option<BridgeResponse>, BridgeError>;

    fn poll_status(&self, id: &str) -> Result<Option<BridgeStatus>, BridgeError>;

    /// Releases every artifact held for `id`. Must succeed when some or all
    /// of them are already gone.
    fn ack(&self, id: &str) -> Result<(), BridgeError>;
}

#[derive(Debug, Clone)]
pub struct FileQueue {
    paths: BridgePaths,
}

impl FileQueue {
    pub fn new(paths: BridgePaths) -> Self {
        Self { paths }
    }

    pub fn open(queue_root: &Path) -> Result<Self, BridgeError> {
        let paths = BridgePaths::from_queue_root(queue_root);
        paths.ensure_dirs().map_err(|e| io_err(queue_root, e))?;
        Ok(Self::new(paths))
    }

    pub fn paths(&self) -> &BridgePaths {
        &self.paths
    }
}

impl MessageQueue for FileQueue {
    fn enqueue(&self, request: &BridgeRequest) -> Result<(), BridgeError> {
        let path = self.paths.request_path(&request.id);
        let body = serde_json::to_vec_pretty(request).map_err(|e| json_err(&path, e))?;
        atomic_write_file(&path, &body).map_err(|e| io_err(&path, e))
    }

    fn poll_response(&self, id: &str) -> Result<Option<BridgeResponse>, BridgeError> {
        read_optional_json(&self.paths.response_path(id))
    }

    fn poll_status(&self, id: &str) -> Result<Option<BridgeStatus>, BridgeError> {
        read_optional_json(&self.paths.status_path(id))
    }

    fn ack(&self, id: &str) -> Result<(), BridgeError> {
        let mut first_error = None;
        for path in [
            self.paths.request_path(id),
            self.paths.response_path(id),
            self.paths.status_path(id),
        ] {
            if let Err(err) = remove_if_exists(&path) {
                first_error.get_or_insert_with(|| io_err(&path, err));
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub(crate) fn read_optional_json<T: DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, BridgeError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(path, err)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| json_err(path, e))
}

pub(crate) fn io_err(path: &Path, source: std::io::Error) -> BridgeError {
    BridgeError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub(crate) fn json_err(path: &Path, source: serde_json::Error) -> BridgeError {
    BridgeError::Json {
        path: path.display().to_string(),
        source,
    }
}
