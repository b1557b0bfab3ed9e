use super::queue::{io_err, json_err, read_optional_json};
use super::{
    is_valid_artifact_filename, BridgeError, BridgePaths, BridgeRequest, BridgeResponse,
    BridgeStatus,
};
use crate::shared::fs_atomic::atomic_write_file;
use std::fs;
use std::path::{Path, PathBuf};

/// Consumer side of the file queue, as seen by the external worker.
///
/// A worker takes requests oldest-first by filename, may publish interim
/// status records, and finishes with exactly one response. It never deletes
/// anything; the producer removes all three artifacts once it has read the
/// response.
#[derive(Debug, Clone)]
pub struct WorkerEndpoint {
    paths: BridgePaths,
}

impl WorkerEndpoint {
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

    /// Requests that do not have a response yet, oldest filename first.
    pub fn pending_requests(&self) -> Result<Vec<BridgeRequest>, BridgeError> {
        let mut pending = Vec::new();
        for path in sorted_request_paths(&self.paths.requests)? {
            let Some(request) = read_optional_json::<BridgeRequest>(&path)? else {
                continue;
            };
            if self.paths.response_path(&request.id).exists() {
                continue;
            }
            pending.push(request);
        }
        Ok(pending)
    }

    pub fn claim_oldest_request(&self) -> Result<Option<BridgeRequest>, BridgeError> {
        for path in sorted_request_paths(&self.paths.requests)? {
            let Some(request) = read_optional_json::<BridgeRequest>(&path)? else {
                continue;
            };
            if !self.paths.response_path(&request.id).exists() {
                return Ok(Some(request));
            }
        }
        Ok(None)
    }

    /// Publishes an interim status. Returns `false` when the request is
    /// already gone (cancelled or timed out) and nothing was written.
    pub fn write_status(&self, status: &BridgeStatus) -> Result<bool, BridgeError> {
        self.write_if_requested(&status.id, &self.paths.status_path(&status.id), status)
    }

    /// Publishes the final response. Returns `false` when the request is
    /// already gone and nothing was written.
    pub fn write_response(&self, response: &BridgeResponse) -> Result<bool, BridgeError> {
        self.write_if_requested(
            &response.id,
            &self.paths.response_path(&response.id),
            response,
        )
    }

    fn write_if_requested<T: serde::Serialize>(
        &self,
        id: &str,
        path: &Path,
        value: &T,
    ) -> Result<bool, BridgeError> {
        if !self.paths.request_path(id).exists() {
            return Ok(false);
        }
        let body = serde_json::to_vec_pretty(value).map_err(|e| json_err(path, e))?;
        atomic_write_file(path, &body).map_err(|e| io_err(path, e))?;
        Ok(true)
    }
}

fn sorted_request_paths(dir: &Path) -> Result<Vec<PathBuf>, BridgeError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let valid = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(is_valid_artifact_filename);
        if valid && path.is_file() {
            paths.push(path);
        }
    }
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(paths)
}
