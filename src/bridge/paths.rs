use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgePaths {
    pub requests: PathBuf,
    pub responses: PathBuf,
    pub status: PathBuf,
}

impl BridgePaths {
    pub fn from_queue_root(queue_root: &Path) -> Self {
        Self {
            requests: queue_root.join("requests"),
            responses: queue_root.join("responses"),
            status: queue_root.join("status"),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.requests, &self.responses, &self.status] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn request_path(&self, id: &str) -> PathBuf {
        self.requests.join(artifact_filename(id))
    }

    pub fn response_path(&self, id: &str) -> PathBuf {
        self.responses.join(artifact_filename(id))
    }

    pub fn status_path(&self, id: &str) -> PathBuf {
        self.status.join(artifact_filename(id))
    }
}

pub fn artifact_filename(id: &str) -> String {
    format!("{}.json", sanitize_filename_component(id))
}

pub fn is_valid_artifact_filename(filename: &str) -> bool {
    let path = Path::new(filename);
    if filename.starts_with('.') {
        return false;
    }
    if path.extension().and_then(|v| v.to_str()) != Some("json") {
        return false;
    }
    path.file_stem()
        .and_then(|v| v.to_str())
        .is_some_and(|stem| !stem.trim().is_empty())
}

fn sanitize_filename_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
