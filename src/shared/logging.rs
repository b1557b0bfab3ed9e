use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn runtime_log_path(state_root: &Path) -> PathBuf {
    state_root.join("logs/runtime.log")
}

/// Appends one JSON line to `<state_root>/logs/runtime.log`. Failures are
/// dropped so that logging can never change the outcome of a run.
pub fn append_runtime_log(state_root: &Path, level: &str, event: &str, message: &str) {
    let payload = serde_json::json!({
        "timestamp": super::time::now_millis(),
        "level": level,
        "event": event,
        "message": message,
    });

    let Ok(line) = serde_json::to_string(&payload) else {
        return;
    };

    let path = runtime_log_path(state_root);
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(path) else {
        return;
    };
    let _ = writeln!(file, "{line}");
}
