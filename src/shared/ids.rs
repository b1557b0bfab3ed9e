use getrandom::getrandom;
use std::sync::atomic::{AtomicU64, Ordering};

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns an identifier that is never handed out twice by this process and
/// is very unlikely to collide with one from another process.
///
/// Layout: `<prefix>-<millis>-<pid>-<counter>-<random>`. Numeric fields
/// are zero-padded to a fixed width, so ids created one after another in a
/// process sort in creation order.
pub fn unique_id(prefix: &str) -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!(
        "{prefix}-{:013}-{:010}-{counter:020}-{}",
        super::time::now_millis(),
        std::process::id(),
        random_hex(4)
    )
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    if getrandom(&mut buf).is_err() {
        return "0".repeat(bytes * 2);
    }
    buf.iter().map(|b| format!("{b:02x}")).collect()
}
