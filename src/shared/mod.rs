pub mod cancel;
pub mod fs_atomic;
pub mod ids;
pub mod logging;
pub mod time;

pub use cancel::CancelToken;
pub use fs_atomic::atomic_write_file;
pub use ids::unique_id;
pub use logging::append_runtime_log;
pub use time::now_millis;
