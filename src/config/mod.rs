pub mod error;
pub mod load;
pub mod paths;
pub mod settings;

pub use error::ConfigError;
pub use load::load_settings;
pub use paths::{
    default_settings_path, default_state_root, GLOBAL_SETTINGS_FILE_NAME, GLOBAL_STATE_DIR,
};
pub use settings::{
    BridgeSettings, BudgetSettings, ConfirmationSettings, RunnerSettings, Settings,
    DEFAULT_DESTRUCTIVE_MARKERS,
};
