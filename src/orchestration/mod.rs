pub mod confirmation;
pub mod coordinator;
pub mod error;
pub mod intent;
pub mod lexical_router;
pub mod plan;
pub mod progress;
pub mod prompt_render;
pub mod routing;
pub mod step_runner;
