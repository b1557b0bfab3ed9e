pub mod bridge;
pub mod channels;
pub mod config;
pub mod observability;
pub mod orchestration;
pub mod shared;
