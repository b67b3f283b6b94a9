pub mod aggregator;
pub mod constants;
pub mod grammar;
pub mod health;
pub mod ingress;
pub mod json_depth;
pub mod log_rotation;
pub mod logging;
pub mod main_helper;
pub mod proxy;
pub mod redaction;
pub mod repair;
pub mod sse;
pub mod streaming;
pub mod types;

pub use types::*;

pub use main_helper::{build_router, AppState, Args};
