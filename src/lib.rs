pub mod constants;
pub mod debug_utils;
pub mod events;
pub mod health;
pub mod ingress;
pub mod logging;
pub mod main_helper;
pub mod projections;
pub mod specs;
pub mod str_utils;
pub mod streaming;
pub mod thinking;
pub mod tool_calls;
pub mod types;

pub use types::*;

pub use main_helper::{AppState, Args};
