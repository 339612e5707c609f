//! Fleet monitor: streams drone telemetry into merged tables and serves
//! them over HTTP.

pub mod api;
pub mod config;

pub use api::{create_router, AppState};
pub use config::MonitorConfig;
