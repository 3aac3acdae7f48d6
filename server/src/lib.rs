pub mod config;
pub mod health;
pub mod rest;

pub use config::DaemonConfig;
pub use rest::{create_router, start_rest_server, AppState};
