//! Relay server binary support: CLI, configuration, logging, the Telegram
//! notifier and the HTTP layer over [`relaycore`].

pub mod cli;
pub mod config;
pub mod http;
pub mod logging;
pub mod telegram;

pub use config::AppConfig;
pub use http::{create_router, AppState, MiniAppLinks};
