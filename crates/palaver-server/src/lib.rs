//! Transport adapter and application wiring: configuration, the context
//! object holding hub/cluster/session-store, and the WebSocket endpoint.

pub mod app;
pub mod config;
pub mod ws;

pub use app::App;
pub use config::{ConfigError, ServerConfig};
