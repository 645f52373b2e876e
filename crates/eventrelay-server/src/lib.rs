// ABOUTME: HTTP server and background loops for eventrelay, one event store and queue per environment.
// ABOUTME: Uses Axum with shared per-environment state; forwarding and stale sweeps run as tokio tasks.

pub mod api;
pub mod app_state;
pub mod config;
pub mod forwarder;
pub mod routes;
pub mod watcher;

pub use app_state::{AppState, Environment, SharedState, StartupError};
pub use config::{ConfigError, EnvironmentConfig, EnvironmentsFile, RelayConfig};
pub use forwarder::{LogSink, RoundOutcome, SinkError, StatusSink, forward_once};
pub use routes::create_router;
pub use watcher::{SweepError, sweep_once};
