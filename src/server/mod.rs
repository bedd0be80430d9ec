//! HTTP server for health, stats and metrics.

mod app;
mod state;

pub use app::create_app;
pub use state::AppState;
