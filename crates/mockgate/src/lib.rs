//! The mockgate server: axum surfaces over the `mockgate-core` engine.
//!
//! Three HTTP surfaces share one router:
//!
//! - the management API under `/api/mock-services` for registering and
//!   inspecting mock services and their request logs,
//! - the WebSocket endpoints `/ws/logs` and `/ws/logs/{service_id}` for
//!   live log streaming,
//! - the catch-all fallback, which treats every other request as a mock
//!   request: route, execute the strategy, log, respond.

pub mod api;
pub mod state;

pub use state::AppState;
