//! HTTP surfaces: management API, WebSocket endpoints, mock fallback.

mod handler;
mod services;
mod ws;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;

use crate::state::AppState;

/// Build the full application router.
///
/// Management routes are registered first; anything they do not claim falls
/// through to the mock handler. The static `logs/...` routes coexist with
/// `/{id}` because static segments take precedence in axum's matcher.
pub fn router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/health", get(health))
        .route(
            "/api/mock-services",
            get(services::list_services).post(services::create_service),
        )
        .route(
            "/api/mock-services/",
            get(services::list_services).post(services::create_service),
        )
        .route(
            "/api/mock-services/{id}",
            get(services::get_service)
                .put(services::update_service)
                .delete(services::delete_service),
        )
        .route("/api/mock-services/{id}/logs", get(services::service_logs))
        .route("/api/mock-services/logs/all", get(services::all_logs))
        .route("/api/mock-services/logs/files/info", get(services::log_files_info))
        .route("/ws/logs", get(ws::ws_logs_all))
        .route("/ws/logs/{service_id}", get(ws::ws_logs_service))
        .fallback(handler::handle_mock_request)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

/// Error shape of the management API: a status plus a `detail` message.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn detail(&self) -> &str {
        match self {
            ApiError::BadRequest(detail) | ApiError::NotFound(detail) => detail,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({"detail": self.detail()}))).into_response()
    }
}

impl From<mockgate_core::model::ValidationError> for ApiError {
    fn from(error: mockgate_core::model::ValidationError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}
