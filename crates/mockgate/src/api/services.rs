//! Management API: mock service CRUD and request-log queries.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::json;

use mockgate_core::RequestLog;
use mockgate_core::logbook::LogFileInfo;
use mockgate_core::model::{MockService, MockServiceCreate, MockServiceUpdate};

use super::ApiError;
use crate::state::AppState;

fn default_list_limit() -> usize {
    1000
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_log_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

pub async fn create_service(
    State(state): State<AppState>,
    Json(input): Json<MockServiceCreate>,
) -> Result<Json<MockService>, ApiError> {
    let service = state.repo.create(input)?;
    Ok(Json(service))
}

pub async fn list_services(
    State(state): State<AppState>,
    Query(page): Query<Pagination>,
) -> Json<Vec<MockService>> {
    let services = state
        .repo
        .list(page.skip, page.limit)
        .iter()
        .map(|s| (**s).clone())
        .collect();
    Json(services)
}

pub async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<MockService>, ApiError> {
    state
        .repo
        .get(id)
        .map(|s| Json((*s).clone()))
        .ok_or_else(|| ApiError::NotFound(format!("mock service {id} not found")))
}

pub async fn update_service(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(patch): Json<MockServiceUpdate>,
) -> Result<Json<MockService>, ApiError> {
    state
        .repo
        .update(id, patch)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("mock service {id} not found")))
}

pub async fn delete_service(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.repo.delete(id) {
        Ok(Json(json!({"deleted": id})))
    } else {
        Err(ApiError::NotFound(format!("mock service {id} not found")))
    }
}

pub async fn service_logs(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<RequestLog>>, ApiError> {
    if state.repo.get(id).is_none() {
        return Err(ApiError::NotFound(format!("mock service {id} not found")));
    }
    Ok(Json(state.reader.get(Some(id), query.skip, query.limit)))
}

pub async fn all_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Json<Vec<RequestLog>> {
    Json(state.reader.get(None, query.skip, query.limit))
}

pub async fn log_files_info(State(state): State<AppState>) -> Json<Vec<LogFileInfo>> {
    Json(state.reader.files_info())
}
