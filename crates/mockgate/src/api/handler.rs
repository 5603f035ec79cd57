//! The catch-all mock request handler.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;
use bytes::Bytes;
use serde_json::json;
use tracing::{error, warn};

use mockgate_core::model::Strategy;
use mockgate_core::{InboundRequest, LogDraft, ProcessOutcome, router};

use crate::state::AppState;

/// Largest inbound body the gateway buffers. Matches what a mock gateway
/// realistically replays; anything bigger is cut off at this boundary.
const BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Serve one mock request: route, execute, log, emit, respond.
///
/// Every request that reaches this handler produces exactly one log
/// record, misses and strategy failures included. Logging and fan-out are
/// best-effort; only the client response decides the request's fate.
pub async fn handle_mock_request(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();

    let (parts, body) = request.into_parts();
    let method = parts.method.as_str().to_string();
    let path = normalize_path(parts.uri.path());
    let query_string = parts.uri.query().unwrap_or("").to_string();

    // The body is buffered exactly once and reused everywhere: forwarded
    // byte-for-byte by the proxy, viewed as text by the evaluator and the
    // log record.
    let body_bytes = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(%error, "failed to read request body");
            Bytes::new()
        }
    };

    let inbound = InboundRequest::new(method, path, query_string, &parts.headers, body_bytes);

    let snapshot = state.repo.list_active();
    let matched = router::route(
        &snapshot,
        &inbound.path,
        &inbound.method,
        &parts.headers,
        &inbound.body_text(),
    );

    let (service, outcome) = match matched {
        Some((service, params)) => {
            let outcome = state.processor.process(&service, &inbound, &params).await;
            (Some(service), outcome)
        }
        None => (
            None,
            ProcessOutcome {
                status: 404,
                body: json!({"detail": "mock service not found"}).to_string(),
                headers: Default::default(),
                proxy_info: None,
            },
        ),
    };

    let draft = LogDraft {
        mock_service_id: service.as_ref().map(|s| s.id),
        mock_service_name: service.as_ref().map(|s| s.name.clone()),
        path: inbound.path.clone(),
        method: inbound.method.clone(),
        headers: inbound.headers.clone(),
        query_params: inbound.query_params.clone(),
        body: inbound.body_text().into_owned(),
        response_status: outcome.status,
        response_body: outcome.body.clone(),
        response_headers: outcome.headers.clone(),
        processing_time: started.elapsed().as_secs_f64(),
        proxy_info: outcome.proxy_info.clone(),
    };
    if let Err(log_error) = state.writer.append(draft) {
        // The response still goes out; only the audit trail suffered.
        error!(%log_error, "failed to persist request log");
    }

    let default_json = match service.as_ref().map(|s| s.strategy) {
        // Proxy responses carry whatever the upstream said, nothing more.
        Some(Strategy::Proxy) => false,
        Some(_) | None => true,
    };
    build_response(outcome, default_json)
}

/// Dynamic paths always start with `/` even if a client managed not to
/// send one.
fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn build_response(outcome: ProcessOutcome, default_json: bool) -> Response {
    let status = StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::builder().status(status);

    let mut has_content_type = false;
    for (name, value) in &outcome.headers {
        if name.eq_ignore_ascii_case("content-type") {
            has_content_type = true;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response = response.header(name, value);
            }
            _ => warn!(header = %name, "dropping unrepresentable response header"),
        }
    }
    if default_json && !has_content_type {
        response = response.header(header::CONTENT_TYPE, "application/json");
    }

    response
        .body(Body::from(outcome.body))
        .unwrap_or_else(|error| {
            error!(%error, "failed to build response");
            Response::new(Body::from("internal error"))
        })
}
