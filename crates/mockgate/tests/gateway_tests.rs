//! Integration tests for the dynamic mock surface.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

use mockgate::api;
use mockgate::state::AppState;
use mockgate_core::hub::Subscriber;
use mockgate_core::model::{ConditionalResponse, MockServiceCreate, ResponseKind, ServiceType, Strategy};
use mockgate_core::{LogHub, LogReader, LogSettings, LogWriter, ServiceRepository, StrategyProcessor};

fn test_state(dir: &TempDir) -> AppState {
    let settings = LogSettings {
        dir: dir.path().join("logs"),
        max_bytes: 10 * 1024 * 1024,
        backup_count: 3,
        rotation: None,
    };
    let (hub, events) = LogHub::spawn(64);
    AppState {
        repo: Arc::new(ServiceRepository::new()),
        processor: Arc::new(StrategyProcessor::new().unwrap()),
        writer: Arc::new(LogWriter::new(&settings, events).unwrap()),
        reader: Arc::new(LogReader::new(&settings)),
        hub,
    }
}

fn app(state: &AppState) -> Router {
    api::router(state.clone())
}

fn static_service(name: &str, path: &str, body: &str) -> MockServiceCreate {
    MockServiceCreate {
        name: name.into(),
        path: path.into(),
        methods: vec!["GET".into()],
        strategy: Strategy::Static,
        static_response: Some(body.into()),
        ..Default::default()
    }
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_static_exact_match() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    state.repo.create(static_service("hello", "/hello", "hi")).unwrap();

    let response = app(&state)
        .oneshot(Request::builder().uri("/hello").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "hi");

    // Exactly one log record, carrying the outcome.
    let records = state.reader.get(None, 0, 10);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].mock_service_id, Some(1));
    assert_eq!(records[0].response_status, 200);
    assert_eq!(records[0].response_body, "hi");
    assert_eq!(records[0].method, "GET");
}

#[tokio::test]
async fn test_miss_is_404_and_logged() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);

    let response = app(&state)
        .oneshot(Request::builder().uri("/nothing/here").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_string(response).await;
    assert!(body.contains("mock service not found"));

    let records = state.reader.get(None, 0, 10);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].mock_service_id, None);
    assert_eq!(records[0].response_status, 404);
    assert_eq!(records[0].path, "/nothing/here");
}

#[tokio::test]
async fn test_templated_path_and_query_logged() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    state.repo.create(static_service("users", "/users/{id}", "user")).unwrap();

    let response = app(&state)
        .oneshot(Request::builder().uri("/users/42?verbose=1").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let records = state.reader.get(None, 0, 10);
    assert_eq!(records[0].path, "/users/42");
    assert_eq!(records[0].query_params["verbose"], "1");
}

#[tokio::test]
async fn test_default_content_type_for_static() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    state.repo.create(static_service("hello", "/hello", "{}")).unwrap();

    let response = app(&state)
        .oneshot(Request::builder().uri("/hello").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
}

#[tokio::test]
async fn test_configured_headers_win_over_default() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let mut service = static_service("hello", "/hello", "plain");
    service.static_headers = Some(
        [("Content-Type".to_string(), "text/plain".to_string())]
            .into_iter()
            .collect(),
    );
    state.repo.create(service).unwrap();

    let response = app(&state)
        .oneshot(Request::builder().uri("/hello").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
}

#[tokio::test]
async fn test_wrong_method_misses() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    state.repo.create(static_service("hello", "/hello", "hi")).unwrap();

    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/hello")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_soap_disambiguation() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    for name in ["Calc_Add", "Calc_Sub"] {
        let mut service = static_service(name, "/soap", name);
        service.methods = vec!["POST".into()];
        service.service_type = ServiceType::Soap;
        state.repo.create(service).unwrap();
    }

    // SOAPAction names the second service.
    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/soap")
                .header("content-type", "text/xml")
                .header("soapaction", "urn:Sub")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_string(response).await, "Calc_Sub");

    // Empty SOAPAction, body names the operation.
    let envelope = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><Sub/></soap:Body></soap:Envelope>"#;
    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/soap")
                .header("content-type", "text/xml")
                .header("soapaction", "\"\"")
                .body(Body::from(envelope))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_string(response).await, "Calc_Sub");

    // No signal at all: first registered SOAP service answers.
    let response = app(&state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/soap")
                .header("content-type", "text/xml")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_string(response).await, "Calc_Add");
}

#[tokio::test]
async fn test_conditional_branches() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let service = MockServiceCreate {
        name: "cond".into(),
        path: "/x".into(),
        methods: vec!["GET".into()],
        strategy: Strategy::Conditional,
        condition_code: Some("n = int(query.get('n', '0'))".into()),
        conditional_responses: Some(vec![
            ConditionalResponse {
                condition: "n > 10".into(),
                response_type: ResponseKind::Static,
                response: Some("big".into()),
                proxy_url: None,
                status_code: 200,
                headers: None,
                delay: 0.0,
            },
            ConditionalResponse {
                condition: "True".into(),
                response_type: ResponseKind::Static,
                response: Some(r#"{"n": n}"#.into()),
                proxy_url: None,
                status_code: 200,
                headers: None,
                delay: 0.0,
            },
        ]),
        conditional_status_code: 200,
        ..Default::default()
    };
    state.repo.create(service).unwrap();

    let response = app(&state)
        .oneshot(Request::builder().uri("/x?n=20").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_string(response).await, "big");

    let response = app(&state)
        .oneshot(Request::builder().uri("/x?n=3").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_string(response).await, r#"{"n":3}"#);
}

#[tokio::test]
async fn test_inactive_service_is_invisible() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    let mut service = static_service("hello", "/hello", "hi");
    service.is_active = false;
    state.repo.create(service).unwrap();

    let response = app(&state)
        .oneshot(Request::builder().uri("/hello").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

struct ChannelSubscriber {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait::async_trait]
impl Subscriber for ChannelSubscriber {
    async fn deliver(&self, frame: &str) -> Result<(), String> {
        self.tx.send(frame.to_string()).map_err(|e| e.to_string())
    }
}

#[tokio::test]
async fn test_live_event_follows_log_write() {
    let dir = TempDir::new().unwrap();
    let state = test_state(&dir);
    state.repo.create(static_service("hello", "/hello", "hi")).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    state.hub.subscribe(Arc::new(ChannelSubscriber { tx }), None);

    let response = app(&state)
        .oneshot(Request::builder().uri("/hello").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("live event arrived")
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(parsed["type"], "log");
    assert_eq!(parsed["data"]["path"], "/hello");

    // The record the event announced is already readable.
    let id = parsed["data"]["id"].as_str().unwrap();
    let records = state.reader.get(None, 0, 10);
    assert!(records.iter().any(|r| r.id == id));

    // Exactly one frame per record.
    assert!(rx.try_recv().is_err());
}
