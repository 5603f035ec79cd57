//! Strategy execution: static bodies, reverse proxying and conditional
//! branch selection.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tracing::{debug, info, warn};

use crate::eval;
use crate::logbook::ProxyInfo;
use crate::model::{MockService, ResponseKind, Strategy};
use crate::request::InboundRequest;

/// Headers never forwarded upstream; the client computes both itself.
const EXCLUDED_REQUEST_HEADERS: [&str; 2] = ["content-length", "host"];

/// Headers never relayed back downstream. The client transparently decodes
/// gzip/deflate bodies, so `content-encoding` must go with them or the
/// response would lie about its own bytes.
const EXCLUDED_RESPONSE_HEADERS: [&str; 4] = [
    "content-length",
    "transfer-encoding",
    "connection",
    "content-encoding",
];

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// What a strategy produced for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub status: u16,
    pub body: String,
    pub headers: BTreeMap<String, String>,
    pub proxy_info: Option<ProxyInfo>,
}

impl ProcessOutcome {
    fn plain(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: BTreeMap::new(),
            proxy_info: None,
        }
    }
}

/// Executes the response strategy of a matched service.
///
/// Owns the pooled upstream HTTP client: redirects are followed, gzip and
/// deflate are decoded transparently and every call is bounded by a 30
/// second timeout. Failures never escape as errors; they become the client
/// response dictated by the error taxonomy (502 for unreachable upstreams,
/// 500 for configuration and evaluation problems).
pub struct StrategyProcessor {
    client: reqwest::Client,
}

impl StrategyProcessor {
    /// Build the processor and its HTTP client.
    ///
    /// # Errors
    ///
    /// Fails only when the TLS backend cannot initialize.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Run `service`'s strategy for one request.
    pub async fn process(
        &self,
        service: &MockService,
        request: &InboundRequest,
        path_params: &BTreeMap<String, String>,
    ) -> ProcessOutcome {
        match service.strategy {
            Strategy::Static => self.process_static(service).await,
            Strategy::Proxy => self.process_proxy(service, request, path_params).await,
            Strategy::Conditional => self.process_conditional(service, request, path_params).await,
        }
    }

    async fn process_static(&self, service: &MockService) -> ProcessOutcome {
        sleep_for(service.static_delay).await;
        ProcessOutcome {
            status: service.static_status_code,
            body: service.static_response.clone().unwrap_or_default(),
            headers: service.static_headers.clone().unwrap_or_default(),
            proxy_info: None,
        }
    }

    async fn process_proxy(
        &self,
        service: &MockService,
        request: &InboundRequest,
        path_params: &BTreeMap<String, String>,
    ) -> ProcessOutcome {
        let Some(proxy_url) = service.proxy_url.as_deref() else {
            return ProcessOutcome::plain(500, "proxy_url is not configured");
        };
        sleep_for(service.proxy_delay).await;

        let target_url = build_target_url(
            proxy_url,
            &service.path,
            &request.path,
            path_params,
            &request.query_string,
        );
        self.forward(&target_url, request).await
    }

    async fn process_conditional(
        &self,
        service: &MockService,
        request: &InboundRequest,
        path_params: &BTreeMap<String, String>,
    ) -> ProcessOutcome {
        sleep_for(service.conditional_delay).await;

        let no_branch = || ProcessOutcome {
            status: service.conditional_status_code,
            body: "No condition matched".to_string(),
            headers: service.conditional_headers.clone().unwrap_or_default(),
            proxy_info: None,
        };

        let Some(code) = service.condition_code.as_deref() else {
            return no_branch();
        };
        let branches = service
            .conditional_responses
            .as_deref()
            .unwrap_or_default();

        let mut env = eval::build_context(request, path_params);
        if let Err(error) = eval::run_script(code, &mut env) {
            warn!(service = service.id, %error, "condition code failed");
            return ProcessOutcome::plain(500, format!("condition code failed: {error}"));
        }

        for (index, branch) in branches.iter().enumerate() {
            let verdict = match eval::eval_expression(&branch.condition, &env) {
                Ok(value) => value.truthy(),
                Err(error) => {
                    // One broken branch must not take the others with it.
                    warn!(
                        service = service.id,
                        branch = index,
                        condition = %branch.condition,
                        %error,
                        "branch condition failed, skipping"
                    );
                    continue;
                }
            };
            if !verdict {
                continue;
            }
            debug!(service = service.id, branch = index, "branch matched");
            sleep_for(branch.delay).await;

            match branch.response_type {
                ResponseKind::Proxy => {
                    let Some(proxy_url) = branch.proxy_url.as_deref() else {
                        return ProcessOutcome::plain(
                            500,
                            "proxy_url is not configured for the matched branch",
                        );
                    };
                    // Path parameters plus everything the pre-script bound,
                    // so `https://big/{n}` can reference a computed value.
                    let mut extended = path_params.clone();
                    extended.extend(eval::user_bindings(&env));
                    let target_url = build_target_url(
                        proxy_url,
                        &request.path,
                        &request.path,
                        &extended,
                        &request.query_string,
                    );
                    return self.forward(&target_url, request).await;
                }
                ResponseKind::Static => {
                    let template = branch.response.clone().unwrap_or_default();
                    return ProcessOutcome {
                        status: branch.status_code,
                        body: eval::expand_template(&template, &env),
                        headers: branch.headers.clone().unwrap_or_default(),
                        proxy_info: None,
                    };
                }
            }
        }
        no_branch()
    }

    /// Forward the buffered request to `target_url` and relay the response.
    async fn forward(&self, target_url: &str, request: &InboundRequest) -> ProcessOutcome {
        let started = Instant::now();

        let method = match Method::from_bytes(request.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                return ProcessOutcome::plain(500, format!("invalid method `{}`", request.method));
            }
        };
        if reqwest::Url::parse(target_url).is_err() {
            return ProcessOutcome::plain(500, format!("invalid proxy target `{target_url}`"));
        }

        let outbound_headers = filter_request_headers(&request.headers);
        let sent_headers: BTreeMap<String, String> = request
            .headers
            .iter()
            .filter(|(name, _)| !EXCLUDED_REQUEST_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        info!(method = %method, target = target_url, "forwarding to upstream");

        let response = self
            .client
            .request(method, target_url)
            .headers(outbound_headers)
            .body(request.body.clone())
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status().as_u16();
                let upstream_headers: BTreeMap<String, String> = response
                    .headers()
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.as_str().to_string(),
                            String::from_utf8_lossy(value.as_bytes()).into_owned(),
                        )
                    })
                    .collect();
                let relayed_headers: BTreeMap<String, String> = upstream_headers
                    .iter()
                    .filter(|(name, _)| !EXCLUDED_RESPONSE_HEADERS.contains(&name.as_str()))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();

                let body = match response.bytes().await {
                    Ok(bytes) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
                    },
                    Err(error) => {
                        let proxy_time = started.elapsed().as_secs_f64();
                        warn!(%error, target = target_url, "reading upstream body failed");
                        return ProcessOutcome {
                            status: 502,
                            body: format!("failed to read upstream response: {error}"),
                            headers: BTreeMap::new(),
                            proxy_info: Some(ProxyInfo {
                                target_url: target_url.to_string(),
                                proxy_headers: sent_headers,
                                proxy_response_status: Some(status),
                                proxy_response_headers: upstream_headers,
                                proxy_response_body: String::new(),
                                proxy_time: round_ms(proxy_time),
                                proxy_error: Some(error.to_string()),
                            }),
                        };
                    }
                };

                let proxy_time = started.elapsed().as_secs_f64();
                info!(status, target = target_url, "upstream answered");
                ProcessOutcome {
                    status,
                    body: body.clone(),
                    headers: relayed_headers,
                    proxy_info: Some(ProxyInfo {
                        target_url: target_url.to_string(),
                        proxy_headers: sent_headers,
                        proxy_response_status: Some(status),
                        proxy_response_headers: upstream_headers,
                        proxy_response_body: body,
                        proxy_time: round_ms(proxy_time),
                        proxy_error: None,
                    }),
                }
            }
            Err(error) => {
                let proxy_time = started.elapsed().as_secs_f64();
                warn!(%error, target = target_url, "upstream request failed");
                ProcessOutcome {
                    status: 502,
                    body: format!("upstream request failed: {error}"),
                    headers: BTreeMap::new(),
                    proxy_info: Some(ProxyInfo {
                        target_url: target_url.to_string(),
                        proxy_headers: sent_headers,
                        proxy_response_status: None,
                        proxy_response_headers: BTreeMap::new(),
                        proxy_response_body: String::new(),
                        proxy_time: round_ms(proxy_time),
                        proxy_error: Some(error.to_string()),
                    }),
                }
            }
        }
    }
}

async fn sleep_for(seconds: f64) {
    if seconds > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    }
}

fn round_ms(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

fn filter_request_headers(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if EXCLUDED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            map.insert(name, value);
        }
    }
    map
}

/// Compose the upstream URL for a proxy call.
///
/// When `proxy_url` carries a `{name}` placeholder for any available
/// parameter the placeholders are substituted and nothing is appended.
/// Otherwise the target is `proxy_url` (trailing `/` stripped) plus the
/// part of `request_path` that extends beyond `mock_path`, which lets a
/// wildcard mock forward sub-resources. The query string is appended last,
/// verbatim.
pub fn build_target_url(
    proxy_url: &str,
    mock_path: &str,
    request_path: &str,
    params: &BTreeMap<String, String>,
    query: &str,
) -> String {
    let has_placeholder = params.keys().any(|name| proxy_url.contains(&format!("{{{name}}}")));

    let mut target = if has_placeholder {
        let mut substituted = proxy_url.to_string();
        for (name, value) in params {
            let placeholder = format!("{{{name}}}");
            if substituted.contains(&placeholder) {
                debug!(param = %name, value = %value, "substituting proxy placeholder");
                substituted = substituted.replace(&placeholder, value);
            }
        }
        substituted
    } else {
        let mut base = proxy_url.trim_end_matches('/').to_string();
        if request_path != mock_path {
            base.push_str(&additional_path(mock_path, request_path));
        }
        base
    };

    if !query.is_empty() {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// The suffix of `request_path` that `mock_path` does not cover, with a
/// leading `/` ensured. Equal paths yield an empty string.
fn additional_path(mock_path: &str, request_path: &str) -> String {
    let mock_path = mock_path.trim_end_matches('/');
    let request_path = request_path.trim_end_matches('/');
    if mock_path == request_path {
        return String::new();
    }
    if let Some(extra) = request_path.strip_prefix(mock_path) {
        if extra.is_empty() {
            String::new()
        } else if extra.starts_with('/') {
            extra.to_string()
        } else {
            format!("/{extra}")
        }
    } else {
        request_path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConditionalResponse, MockServiceCreate};
    use bytes::Bytes;
    use chrono::Utc;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_target_url_placeholder_substitution() {
        let url = build_target_url(
            "https://api/u/{id}",
            "/users/{id}",
            "/users/42",
            &params(&[("id", "42")]),
            "x=1",
        );
        assert_eq!(url, "https://api/u/42?x=1");
    }

    #[test]
    fn test_target_url_no_placeholder_same_path() {
        let url = build_target_url(
            "https://upstream.example/endpoint/",
            "/soap",
            "/soap",
            &BTreeMap::new(),
            "",
        );
        assert_eq!(url, "https://upstream.example/endpoint");
    }

    #[test]
    fn test_target_url_appends_extra_path() {
        let url = build_target_url(
            "https://upstream.example/api",
            "/files",
            "/files/reports/2024",
            &BTreeMap::new(),
            "",
        );
        assert_eq!(url, "https://upstream.example/api/reports/2024");
    }

    #[test]
    fn test_target_url_wildcard_param() {
        // The wildcard capture is an ordinary parameter named `*`.
        let url = build_target_url(
            "https://upstream.example{*}",
            "/files{*}",
            "/files/a/b",
            &params(&[("*", "/a/b")]),
            "",
        );
        assert_eq!(url, "https://upstream.example/a/b");
    }

    #[test]
    fn test_target_url_appends_query() {
        let url = build_target_url(
            "https://upstream.example",
            "/x",
            "/x",
            &BTreeMap::new(),
            "a=1&b=2",
        );
        assert_eq!(url, "https://upstream.example?a=1&b=2");
    }

    #[test]
    fn test_request_header_filtering() {
        let headers = params(&[
            ("content-length", "11"),
            ("host", "mock.local"),
            ("authorization", "Bearer t"),
            ("x-custom", "1"),
        ]);
        let filtered = filter_request_headers(&headers);
        assert!(filtered.get("content-length").is_none());
        assert!(filtered.get("host").is_none());
        assert_eq!(filtered.get("authorization").unwrap(), "Bearer t");
        assert_eq!(filtered.get("x-custom").unwrap(), "1");
    }

    fn inbound(query: &str, body: &str) -> InboundRequest {
        InboundRequest::new("GET", "/x", query, &http::HeaderMap::new(), Bytes::from(body.to_string()))
    }

    fn conditional_service(code: &str, branches: Vec<ConditionalResponse>) -> MockService {
        MockServiceCreate {
            name: "conditional".into(),
            path: "/x".into(),
            methods: vec!["GET".into()],
            strategy: Strategy::Conditional,
            condition_code: Some(code.into()),
            conditional_responses: Some(branches),
            conditional_status_code: 418,
            ..Default::default()
        }
        .into_service(1, Utc::now())
        .unwrap()
    }

    fn static_branch(condition: &str, response: &str, status: u16) -> ConditionalResponse {
        ConditionalResponse {
            condition: condition.into(),
            response_type: ResponseKind::Static,
            response: Some(response.into()),
            proxy_url: None,
            status_code: status,
            headers: None,
            delay: 0.0,
        }
    }

    #[tokio::test]
    async fn test_static_strategy() {
        let service = MockServiceCreate {
            name: "hello".into(),
            path: "/hello".into(),
            methods: vec!["GET".into()],
            strategy: Strategy::Static,
            static_response: Some("hi".into()),
            static_status_code: 201,
            static_headers: Some(params(&[("x-mock", "yes")])),
            ..Default::default()
        }
        .into_service(1, Utc::now())
        .unwrap();

        let processor = StrategyProcessor::new().unwrap();
        let outcome = processor
            .process(&service, &inbound("", ""), &BTreeMap::new())
            .await;
        assert_eq!(outcome.status, 201);
        assert_eq!(outcome.body, "hi");
        assert_eq!(outcome.headers["x-mock"], "yes");
        assert!(outcome.proxy_info.is_none());
    }

    #[tokio::test]
    async fn test_conditional_first_truthy_branch_wins() {
        let service = conditional_service(
            "n = int(query.get('n', '0'))",
            vec![
                static_branch("n > 10", "big", 200),
                static_branch("True", "small", 200),
            ],
        );
        let processor = StrategyProcessor::new().unwrap();

        let outcome = processor
            .process(&service, &inbound("n=20", ""), &BTreeMap::new())
            .await;
        assert_eq!(outcome.body, "big");

        let outcome = processor
            .process(&service, &inbound("n=3", ""), &BTreeMap::new())
            .await;
        assert_eq!(outcome.body, "small");
    }

    #[tokio::test]
    async fn test_conditional_json_template() {
        let service = conditional_service(
            "n = int(query.get('n', '0'))",
            vec![static_branch("True", r#"{"n": n}"#, 200)],
        );
        let processor = StrategyProcessor::new().unwrap();
        let outcome = processor
            .process(&service, &inbound("n=3", ""), &BTreeMap::new())
            .await;
        assert_eq!(outcome.body, r#"{"n":3}"#);
    }

    #[tokio::test]
    async fn test_conditional_no_branch_matched() {
        let service = conditional_service(
            "n = 1",
            vec![static_branch("n > 10", "never", 200)],
        );
        let processor = StrategyProcessor::new().unwrap();
        let outcome = processor
            .process(&service, &inbound("", ""), &BTreeMap::new())
            .await;
        assert_eq!(outcome.status, 418);
        assert_eq!(outcome.body, "No condition matched");
    }

    #[tokio::test]
    async fn test_conditional_script_error_is_500() {
        let service = conditional_service(
            "n = int('not a number')",
            vec![static_branch("True", "ok", 200)],
        );
        let processor = StrategyProcessor::new().unwrap();
        let outcome = processor
            .process(&service, &inbound("", ""), &BTreeMap::new())
            .await;
        assert_eq!(outcome.status, 500);
        assert!(outcome.body.starts_with("condition code failed:"));
    }

    #[tokio::test]
    async fn test_conditional_broken_branch_is_skipped() {
        let service = conditional_service(
            "n = 5",
            vec![
                static_branch("nonsense_name > 1", "never", 200),
                static_branch("n == 5", "ok", 200),
            ],
        );
        let processor = StrategyProcessor::new().unwrap();
        let outcome = processor
            .process(&service, &inbound("", ""), &BTreeMap::new())
            .await;
        assert_eq!(outcome.body, "ok");
    }

    #[tokio::test]
    async fn test_conditional_json_body_in_conditions() {
        let service = conditional_service(
            "user = json.get('user', '')",
            vec![static_branch("user == 'admin'", "welcome", 200)],
        );
        let processor = StrategyProcessor::new().unwrap();
        let outcome = processor
            .process(&service, &inbound("", r#"{"user": "admin"}"#), &BTreeMap::new())
            .await;
        assert_eq!(outcome.body, "welcome");
    }

    #[tokio::test]
    async fn test_proxy_without_url_is_config_error() {
        // Bypass validation deliberately: a service mutated behind the
        // repository's back must still fail softly.
        let mut service = MockServiceCreate {
            name: "p".into(),
            path: "/p".into(),
            methods: vec!["GET".into()],
            strategy: Strategy::Proxy,
            proxy_url: Some("https://upstream.example".into()),
            ..Default::default()
        }
        .into_service(1, Utc::now())
        .unwrap();
        service.proxy_url = None;

        let processor = StrategyProcessor::new().unwrap();
        let outcome = processor
            .process(&service, &inbound("", ""), &BTreeMap::new())
            .await;
        assert_eq!(outcome.status, 500);
        assert_eq!(outcome.body, "proxy_url is not configured");
    }

    #[tokio::test]
    async fn test_forward_invalid_target_is_500() {
        let processor = StrategyProcessor::new().unwrap();
        let outcome = processor.forward("not a url", &inbound("", "")).await;
        assert_eq!(outcome.status, 500);
        assert!(outcome.proxy_info.is_none());
    }

    #[tokio::test]
    async fn test_forward_unreachable_upstream_is_502() {
        let processor = StrategyProcessor::new().unwrap();
        // Port 9 (discard) is refused on loopback everywhere we run tests.
        let outcome = processor
            .forward("http://127.0.0.1:9/x", &inbound("", ""))
            .await;
        assert_eq!(outcome.status, 502);
        let info = outcome.proxy_info.unwrap();
        assert_eq!(info.target_url, "http://127.0.0.1:9/x");
        assert!(info.proxy_error.is_some());
        assert!(info.proxy_response_status.is_none());
    }
}
