//! A framework-neutral view of one inbound request.

use std::borrow::Cow;
use std::collections::BTreeMap;

use bytes::Bytes;
use http::HeaderMap;

/// Everything the router, the processor and the log record need from one
/// request, captured exactly once.
///
/// The body is buffered into [`Bytes`] by the frontend and reused from here:
/// byte-for-byte for proxy forwarding, as a lossy string view for the
/// conditional evaluator, and again for the log record. Header names are
/// lower-cased, matching what the evaluator context and the header
/// exclusion sets expect.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub url: String,
    pub query_string: String,
    pub query_params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl InboundRequest {
    /// Build the view from already-parsed parts.
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        query_string: impl Into<String>,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Self {
        let method = method.into();
        let path = path.into();
        let query_string = query_string.into();
        let header_map: BTreeMap<String, String> = headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let query_params = parse_query(&query_string);
        let url = {
            let host = header_map.get("host").map(String::as_str).unwrap_or("localhost");
            if query_string.is_empty() {
                format!("http://{host}{path}")
            } else {
                format!("http://{host}{path}?{query_string}")
            }
        };
        Self {
            method,
            path,
            url,
            query_string,
            query_params,
            headers: header_map,
            body,
        }
    }

    /// The body as text, invalid UTF-8 replaced.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Decode an `a=1&b=2` query string into a map. Later duplicates win.
pub fn parse_query(query: &str) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}
