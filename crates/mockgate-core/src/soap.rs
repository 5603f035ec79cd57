//! SOAP request inspection: method-name extraction and service matching.
//!
//! SOAP endpoints typically share one URL across many operations, so the
//! router needs the operation name to pick a service. The name hides in one
//! of three places, probed in priority order: the `action=` parameter of
//! `Content-Type`, the `SOAPAction` header, and finally the first child of
//! the envelope `Body`.

use std::sync::LazyLock;

use http::HeaderMap;
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;

static ACTION_QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)action=["']([^"']+)["']"#).expect("valid regex")
});
static ACTION_BARE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)action=([^;\s]+)").expect("valid regex"));

// Fallbacks for envelopes too mangled for the XML parser.
static BODY_CHILD_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?is)<soap:Body[^>]*>\s*<([^:>\s/]+)",
        r"(?is)<soap12:Body[^>]*>\s*<([^:>\s/]+)",
        r"(?is)<Body[^>]*>\s*<([^:>\s/]+)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});
static ANY_BODY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<[^>]*Body[^>]*>").expect("valid regex"));
static NEXT_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^:>\s/]+)[^>]*>").expect("valid regex"));
static REQUEST_ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<([^:>\s/]+Request)[^>]*>").expect("valid regex"));

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn strip_quotes(value: &str) -> &str {
    value.trim().trim_matches(|c| c == '"' || c == '\'').trim()
}

/// Reduce an action value to a bare method name.
///
/// Drops surrounding quotes and whitespace, the query string and the
/// fragment marker, leaving only the last path-ish component.
fn normalize(name: &str) -> String {
    let mut cleaned = strip_quotes(name).to_string();
    if let Some((head, _)) = cleaned.split_once('?') {
        cleaned = head.to_string();
    }
    if let Some((_, tail)) = cleaned.rsplit_once('#') {
        cleaned = tail.to_string();
    }
    cleaned.trim().to_string()
}

/// Pick the method name out of an action value such as
/// `urn:ns#getUser`, `http://example.com/svc/getUser` or `ns:getUser`.
fn method_from_action(action: &str) -> Option<String> {
    let action = strip_quotes(action);
    if action.is_empty() {
        return None;
    }
    if let Some((_, tail)) = action.rsplit_once('#') {
        let tail = tail.trim();
        if !tail.is_empty() {
            return Some(normalize(tail));
        }
    }
    if let Some((_, tail)) = action.rsplit_once('/') {
        let tail = tail.trim();
        if !tail.is_empty() && !tail.to_ascii_lowercase().ends_with(".wsdl") {
            return Some(normalize(tail));
        }
    }
    if let Some((_, tail)) = action.rsplit_once(':') {
        let tail = tail.trim();
        if !tail.is_empty() && tail != "urn" {
            return Some(normalize(tail));
        }
    }
    Some(normalize(action))
}

fn method_from_headers(headers: &HeaderMap) -> Option<String> {
    // The action parameter of Content-Type wins over SOAPAction.
    if let Some(content_type) = header_str(headers, "content-type")
        && content_type.to_ascii_lowercase().contains("action=")
    {
        let captured = ACTION_QUOTED
            .captures(content_type)
            .or_else(|| ACTION_BARE.captures(content_type))
            .and_then(|c| c.get(1));
        if let Some(action) = captured
            && let Some(method) = method_from_action(action.as_str())
        {
            return Some(method);
        }
    }

    let action = strip_quotes(header_str(headers, "soapaction").unwrap_or(""));
    if !action.is_empty() {
        return method_from_action(action);
    }
    None
}

/// First child element of the envelope `Body`, by local name.
fn first_body_child(body: &str) -> Option<String> {
    let mut reader = Reader::from_str(body);
    let mut in_body = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) | Ok(Event::Empty(element)) => {
                let local = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                if in_body {
                    return Some(local);
                }
                if local.eq_ignore_ascii_case("body") {
                    in_body = true;
                }
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn method_from_body(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    if let Some(name) = first_body_child(body) {
        return Some(name);
    }
    for pattern in BODY_CHILD_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(body) {
            return Some(captures[1].to_string());
        }
    }
    if let Some(tag) = ANY_BODY_TAG.find(body) {
        let remaining = &body[tag.end()..];
        if let Some(captures) = NEXT_ELEMENT.captures(remaining) {
            return Some(captures[1].to_string());
        }
    }
    REQUEST_ELEMENT.captures(body).map(|c| c[1].to_string())
}

/// Extract the SOAP method name for a request, if any.
///
/// Priority: `Content-Type` `action=` parameter, then `SOAPAction`, then
/// the first child of `Body` (XML parse with a regex fallback for malformed
/// envelopes). Results of length one or less are treated as absent.
pub fn extract_method(headers: &HeaderMap, body: Option<&str>) -> Option<String> {
    let candidates = [
        method_from_headers(headers),
        body.and_then(method_from_body).map(|m| normalize(&m)),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|method| method.len() > 1)
}

/// Heuristic: does this request look like SOAP at all?
pub fn is_soap(headers: &HeaderMap, body: Option<&str>) -> bool {
    const HEADER_INDICATORS: [&str; 5] = [
        "application/soap+xml",
        "text/xml",
        "application/xml",
        "soapaction",
        "action=",
    ];
    let content_type = header_str(headers, "content-type").unwrap_or("").to_ascii_lowercase();
    let soap_action = header_str(headers, "soapaction").unwrap_or("").to_ascii_lowercase();
    if HEADER_INDICATORS
        .iter()
        .any(|i| content_type.contains(i) || soap_action.contains(i))
        || headers.contains_key("soapaction")
    {
        return true;
    }

    if let Some(body) = body {
        const BODY_INDICATORS: [&str; 6] = [
            "soap:envelope",
            "soap:body",
            "soap12:envelope",
            "soap12:body",
            "xmlns:soap",
            "xmlns:soap12",
        ];
        let lowered = body.to_ascii_lowercase();
        return BODY_INDICATORS.iter().any(|i| lowered.contains(i));
    }
    false
}

/// Does a SOAP method name belong to a service, by naming convention?
///
/// Applied case-insensitively, any hit wins: substring, `_method` suffix,
/// `method_` prefix, the same with a `.` separator or none at all, the
/// reverse substring, and finally any shared `[._-]`-separated component
/// longer than two characters.
pub fn service_matches_method(service_name: &str, soap_method: &str) -> bool {
    let service = service_name.trim().to_ascii_lowercase();
    let method = soap_method.trim().to_ascii_lowercase();
    if service.is_empty() || method.is_empty() {
        return false;
    }

    if service.contains(&method)
        || service.ends_with(&format!("_{method}"))
        || service.starts_with(&format!("{method}_"))
        || service.ends_with(&format!(".{method}"))
        || service.starts_with(&format!("{method}."))
        || service.ends_with(&method)
        || service.starts_with(&method)
        || method.contains(&service)
    {
        return true;
    }

    let split = |s: &str| -> Vec<String> {
        s.split(['.', '_', '-'])
            .filter(|p| p.len() > 2)
            .map(str::to_string)
            .collect()
    };
    let service_parts = split(&service);
    let method_parts = split(&method);
    service_parts.iter().any(|sp| {
        method_parts
            .iter()
            .any(|mp| sp == mp || sp.contains(mp.as_str()) || mp.contains(sp.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    const ENVELOPE: &str = r#"<?xml version="1.0"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
  <soapenv:Header/>
  <soapenv:Body>
    <ns:getEpicrisisInfoByPatient xmlns:ns="urn:clinic">
      <patientId>77</patientId>
    </ns:getEpicrisisInfoByPatient>
  </soapenv:Body>
</soapenv:Envelope>"#;

    #[test]
    fn test_method_from_content_type_action() {
        let h = headers(&[(
            "content-type",
            r#"application/soap+xml; charset=utf-8; action="urn:clinic#getUser""#,
        )]);
        assert_eq!(extract_method(&h, None).unwrap(), "getUser");
    }

    #[test]
    fn test_method_from_unquoted_action() {
        let h = headers(&[("content-type", "application/soap+xml; action=urn:ns:lookupOrder; charset=utf-8")]);
        assert_eq!(extract_method(&h, None).unwrap(), "lookupOrder");
    }

    #[test]
    fn test_content_type_action_beats_soapaction() {
        let h = headers(&[
            ("content-type", r#"application/soap+xml; action="urn:First""#),
            ("soapaction", "urn:Second"),
        ]);
        assert_eq!(extract_method(&h, None).unwrap(), "First");
    }

    #[test]
    fn test_soapaction_formats() {
        for (raw, expected) in [
            ("\"urn:#getEpicrisisInfoByPatient\"", "getEpicrisisInfoByPatient"),
            ("http://example.com/service#method", "method"),
            ("urn:someNamespace:methodName", "methodName"),
            ("/service/methodName", "methodName"),
            ("plainMethod", "plainMethod"),
        ] {
            let h = headers(&[("soapaction", raw)]);
            assert_eq!(extract_method(&h, None).unwrap(), expected, "for {raw}");
        }
    }

    #[test]
    fn test_wsdl_tail_skips_slash_rule() {
        let h = headers(&[("soapaction", "http://example.com/calc.wsdl")]);
        // `calc.wsdl` is not a method name; the `/` rule passes and the `:`
        // rule takes over.
        assert_eq!(extract_method(&h, None).unwrap(), "//example.com/calc.wsdl");
    }

    #[test]
    fn test_empty_soapaction_falls_back_to_body() {
        let h = headers(&[("soapaction", "\"\""), ("content-type", "text/xml")]);
        assert_eq!(extract_method(&h, Some(ENVELOPE)).unwrap(), "getEpicrisisInfoByPatient");
    }

    #[test]
    fn test_body_first_child_of_empty_body() {
        let h = HeaderMap::new();
        let body = r#"<soap:Envelope xmlns:soap="x"><soap:Body></soap:Body></soap:Envelope>"#;
        assert_eq!(extract_method(&h, Some(body)), None);
    }

    #[test]
    fn test_malformed_xml_regex_fallback() {
        let h = HeaderMap::new();
        let body = "<soap:Envelope><soap:Body><Sub><a>1</a>"; // never closed
        assert_eq!(extract_method(&h, Some(body)).unwrap(), "Sub");
    }

    #[test]
    fn test_short_results_are_absent() {
        let h = headers(&[("soapaction", "x")]);
        assert_eq!(extract_method(&h, None), None);
    }

    #[test]
    fn test_is_soap_by_headers() {
        assert!(is_soap(&headers(&[("content-type", "text/xml")]), None));
        assert!(is_soap(&headers(&[("soapaction", "urn:x")]), None));
        assert!(!is_soap(&headers(&[("content-type", "application/json")]), None));
    }

    #[test]
    fn test_is_soap_by_body() {
        let h = headers(&[("content-type", "application/octet-stream")]);
        assert!(is_soap(&h, Some(ENVELOPE)));
        assert!(!is_soap(&h, Some("{\"not\": \"xml\"}")));
    }

    #[test]
    fn test_name_matching_rules() {
        assert!(service_matches_method("Calc_Add", "Add"));
        assert!(service_matches_method("Calc.Add", "add"));
        assert!(service_matches_method("AddCalc", "Add"));
        assert!(service_matches_method("add", "AddUserRequest"));
        assert!(service_matches_method("user-service", "getUserInfo"));
        assert!(!service_matches_method("Calc_Add", "Sub"));
        assert!(!service_matches_method("", "Add"));
    }

    #[test]
    fn test_name_matching_shared_component() {
        // `epicrisis` is shared between `emias.epicrisis` and
        // `getEpicrisisInfo` once split on separators and lower-cased.
        assert!(service_matches_method("emias_epicrisis", "epicrisis"));
        assert!(!service_matches_method("ab_cd", "xy"));
    }
}
