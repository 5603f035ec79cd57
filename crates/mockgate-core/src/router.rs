//! Request routing: pick the mock service that should answer a request.

use std::collections::BTreeMap;
use std::sync::Arc;

use http::HeaderMap;
use tracing::debug;

use crate::model::{MockService, ServiceType};
use crate::repo::ActiveService;
use crate::soap;

/// A routing decision: the selected service plus the parameters its path
/// template captured.
pub type RouteMatch = (Arc<MockService>, BTreeMap<String, String>);

/// Find the service responsible for `(path, method, headers, body)`.
///
/// Snapshot entries are scanned in registration order; their templates
/// were compiled when the snapshot was built, so the hot path only runs
/// the match. A service is a candidate when its method set contains
/// `method` (case-insensitive) and its template matches `path`. REST
/// candidates win immediately. SOAP candidates are further discriminated
/// by the SOAP method name: when one is present it must match the service
/// name, otherwise the first such service is remembered as a fallback for
/// envelopes that carry no usable signal. Deterministic for a fixed
/// snapshot.
pub fn route(
    services: &[ActiveService],
    path: &str,
    method: &str,
    headers: &HeaderMap,
    body: &str,
) -> Option<RouteMatch> {
    let mut soap_fallback: Option<RouteMatch> = None;

    for entry in services {
        let service = &entry.service;
        if !service.allows_method(method) {
            continue;
        }
        let Some(params) = entry.template.capture(path) else {
            continue;
        };

        match service.service_type {
            ServiceType::Rest => return Some((service.clone(), params)),
            ServiceType::Soap => {
                match soap::extract_method(headers, Some(body)) {
                    Some(soap_method) => {
                        if soap::service_matches_method(&service.name, &soap_method) {
                            debug!(service = service.id, %soap_method, "SOAP method matched");
                            return Some((service.clone(), params));
                        }
                        // A SOAP method was present but names another
                        // service; keep scanning.
                    }
                    None => {
                        if soap_fallback.is_none() {
                            soap_fallback = Some((service.clone(), params));
                        }
                    }
                }
            }
        }
    }

    soap_fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MockServiceCreate, Strategy};
    use chrono::Utc;
    use http::HeaderValue;

    fn service(id: u64, name: &str, path: &str, methods: &[&str], kind: ServiceType) -> ActiveService {
        let create = MockServiceCreate {
            name: name.into(),
            path: path.into(),
            methods: methods.iter().map(|m| m.to_string()).collect(),
            strategy: Strategy::Static,
            service_type: kind,
            static_response: Some("ok".into()),
            ..Default::default()
        };
        ActiveService::new(Arc::new(create.into_service(id, Utc::now()).unwrap())).unwrap()
    }

    fn soap_headers(action: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/xml"));
        if !action.is_empty() {
            headers.insert("soapaction", HeaderValue::from_str(action).unwrap());
        }
        headers
    }

    #[test]
    fn test_rest_first_match_wins() {
        let services = vec![
            service(1, "a", "/hello", &["GET"], ServiceType::Rest),
            service(2, "b", "/hello", &["GET"], ServiceType::Rest),
        ];
        let (hit, params) = route(&services, "/hello", "GET", &HeaderMap::new(), "").unwrap();
        assert_eq!(hit.id, 1);
        assert!(params.is_empty());
    }

    #[test]
    fn test_method_filter_is_case_insensitive() {
        let services = vec![service(1, "a", "/hello", &["POST"], ServiceType::Rest)];
        assert!(route(&services, "/hello", "post", &HeaderMap::new(), "").is_some());
        assert!(route(&services, "/hello", "GET", &HeaderMap::new(), "").is_none());
    }

    #[test]
    fn test_template_params_extracted() {
        let services = vec![service(1, "users", "/users/{id}", &["GET"], ServiceType::Rest)];
        let (_, params) = route(&services, "/users/42", "GET", &HeaderMap::new(), "").unwrap();
        assert_eq!(params["id"], "42");
    }

    #[test]
    fn test_soap_disambiguation_by_action() {
        let services = vec![
            service(1, "Calc_Add", "/soap", &["POST"], ServiceType::Soap),
            service(2, "Calc_Sub", "/soap", &["POST"], ServiceType::Soap),
        ];
        let (hit, _) = route(&services, "/soap", "POST", &soap_headers("urn:Add"), "").unwrap();
        assert_eq!(hit.id, 1);
        let (hit, _) = route(&services, "/soap", "POST", &soap_headers("urn:Sub"), "").unwrap();
        assert_eq!(hit.id, 2);
    }

    #[test]
    fn test_soap_disambiguation_by_body() {
        let services = vec![
            service(1, "Calc_Add", "/soap", &["POST"], ServiceType::Soap),
            service(2, "Calc_Sub", "/soap", &["POST"], ServiceType::Soap),
        ];
        let body = r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><Sub/></soap:Body></soap:Envelope>"#;
        let (hit, _) = route(&services, "/soap", "POST", &soap_headers(""), body).unwrap();
        assert_eq!(hit.id, 2);
    }

    #[test]
    fn test_soap_fallback_is_first_registered() {
        let services = vec![
            service(1, "Calc_Add", "/soap", &["POST"], ServiceType::Soap),
            service(2, "Calc_Sub", "/soap", &["POST"], ServiceType::Soap),
        ];
        // No SOAPAction, no parseable body: the first candidate answers.
        let (hit, _) = route(&services, "/soap", "POST", &soap_headers(""), "").unwrap();
        assert_eq!(hit.id, 1);
    }

    #[test]
    fn test_soap_with_foreign_method_misses() {
        let services = vec![service(1, "Calc_Add", "/soap", &["POST"], ServiceType::Soap)];
        assert!(route(&services, "/soap", "POST", &soap_headers("urn:Multiply"), "").is_none());
    }

    #[test]
    fn test_no_match() {
        let services = vec![service(1, "a", "/hello", &["GET"], ServiceType::Rest)];
        assert!(route(&services, "/other", "GET", &HeaderMap::new(), "").is_none());
    }
}
