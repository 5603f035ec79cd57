//! Mock service definitions and their validation rules.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::path::{PathTemplate, TemplateError};

/// HTTP methods a mock service may bind.
pub const ALLOWED_METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];

/// How a matched service produces its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Static,
    Proxy,
    Conditional,
}

/// Routing flavor of a service. SOAP services share one URL across many
/// operations and are disambiguated by the SOAP method name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[default]
    Rest,
    Soap,
}

/// Response flavor of a single conditional branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    #[default]
    Static,
    Proxy,
}

fn default_status_code() -> u16 {
    200
}

/// One branch of a conditional service: an expression plus the response
/// returned when it is the first to evaluate truthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalResponse {
    pub condition: String,
    #[serde(default)]
    pub response_type: ResponseKind,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub delay: f64,
}

/// A registered mock service: a path template and method set bound to a
/// response strategy. Field names match the wire format of the management
/// API and the service snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockService {
    pub id: u64,
    pub name: String,
    pub path: String,
    pub methods: Vec<String>,
    pub strategy: Strategy,
    #[serde(default)]
    pub service_type: ServiceType,

    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub proxy_delay: f64,

    #[serde(default)]
    pub static_response: Option<String>,
    #[serde(default = "default_status_code")]
    pub static_status_code: u16,
    #[serde(default)]
    pub static_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub static_delay: f64,

    #[serde(default)]
    pub condition_code: Option<String>,
    #[serde(default)]
    pub conditional_responses: Option<Vec<ConditionalResponse>>,
    #[serde(default)]
    pub conditional_delay: f64,
    #[serde(default = "default_status_code")]
    pub conditional_status_code: u16,
    #[serde(default)]
    pub conditional_headers: Option<BTreeMap<String, String>>,

    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl MockService {
    /// True when `method` (any case) is in this service's method set.
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Payload for creating a service through the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockServiceCreate {
    pub name: String,
    pub path: String,
    pub methods: Vec<String>,
    pub strategy: Strategy,
    #[serde(default)]
    pub service_type: ServiceType,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub proxy_delay: f64,
    #[serde(default)]
    pub static_response: Option<String>,
    #[serde(default = "default_status_code")]
    pub static_status_code: u16,
    #[serde(default)]
    pub static_headers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub static_delay: f64,
    #[serde(default)]
    pub condition_code: Option<String>,
    #[serde(default)]
    pub conditional_responses: Option<Vec<ConditionalResponse>>,
    #[serde(default)]
    pub conditional_delay: f64,
    #[serde(default = "default_status_code")]
    pub conditional_status_code: u16,
    #[serde(default)]
    pub conditional_headers: Option<BTreeMap<String, String>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Static
    }
}

impl Default for MockServiceCreate {
    fn default() -> Self {
        Self {
            name: String::new(),
            path: String::new(),
            methods: Vec::new(),
            strategy: Strategy::default(),
            service_type: ServiceType::default(),
            proxy_url: None,
            proxy_delay: 0.0,
            static_response: None,
            static_status_code: default_status_code(),
            static_headers: None,
            static_delay: 0.0,
            condition_code: None,
            conditional_responses: None,
            conditional_delay: 0.0,
            conditional_status_code: default_status_code(),
            conditional_headers: None,
            is_active: true,
        }
    }
}

/// Partial update: only supplied fields change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockServiceUpdate {
    pub name: Option<String>,
    pub path: Option<String>,
    pub methods: Option<Vec<String>>,
    pub strategy: Option<Strategy>,
    pub service_type: Option<ServiceType>,
    pub proxy_url: Option<String>,
    pub proxy_delay: Option<f64>,
    pub static_response: Option<String>,
    pub static_status_code: Option<u16>,
    pub static_headers: Option<BTreeMap<String, String>>,
    pub static_delay: Option<f64>,
    pub condition_code: Option<String>,
    pub conditional_responses: Option<Vec<ConditionalResponse>>,
    pub conditional_delay: Option<f64>,
    pub conditional_status_code: Option<u16>,
    pub conditional_headers: Option<BTreeMap<String, String>>,
    pub is_active: Option<bool>,
}

/// Why a service definition was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("invalid path template: {0}")]
    Template(#[from] TemplateError),
    #[error("name must not be empty")]
    EmptyName,
    #[error("at least one HTTP method is required")]
    NoMethods,
    #[error("unsupported HTTP method `{0}`")]
    UnsupportedMethod(String),
    #[error("status code {0} is outside 100..=599")]
    InvalidStatusCode(u16),
    #[error("delay must not be negative")]
    NegativeDelay,
    #[error("static strategy requires `static_response`")]
    MissingStaticResponse,
    #[error("proxy strategy requires `proxy_url`")]
    MissingProxyUrl,
    #[error("`{0}` is not an absolute http(s) URL")]
    InvalidProxyUrl(String),
    #[error("conditional strategy requires `condition_code`")]
    MissingConditionCode,
    #[error("conditional strategy requires at least one response branch")]
    MissingConditionalResponses,
    #[error("branch {0}: `condition` must not be empty")]
    EmptyBranchCondition(usize),
    #[error("branch {0}: static branches require `response`")]
    MissingBranchResponse(usize),
    #[error("branch {0}: proxy branches require `proxy_url`")]
    MissingBranchProxyUrl(usize),
}

fn check_status(code: u16) -> Result<(), ValidationError> {
    if (100..=599).contains(&code) {
        Ok(())
    } else {
        Err(ValidationError::InvalidStatusCode(code))
    }
}

fn check_delay(delay: f64) -> Result<(), ValidationError> {
    if delay < 0.0 || delay.is_nan() {
        Err(ValidationError::NegativeDelay)
    } else {
        Ok(())
    }
}

fn check_proxy_url(raw: &str) -> Result<(), ValidationError> {
    match url::Url::parse(raw) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ValidationError::InvalidProxyUrl(raw.to_string())),
    }
}

/// Normalize and validate a service in place.
///
/// Methods are upper-cased, proxy-branch headers are dropped (the upstream
/// response dictates them) and every strategy-scoped requirement is checked.
///
/// # Errors
///
/// Returns the first [`ValidationError`] encountered.
pub fn validate(service: &mut MockService) -> Result<(), ValidationError> {
    if service.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    PathTemplate::compile(&service.path)?;

    if service.methods.is_empty() {
        return Err(ValidationError::NoMethods);
    }
    let mut methods = Vec::with_capacity(service.methods.len());
    for method in &service.methods {
        let upper = method.trim().to_ascii_uppercase();
        if !ALLOWED_METHODS.contains(&upper.as_str()) {
            return Err(ValidationError::UnsupportedMethod(method.clone()));
        }
        if !methods.contains(&upper) {
            methods.push(upper);
        }
    }
    service.methods = methods;

    check_status(service.static_status_code)?;
    check_status(service.conditional_status_code)?;
    check_delay(service.proxy_delay)?;
    check_delay(service.static_delay)?;
    check_delay(service.conditional_delay)?;

    match service.strategy {
        Strategy::Static => {
            if service.static_response.is_none() {
                return Err(ValidationError::MissingStaticResponse);
            }
        }
        Strategy::Proxy => {
            let raw = service
                .proxy_url
                .as_deref()
                .ok_or(ValidationError::MissingProxyUrl)?;
            check_proxy_url(raw)?;
        }
        Strategy::Conditional => {
            if service.condition_code.as_deref().is_none_or(|c| c.trim().is_empty()) {
                return Err(ValidationError::MissingConditionCode);
            }
            let branches = service
                .conditional_responses
                .as_mut()
                .filter(|b| !b.is_empty())
                .ok_or(ValidationError::MissingConditionalResponses)?;
            for (index, branch) in branches.iter_mut().enumerate() {
                if branch.condition.trim().is_empty() {
                    return Err(ValidationError::EmptyBranchCondition(index));
                }
                check_status(branch.status_code)?;
                check_delay(branch.delay)?;
                match branch.response_type {
                    ResponseKind::Static => {
                        if branch.response.is_none() {
                            return Err(ValidationError::MissingBranchResponse(index));
                        }
                    }
                    ResponseKind::Proxy => {
                        let raw = branch
                            .proxy_url
                            .as_deref()
                            .ok_or(ValidationError::MissingBranchProxyUrl(index))?;
                        check_proxy_url(raw)?;
                        if branch.headers.take().is_some() {
                            tracing::warn!(
                                branch = index,
                                "headers on a proxy branch are ignored, the upstream response supplies them"
                            );
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

impl MockServiceCreate {
    /// Materialize a validated [`MockService`] with the given id.
    pub fn into_service(self, id: u64, now: DateTime<Utc>) -> Result<MockService, ValidationError> {
        let mut service = MockService {
            id,
            name: self.name,
            path: self.path,
            methods: self.methods,
            strategy: self.strategy,
            service_type: self.service_type,
            proxy_url: self.proxy_url,
            proxy_delay: self.proxy_delay,
            static_response: self.static_response,
            static_status_code: self.static_status_code,
            static_headers: self.static_headers,
            static_delay: self.static_delay,
            condition_code: self.condition_code,
            conditional_responses: self.conditional_responses,
            conditional_delay: self.conditional_delay,
            conditional_status_code: self.conditional_status_code,
            conditional_headers: self.conditional_headers,
            is_active: self.is_active,
            created_at: now,
            updated_at: None,
        };
        validate(&mut service)?;
        Ok(service)
    }
}

impl MockServiceUpdate {
    /// Apply this patch to `service` and re-validate the result.
    pub fn apply(self, service: &MockService, now: DateTime<Utc>) -> Result<MockService, ValidationError> {
        let mut updated = service.clone();
        if let Some(name) = self.name {
            updated.name = name;
        }
        if let Some(path) = self.path {
            updated.path = path;
        }
        if let Some(methods) = self.methods {
            updated.methods = methods;
        }
        if let Some(strategy) = self.strategy {
            updated.strategy = strategy;
        }
        if let Some(service_type) = self.service_type {
            updated.service_type = service_type;
        }
        if let Some(proxy_url) = self.proxy_url {
            updated.proxy_url = Some(proxy_url);
        }
        if let Some(proxy_delay) = self.proxy_delay {
            updated.proxy_delay = proxy_delay;
        }
        if let Some(static_response) = self.static_response {
            updated.static_response = Some(static_response);
        }
        if let Some(code) = self.static_status_code {
            updated.static_status_code = code;
        }
        if let Some(headers) = self.static_headers {
            updated.static_headers = Some(headers);
        }
        if let Some(delay) = self.static_delay {
            updated.static_delay = delay;
        }
        if let Some(code) = self.condition_code {
            updated.condition_code = Some(code);
        }
        if let Some(branches) = self.conditional_responses {
            updated.conditional_responses = Some(branches);
        }
        if let Some(delay) = self.conditional_delay {
            updated.conditional_delay = delay;
        }
        if let Some(code) = self.conditional_status_code {
            updated.conditional_status_code = code;
        }
        if let Some(headers) = self.conditional_headers {
            updated.conditional_headers = Some(headers);
        }
        if let Some(active) = self.is_active {
            updated.is_active = active;
        }
        updated.updated_at = Some(now);
        validate(&mut updated)?;
        Ok(updated)
    }
}
