//! Error types shared across the gateway core.

use thiserror::Error;

use crate::config::ConfigError;
use crate::eval::EvalError;
use crate::model::ValidationError;
use crate::path::TemplateError;

/// Top-level error for gateway operations.
///
/// Strategy execution never surfaces through this type: the processor folds
/// its failures into the client response (502 for unreachable upstreams, 500
/// for configuration and evaluation errors) so a bad mock can not take the
/// request handler down.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A path template failed to compile.
    #[error("invalid path template: {0}")]
    Template(#[from] TemplateError),

    /// A mock service definition failed validation.
    #[error("invalid mock service: {0}")]
    Validation(#[from] ValidationError),

    /// Startup configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Writing or reading the request log failed.
    #[error("request log I/O failed: {0}")]
    Persistence(#[from] std::io::Error),

    /// A conditional script or expression failed outside of request scope.
    #[error("evaluation failed: {0}")]
    Eval(#[from] EvalError),

    /// The upstream HTTP client could not be constructed.
    #[error("http client initialization failed: {0}")]
    Client(#[from] reqwest::Error),

    /// Loading or storing the service snapshot file failed.
    #[error("service store error: {0}")]
    Store(String),
}
