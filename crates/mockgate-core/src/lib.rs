//! Core engine of the mockgate gateway.
//!
//! Everything that does not touch an HTTP framework lives here: the mock
//! service model and repository, path templates, SOAP request inspection,
//! the request router, the strategy processor (static, proxy, conditional),
//! the request-log pipeline with rotation, and the live subscription hub.
//!
//! The frontend crate (`mockgate`) wires these pieces into axum handlers;
//! this crate stays framework agnostic so the engine can be driven directly
//! from tests.
//!
//! # Request flow
//!
//! ```ignore
//! let snapshot = repo.list_active(); // templates precompiled per mutation
//! if let Some((service, params)) = router::route(&snapshot, path, method, &headers, &body) {
//!     let outcome = processor.process(&service, &inbound, &params).await;
//!     writer.append(draft_from(&inbound, &service, &outcome))?;
//! }
//! ```

pub mod config;
pub mod error;
pub mod eval;
pub mod hub;
pub mod logbook;
pub mod model;
pub mod path;
pub mod processor;
pub mod repo;
pub mod request;
pub mod router;
pub mod soap;

pub use config::{LogSettings, RotationSpec};
pub use error::GatewayError;
pub use hub::LogHub;
pub use logbook::{LogDraft, LogReader, LogWriter, ProxyInfo, RequestLog};
pub use model::{ConditionalResponse, MockService, ResponseKind, ServiceType, Strategy};
pub use processor::{ProcessOutcome, StrategyProcessor};
pub use repo::{ActiveService, ServiceRepository};
pub use request::InboundRequest;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
