//! The durable request-log pipeline.
//!
//! Every served request, misses and failures included, becomes exactly one
//! JSON line in `requests.log`. The [`LogWriter`] owns the active file and
//! its rotation policy; the [`LogReader`] scans the active file plus the
//! archives for queries. After a record hits disk the writer hands it to
//! the subscription hub over a bounded channel, which keeps the hub a leaf
//! of the component graph.

mod reader;
mod writer;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use reader::{LogFileInfo, LogReader};
pub use writer::{LogDraft, LogWriter};

/// Base name of the active request log file.
pub const LOG_FILE_NAME: &str = "requests.log";

/// Telemetry of one upstream proxy call, attached to the log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub target_url: String,
    pub proxy_headers: BTreeMap<String, String>,
    pub proxy_response_status: Option<u16>,
    pub proxy_response_headers: BTreeMap<String, String>,
    pub proxy_response_body: String,
    pub proxy_time: f64,
    pub proxy_error: Option<String>,
}

/// One served request, as persisted and as streamed to subscribers.
///
/// `id` is assigned at write time, formatted `YYYYMMDD_HHMMSS_ffffff`, and
/// strictly monotonic within a process. `timestamp` is local ISO-8601 with
/// microsecond precision, which keeps string ordering and time ordering in
/// agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: String,
    pub mock_service_id: Option<u64>,
    pub mock_service_name: Option<String>,
    pub path: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub body: String,
    pub response_status: u16,
    pub response_body: String,
    pub response_headers: BTreeMap<String, String>,
    pub processing_time: f64,
    pub timestamp: String,
    #[serde(default)]
    pub proxy_info: Option<ProxyInfo>,
}
