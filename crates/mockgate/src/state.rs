//! Shared application state handed to every handler.

use std::sync::Arc;

use mockgate_core::{LogHub, LogReader, LogWriter, ServiceRepository, StrategyProcessor};

/// One `Arc` per engine component; cloning the state is cheap and every
/// handler sees the same registries, writer and hub.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<ServiceRepository>,
    pub processor: Arc<StrategyProcessor>,
    pub writer: Arc<LogWriter>,
    pub reader: Arc<LogReader>,
    pub hub: Arc<LogHub>,
}
