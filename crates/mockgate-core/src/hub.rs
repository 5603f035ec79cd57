//! Live fan-out of log records to persistent subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Local;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::logbook::RequestLog;

/// One registered connection's sending half.
///
/// Implementations wrap whatever transport carries frames to the client; a
/// failed delivery means the connection is gone and gets unregistered.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn deliver(&self, frame: &str) -> Result<(), String>;
}

/// Handle identifying a registered connection.
pub type ConnectionId = u64;

#[derive(Clone)]
struct Connection {
    id: ConnectionId,
    subscriber: Arc<dyn Subscriber>,
}

/// Fan-out registries for live log events.
///
/// A connection subscribes either globally or to one service id. Publishing
/// serializes the event frame once, snapshots the matching registry under
/// its mutex, then delivers outside the lock, concurrently and best-effort.
/// Connections whose delivery fails are dropped on the spot.
pub struct LogHub {
    next_id: AtomicU64,
    global: Mutex<Vec<Connection>>,
    by_service: Mutex<HashMap<u64, Vec<Connection>>>,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LogHub {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            global: Mutex::new(Vec::new()),
            by_service: Mutex::new(HashMap::new()),
        }
    }

    /// Create the hub plus the channel the log writer feeds.
    ///
    /// A background task drains the channel and publishes each record, so
    /// the writer never waits on slow subscribers. Events keep their
    /// channel order, which is the file order.
    pub fn spawn(capacity: usize) -> (Arc<Self>, mpsc::Sender<RequestLog>) {
        let (tx, mut rx) = mpsc::channel::<RequestLog>(capacity);
        let hub = Arc::new(Self::new());
        let worker = hub.clone();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                worker.publish(&record).await;
            }
        });
        (hub, tx)
    }

    /// Register a connection, globally or filtered to `service_id`.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>, service_id: Option<u64>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Connection { id, subscriber };
        match service_id {
            None => {
                self.global.lock().expect("hub mutex poisoned").push(connection);
            }
            Some(service_id) => {
                self.by_service
                    .lock()
                    .expect("hub mutex poisoned")
                    .entry(service_id)
                    .or_default()
                    .push(connection);
            }
        }
        debug!(connection = id, ?service_id, "subscriber registered");
        id
    }

    /// Drop a connection. Removing the last subscriber of a service also
    /// removes the service entry.
    pub fn unsubscribe(&self, id: ConnectionId, service_id: Option<u64>) {
        match service_id {
            None => {
                self.global
                    .lock()
                    .expect("hub mutex poisoned")
                    .retain(|c| c.id != id);
            }
            Some(service_id) => {
                let mut map = self.by_service.lock().expect("hub mutex poisoned");
                if let Some(connections) = map.get_mut(&service_id) {
                    connections.retain(|c| c.id != id);
                    if connections.is_empty() {
                        map.remove(&service_id);
                    }
                }
            }
        }
        debug!(connection = id, ?service_id, "subscriber removed");
    }

    /// Number of live connections, global plus filtered.
    pub fn connection_count(&self) -> usize {
        let global = self.global.lock().expect("hub mutex poisoned").len();
        let filtered: usize = self
            .by_service
            .lock()
            .expect("hub mutex poisoned")
            .values()
            .map(Vec::len)
            .sum();
        global + filtered
    }

    /// Serialize `record` into its event frame and deliver it.
    ///
    /// Global subscribers always receive the frame; subscribers filtered on
    /// the record's service id receive it too. Each subscriber sees at most
    /// one frame per record, and failures only cost the failing connection.
    pub async fn publish(&self, record: &RequestLog) {
        let frame = event_frame(record);

        let global = self.global.lock().expect("hub mutex poisoned").clone();
        self.deliver_all(&frame, global, None).await;

        if let Some(service_id) = record.mock_service_id {
            let filtered = self
                .by_service
                .lock()
                .expect("hub mutex poisoned")
                .get(&service_id)
                .cloned()
                .unwrap_or_default();
            self.deliver_all(&frame, filtered, Some(service_id)).await;
        }
    }

    async fn deliver_all(&self, frame: &str, connections: Vec<Connection>, service_id: Option<u64>) {
        if connections.is_empty() {
            return;
        }
        let deliveries = connections.iter().map(|connection| {
            let subscriber = connection.subscriber.clone();
            let id = connection.id;
            async move { (id, subscriber.deliver(frame).await) }
        });
        for (id, result) in join_all(deliveries).await {
            if let Err(error) = result {
                warn!(connection = id, %error, "delivery failed, dropping subscriber");
                self.unsubscribe(id, service_id);
            }
        }
    }
}

/// The wire frame sent for one record.
pub fn event_frame(record: &RequestLog) -> String {
    let envelope = serde_json::json!({
        "type": "log",
        "data": record,
        "timestamp": Local::now().naive_local().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    });
    envelope.to_string()
}
