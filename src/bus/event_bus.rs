use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const BUS_CAPACITY: usize = 1024;

/// Internal bookkeeping record. `event_type` doubles as the wire `type`
/// field; `task_id` lets `should_flush_immediately` fast-path task/agent
/// updates without inspecting `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: String,
    pub task_id: Option<String>,
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// The frame shape delivered to WebSocket clients: `{type, payload, ts}`.
#[derive(Debug, Clone, Serialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub ts: i64,
}

impl From<&BusEvent> for WireFrame {
    fn from(event: &BusEvent) -> Self {
        WireFrame {
            kind: event.event_type.clone(),
            payload: event.payload.clone(),
            ts: chrono::DateTime::parse_from_rfc3339(&event.created_at)
                .map(|dt| dt.timestamp_millis())
                .unwrap_or_else(|_| Utc::now().timestamp_millis()),
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    seq: AtomicI64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            seq: AtomicI64::new(0),
        }
    }

    /// Publish a pre-built event onto the bus. Best-effort: a dropped or
    /// slow subscriber never blocks or panics the publisher (§4.3).
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    /// Convenience: build and publish an event in one call.
    pub fn emit(
        &self,
        event_type: impl Into<String>,
        task_id: Option<String>,
        payload: serde_json::Value,
    ) -> BusEvent {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let event = BusEvent {
            id: Uuid::new_v4().to_string(),
            task_id,
            seq,
            event_type: event_type.into(),
            payload,
            created_at: Utc::now().to_rfc3339(),
        };
        self.publish(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}
