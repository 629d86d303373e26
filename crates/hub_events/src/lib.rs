#![forbid(unsafe_code)]
//! Event plumbing shared by the hub and its observers.
//!
//! Every state change in the hub becomes an [`Event`] with a hub-wide,
//! strictly increasing sequence number. The [`EventBus`] fans events out to
//! bounded subscriber queues without ever blocking the publisher, keeps a
//! small in-memory ring for late joiners, and mirrors each event as one line
//! of an append-only JSONL state log. [`OtelTailer`] turns an OTEL file
//! exporter's JSONL output into per-conversation heartbeats.

mod bus;
mod log;
mod tailer;

pub use bus::{EventBus, RING_CAPACITY, SUBSCRIBER_CAPACITY};
pub use log::StateLog;
pub use tailer::{OtelHeartbeat, OtelTailer};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One broadcast hub event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Assigned at broadcast time; strictly increasing and contiguous.
    pub seq: u64,
    /// Originating agent name, or `"hub"` for hub-internal events.
    pub who: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}
