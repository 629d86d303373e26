use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::{log::StateLog, Event};

/// Queue depth granted to each subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 1000;
/// How many recent events the in-memory ring retains.
pub const RING_CAPACITY: usize = 500;

struct BusInner {
    seq: u64,
    subscribers: Vec<mpsc::Sender<Event>>,
    ring: VecDeque<Event>,
}

/// In-process broadcast bus with sequence numbers.
///
/// `broadcast` never blocks: subscribers whose queue is full are dropped so a
/// stalled observer cannot wedge the hub. Sequence assignment, ring append,
/// state-log append, and fan-out happen under one lock, so log order always
/// matches `seq` order.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    log: Option<Arc<StateLog>>,
}

impl EventBus {
    pub fn new(log: Option<StateLog>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                seq: 0,
                subscribers: Vec::new(),
                ring: VecDeque::with_capacity(RING_CAPACITY),
            })),
            log: log.map(Arc::new),
        }
    }

    /// Registers a new subscriber with a bounded queue.
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .subscribers
            .push(tx);
        rx
    }

    /// Assigns the next sequence number and delivers the event everywhere.
    pub fn broadcast(&self, who: &str, kind: &str, payload: Value) -> Event {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.seq += 1;
        let event = Event {
            seq: inner.seq,
            who: who.to_string(),
            kind: kind.to_string(),
            payload,
        };

        if inner.ring.len() >= RING_CAPACITY {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());

        if let Some(log) = &self.log {
            log.append(&event);
        }

        inner.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(seq = event.seq, "subscriber queue full, dropping subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        event
    }

    /// Snapshot of the recent-event ring, oldest first.
    pub fn recent(&self) -> Vec<Event> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ring
            .iter()
            .cloned()
            .collect()
    }

    /// The last sequence number handed out.
    pub fn current_seq(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).seq
    }
}
