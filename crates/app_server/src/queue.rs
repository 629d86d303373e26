use std::{collections::VecDeque, sync::Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::protocol::ServerEvent;

/// Bounded fan-out queue for uncorrelated transport traffic.
///
/// Unlike a tokio mpsc channel, overflow drops the *oldest* entry so the
/// reader task never blocks and recent events win. The hub's event pump is
/// the single consumer.
pub struct EventQueue {
    inner: Mutex<VecDeque<ServerEvent>>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueues an event, evicting the oldest entry when full.
    pub fn push(&self, event: ServerEvent) {
        {
            let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.capacity {
                queue.pop_front();
                warn!(capacity = self.capacity, "event queue full, dropping oldest");
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Dequeues the next event without waiting.
    pub fn try_pop(&self) -> Option<ServerEvent> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Waits for the next event.
    pub async fn pop(&self) -> ServerEvent {
        loop {
            let notified = self.notify.notified();
            if let Some(event) = self.try_pop() {
                return event;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
