// Event Channel
// Per-transaction ordered log with replay for late and early subscribers

use crate::domain::{EventPayload, TransactionEvent, TransactionId};
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Ordered event stream for one transaction. Ends after the Finished event.
pub type EventStream = mpsc::UnboundedReceiver<TransactionEvent>;

#[derive(Default)]
struct Stream {
    log: Vec<TransactionEvent>,
    subscribers: Vec<mpsc::UnboundedSender<TransactionEvent>>,
    closed: bool,
}

impl Stream {
    fn is_orphan(&self) -> bool {
        self.log.is_empty() && !self.closed && self.subscribers.iter().all(|s| s.is_closed())
    }
}

pub struct EventChannel {
    streams: HashMap<TransactionId, Stream>,
    closed_order: VecDeque<TransactionId>,
    retained_closed: usize,
}

impl EventChannel {
    pub fn new(retained_closed: usize) -> Self {
        Self {
            streams: HashMap::new(),
            closed_order: VecDeque::new(),
            retained_closed,
        }
    }

    /// Subscribe to `id`, whether or not it exists yet.
    ///
    /// Everything already published is replayed first. Subscribing to a
    /// closed stream yields its full history and then ends.
    pub fn subscribe(&mut self, id: &str) -> EventStream {
        self.streams.retain(|_, s| !s.is_orphan());

        let (tx, rx) = mpsc::unbounded_channel();
        let stream = self.streams.entry(id.to_string()).or_default();
        for event in &stream.log {
            let _ = tx.send(event.clone());
        }
        if !stream.closed {
            stream.subscribers.push(tx);
        }
        debug!(transaction_id = %id, replayed = stream.log.len(), "Event subscriber added");
        rx
    }

    /// Append an event and fan it out. Returns None once the stream is closed.
    pub fn publish(&mut self, id: &str, payload: EventPayload) -> Option<TransactionEvent> {
        let stream = self.streams.entry(id.to_string()).or_default();
        if stream.closed {
            warn!(transaction_id = %id, ?payload, "Event after Finished dropped");
            return None;
        }

        let event = TransactionEvent {
            transaction_id: id.to_string(),
            sequence: stream.log.len() as u64,
            payload,
        };
        stream.log.push(event.clone());
        stream.subscribers.retain(|s| s.send(event.clone()).is_ok());

        if event.payload.is_terminal() {
            stream.closed = true;
            stream.subscribers.clear();
            self.closed_order.push_back(id.to_string());
            self.evict_closed();
        }
        Some(event)
    }

    /// Events published so far for `id`
    pub fn history(&self, id: &str) -> Vec<TransactionEvent> {
        self.streams
            .get(id)
            .map(|s| s.log.clone())
            .unwrap_or_default()
    }

    /// True while `id` has a live or retained stream
    pub fn has_stream(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    pub fn is_closed(&self, id: &str) -> bool {
        self.streams.get(id).is_some_and(|s| s.closed)
    }

    fn evict_closed(&mut self) {
        while self.closed_order.len() > self.retained_closed {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.streams.remove(&oldest);
            }
        }
    }
}
