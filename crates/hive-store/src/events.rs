//! Ordered transition events.

use std::collections::VecDeque;
use std::sync::Arc;

use hive_proto::{Clock, EventEnvelope, HiveEvent};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

/// Destination for events produced by committed writes.
pub trait EventSink: Send + Sync {
    /// Publish one event for a record now at `record_version`.
    fn publish(&self, record_version: u64, event: HiveEvent);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _record_version: u64, _event: HiveEvent) {}
}

#[derive(Debug)]
struct BusState {
    next_sequence: u64,
    history: VecDeque<EventEnvelope>,
}

/// Broadcast bus with a bounded replay history.
///
/// Sequence numbers are assigned, recorded and broadcast under one lock, so
/// subscribers and the history observe the same total order.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    state: Mutex<BusState>,
    history_limit: usize,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    /// Bus with `capacity` slots per subscriber and `history_limit` retained events.
    #[must_use]
    pub fn new(capacity: usize, history_limit: usize, clock: Arc<dyn Clock>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            state: Mutex::new(BusState {
                next_sequence: 1,
                history: VecDeque::with_capacity(history_limit),
            }),
            history_limit,
            clock,
        }
    }

    /// Receive every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Up to `limit` most recent events, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<EventEnvelope> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Retained events with a sequence greater than `sequence`.
    #[must_use]
    pub fn since(&self, sequence: u64) -> Vec<EventEnvelope> {
        self.state
            .lock()
            .history
            .iter()
            .filter(|e| e.sequence > sequence)
            .cloned()
            .collect()
    }

    /// Sequence of the last published event, 0 if none.
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().next_sequence - 1
    }
}

impl EventSink for EventBus {
    fn publish(&self, record_version: u64, event: HiveEvent) {
        let mut state = self.state.lock();
        let envelope = EventEnvelope {
            sequence: state.next_sequence,
            record_version,
            timestamp: self.clock.now(),
            event,
        };
        state.next_sequence += 1;

        trace!(
            sequence = envelope.sequence,
            event = envelope.event.name(),
            "publishing event"
        );

        if self.history_limit > 0 {
            if state.history.len() == self.history_limit {
                state.history.pop_front();
            }
            state.history.push_back(envelope.clone());
        }

        // No subscribers is not an error.
        let _ = self.sender.send(envelope);
    }
}
