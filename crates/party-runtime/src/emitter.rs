//! Broadcast-based event emitter.
//!
//! Subscribing returns a `broadcast::Receiver`; dropping it unsubscribes.
//! The subscription lives as long as the subscriber holds the receiver,
//! independent of the emitter's owner.

use std::sync::atomic::{AtomicU64, Ordering};

use party_settings::DEFAULT_EVENT_CHANNEL_CAPACITY;
use tokio::sync::broadcast;

/// Broadcast-based event emitter.
///
/// Non-blocking: `emit` never awaits, so it is safe to call while holding
/// a state lock. Slow receivers lag rather than blocking the sender.
pub struct EventEmitter<T: Clone> {
    tx: broadcast::Sender<T>,
    emit_count: AtomicU64,
}

impl<T: Clone> EventEmitter<T> {
    /// Create a new emitter with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CHANNEL_CAPACITY)
    }

    /// Create a new emitter with a custom channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns the number of receivers that received the event (0 if none).
    pub fn emit(&self, event: T) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total number of events emitted.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl<T: Clone> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}
