//! Event infrastructure for the sync core.
//!
//! `SessionEvent` is the observability surface: collaborators (UI layers,
//! monitors) subscribe instead of the core calling back into them. The core
//! never retries on their behalf — a `SyncFailed` event is the signal that a
//! retry decision is theirs to make.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;

use crate::record::RecordId;

/// Events emitted while a project session runs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// The view tree was rebuilt from a fresh snapshot.
    #[serde(rename_all = "camelCase")]
    TreeRebuilt {
        /// Number of records in the snapshot.
        record_count: usize,
    },
    /// A structural batch was accepted by the store.
    #[serde(rename_all = "camelCase")]
    BatchDispatched {
        /// Number of operations in the batch.
        op_count: usize,
    },
    /// A coalesced content write reached the store.
    ContentFlushed { id: RecordId },
    /// A batch was rejected or the store was unreachable. No rollback was
    /// performed; the caller decides whether to retry.
    SyncFailed { message: String },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Event bus publishing session events to subscribers.
///
/// Thread-safe for the multi-threaded Tokio runtime. Wrap in `Arc` to enable
/// subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Arc<dyn Fn(SessionEvent) + Send + Sync>)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns a `Subscription` that unsubscribes on
    /// drop. Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SessionEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write avoids a deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g. during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: SessionEvent) {
        // Clone the callback list so a callback may itself subscribe.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rebuilt(record_count: usize) -> SessionEvent {
        SessionEvent::TreeRebuilt { record_count }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(rebuilt(3));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(rebuilt(1));
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(rebuilt(2));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_multiple_subscribers_each_receive() {
        let bus = Arc::new(EventBus::new());
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count1);
        let c2 = Arc::clone(&count2);
        let _sub1 = bus.subscribe(move |_| {
            c1.fetch_add(1, Ordering::Relaxed);
        });
        let _sub2 = bus.subscribe(move |_| {
            c2.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(rebuilt(1));
        assert_eq!(count1.load(Ordering::Relaxed), 1);
        assert_eq!(count2.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = SessionEvent::SyncFailed {
            message: "Store unreachable".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"syncFailed\""));
        assert!(json.contains("\"message\":\"Store unreachable\""));

        let event = SessionEvent::BatchDispatched { op_count: 4 };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"opCount\":4"));
    }
}
