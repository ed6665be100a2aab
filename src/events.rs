//! Observer fan-out for inbound messages
//!
//! Every envelope a peer receives, chat and protocol-control alike, is
//! published on the [`ObserverBus`] so external listeners (a terminal UI,
//! a test harness) can react without the peer depending on them.
//!
//! Delivery is synchronous, in subscription order, on the publishing task:
//! a slow observer stalls the receive loop that published. That is a
//! documented property of the bus, not something it tries to hide.

use crate::envelope::Envelope;
use parking_lot::RwLock;
use std::sync::Arc;

/// Capability interface for message listeners
///
/// Any component satisfying this single method may subscribe; closures get
/// a blanket implementation.
pub trait Observer: Send + Sync {
    /// Called once per received envelope, in arrival order per channel
    fn on_message(&self, envelope: &Envelope);
}

impl<F> Observer for F
where
    F: Fn(&Envelope) + Send + Sync,
{
    fn on_message(&self, envelope: &Envelope) {
        self(envelope)
    }
}

/// Handle for unsubscribing an observer
///
/// Dropping the handle does not unsubscribe; call
/// [`ObserverBus::unsubscribe`] explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Publish/subscribe fan-out from receive loops to registered observers
pub struct ObserverBus {
    observers: Arc<RwLock<Vec<(SubscriptionHandle, Arc<dyn Observer>)>>>,
    next_id: Arc<RwLock<u64>>,
}

impl ObserverBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self {
            observers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(RwLock::new(0)),
        }
    }

    /// Register an observer; it receives every envelope published after
    /// this call until unsubscribed
    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> SubscriptionHandle {
        let mut next_id = self.next_id.write();
        let handle = SubscriptionHandle::new(*next_id);
        *next_id += 1;

        self.observers.write().push((handle, observer));
        handle
    }

    /// Remove the observer registered under `handle`; unknown handles are
    /// a no-op
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.observers.write().retain(|(h, _)| *h != handle);
    }

    /// Deliver an envelope to every subscriber, in subscription order
    ///
    /// A panicking observer is caught and logged so the remaining
    /// subscribers still run.
    pub fn publish(&self, envelope: &Envelope) {
        let observers = self.observers.read();

        for (handle, observer) in observers.iter() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                observer.on_message(envelope);
            }))
            .is_err()
            {
                tracing::error!("observer {:?} panicked while handling a message", handle);
            }
        }
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }
}

impl Default for ObserverBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ObserverBus {
    fn clone(&self) -> Self {
        Self {
            observers: Arc::clone(&self.observers),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn test_subscribe_and_publish() {
        let bus = ObserverBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        bus.subscribe(Arc::new(move |_: &Envelope| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(&Envelope::chat("alice", "hi"));
        bus.publish(&Envelope::chat("alice", "there"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = ObserverBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(Arc::new(move |_: &Envelope| {
                order.lock().unwrap().push(tag);
            }));
        }

        bus.publish(&Envelope::chat("alice", "hi"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = ObserverBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        let handle = bus.subscribe(Arc::new(move |_: &Envelope| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(bus.observer_count(), 1);

        bus.unsubscribe(handle);
        assert_eq!(bus.observer_count(), 0);

        bus.publish(&Envelope::chat("alice", "hi"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_observer_does_not_poison_the_bus() {
        let bus = ObserverBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Arc::new(|_: &Envelope| {
            panic!("observer panic");
        }));
        let count_clone = Arc::clone(&count);
        bus.subscribe(Arc::new(move |_: &Envelope| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish(&Envelope::chat("alice", "hi"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_trait_object() {
        struct Recorder(Arc<AtomicUsize>);
        impl Observer for Recorder {
            fn on_message(&self, _envelope: &Envelope) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let bus = ObserverBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Arc::new(Recorder(Arc::clone(&count))));

        bus.publish(&Envelope::chat("alice", "hi"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
