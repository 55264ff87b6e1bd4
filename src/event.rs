//! Change-notification channels shared by every reference node.
//!
//! Observers register a closure against a node's [`Broadcaster`] and hold on to the
//! returned [`Subscription`]. Registration is weak: dropping the handle detaches the
//! observer, so subscription lifetime is tied to ownership rather than to manual
//! unsubscribe discipline, and a disposed node can never accumulate dead listeners.

use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// The single change vocabulary used for every propagated change, regardless of
/// entity type. New variants must not be added without updating every propagation
/// path that matches on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceAction {
    Add,
    Update,
    Remove,
    Dispose,
}

impl Display for ReferenceAction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ReferenceAction::Add => write!(f, "Add"),
            ReferenceAction::Update => write!(f, "Update"),
            ReferenceAction::Remove => write!(f, "Remove"),
            ReferenceAction::Dispose => write!(f, "Dispose"),
        }
    }
}

type Sink<P> = dyn Fn(ReferenceAction, &P) + Send + Sync;

/// Keeps one registered observer alive. Dropping the handle unsubscribes it.
#[must_use = "dropping a Subscription detaches the observer"]
pub struct Subscription<P: ?Sized> {
    _sink: Arc<Sink<P>>,
}

impl<P> fmt::Debug for Subscription<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("Subscription")
    }
}

/// A synchronous, in-process fan-out channel carrying `(action, payload)` pairs.
///
/// Delivery happens on the calling thread, in registration order, before the
/// triggering call returns. No ordering guarantee is part of the contract though;
/// observers must not assume a position relative to other observers.
pub struct Broadcaster<P> {
    sinks: Mutex<Vec<Weak<Sink<P>>>>,
}

impl<P> Default for Broadcaster<P> {
    fn default() -> Self {
        Broadcaster {
            sinks: Mutex::new(Vec::new()),
        }
    }
}

impl<P> fmt::Debug for Broadcaster<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Broadcaster({} sinks)", self.sinks.lock().len())
    }
}

impl<P> Broadcaster<P> {
    pub fn subscribe<F>(&self, sink: F) -> Subscription<P>
    where
        F: Fn(ReferenceAction, &P) + Send + Sync + 'static,
    {
        let sink: Arc<Sink<P>> = Arc::new(sink);
        self.sinks.lock().push(Arc::downgrade(&sink));
        Subscription { _sink: sink }
    }

    /// Deliver `(action, payload)` to every live observer.
    ///
    /// The subscriber list is snapshotted first and the lock released before any
    /// sink runs, so a handler may read node state, emit further events, or drop
    /// its own subscription without deadlocking.
    pub fn emit(&self, action: ReferenceAction, payload: &P) {
        let live: Vec<Arc<Sink<P>>> = {
            let mut sinks = self.sinks.lock();
            sinks.retain(|weak| weak.strong_count() > 0);
            sinks.iter().filter_map(Weak::upgrade).collect()
        };
        for sink in live {
            sink(action, payload);
        }
    }

    /// Drop every registration. Called at node teardown so late subscribers of a
    /// disposed node can never be re-fired.
    pub fn clear(&self) {
        self.sinks.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let mut sinks = self.sinks.lock();
        sinks.retain(|weak| weak.strong_count() > 0);
        sinks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_every_live_subscriber() {
        let bus: Broadcaster<u32> = Broadcaster::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        let _s1 = bus.subscribe(move |action, payload| {
            assert_eq!(action, ReferenceAction::Update);
            assert_eq!(*payload, 7);
            h1.fetch_add(1, Ordering::SeqCst);
        });
        let h2 = hits.clone();
        let _s2 = bus.subscribe(move |_, _| {
            h2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(ReferenceAction::Update, &7);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_subscription_detaches_observer() {
        let bus: Broadcaster<u32> = Broadcaster::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let sub = bus.subscribe(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(ReferenceAction::Add, &1);
        drop(sub);
        bus.emit(ReferenceAction::Add, &2);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn clear_silences_late_emits() {
        let bus: Broadcaster<u32> = Broadcaster::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = bus.subscribe(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.clear();
        bus.emit(ReferenceAction::Dispose, &0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_may_drop_its_own_subscription() {
        let bus: Arc<Broadcaster<u32>> = Arc::new(Broadcaster::default());
        let slot: Arc<Mutex<Option<Subscription<u32>>>> = Arc::new(Mutex::new(None));

        let slot2 = slot.clone();
        let sub = bus.subscribe(move |_, _| {
            // One-shot observer: detach on first delivery.
            slot2.lock().take();
        });
        *slot.lock() = Some(sub);

        bus.emit(ReferenceAction::Add, &1);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
