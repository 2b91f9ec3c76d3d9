//! Event recording for assertions.

use parley::{subscriber_fn, Event, EventKind, Subscriber};
use std::sync::{Arc, Mutex};

/// Records every event it receives, in delivery order.
#[derive(Clone, Default)]
pub struct EventRecorder {
    seen: Arc<Mutex<Vec<Event>>>,
}

fn lock_seen(seen: &Mutex<Vec<Event>>) -> std::sync::MutexGuard<'_, Vec<Event>> {
    match seen.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl EventRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscriber handle to register with the SDK.
    #[must_use]
    pub fn subscriber(&self) -> Arc<dyn Subscriber> {
        let seen = Arc::clone(&self.seen);
        subscriber_fn(move |event: Event| {
            let seen = Arc::clone(&seen);
            async move {
                lock_seen(&seen).push(event);
                Ok(())
            }
        })
    }

    /// Snapshot of recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        lock_seen(&self.seen).clone()
    }

    /// Snapshot of recorded event kinds, in delivery order.
    #[must_use]
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(Event::kind).collect()
    }
}
