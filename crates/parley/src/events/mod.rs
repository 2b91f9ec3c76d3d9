//! Meeting lifecycle event emission.
//!
//! Events carry integration/observability concerns and are deliberately
//! separate from message handlers, which carry business logic tied to payload
//! content. Subscribers register per event kind on the SDK instance.
//!
//! Emission never blocks the emitting operation: events are queued to a
//! single dispatcher task. The dispatcher delivers events in emission order;
//! one event's subscribers run concurrently, and a failing subscriber is
//! logged without affecting its siblings or the emitting operation.

use crate::observability::metrics;
use crate::types::MeetingId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Meeting lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MeetingStarted,
    MeetingEnded,
    TurnChanged,
    ParticipantJoined,
    ParticipantLeft,
    TimeoutOccurred,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MeetingStarted => "meeting_started",
            EventKind::MeetingEnded => "meeting_ended",
            EventKind::TurnChanged => "turn_changed",
            EventKind::ParticipantJoined => "participant_joined",
            EventKind::ParticipantLeft => "participant_left",
            EventKind::TimeoutOccurred => "timeout_occurred",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific event data. External ids identify the agents involved.
#[derive(Debug, Clone)]
pub enum EventData {
    MeetingStarted {
        host: String,
        first_speaker: String,
    },
    MeetingEnded,
    TurnChanged {
        previous: Option<String>,
        current: String,
    },
    ParticipantJoined {
        agent: String,
    },
    ParticipantLeft {
        agent: String,
    },
    TimeoutOccurred {
        speaker: String,
    },
}

impl EventData {
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::MeetingStarted { .. } => EventKind::MeetingStarted,
            EventData::MeetingEnded => EventKind::MeetingEnded,
            EventData::TurnChanged { .. } => EventKind::TurnChanged,
            EventData::ParticipantJoined { .. } => EventKind::ParticipantJoined,
            EventData::ParticipantLeft { .. } => EventKind::ParticipantLeft,
            EventData::TimeoutOccurred { .. } => EventKind::TimeoutOccurred,
        }
    }
}

/// A delivered lifecycle event.
#[derive(Debug, Clone)]
pub struct Event {
    pub meeting_id: MeetingId,
    pub occurred_at: DateTime<Utc>,
    pub data: EventData,
}

impl Event {
    #[must_use]
    pub fn new(meeting_id: MeetingId, data: EventData) -> Self {
        Self {
            meeting_id,
            occurred_at: Utc::now(),
            data,
        }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.data.kind()
    }
}

/// Boxed subscriber future.
pub type SubscriberFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// A registered event subscriber.
pub trait Subscriber: Send + Sync {
    fn notify(&self, event: Event) -> SubscriberFuture;
}

struct FnSubscriber<F>(F);

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(Event) -> SubscriberFuture + Send + Sync,
{
    fn notify(&self, event: Event) -> SubscriberFuture {
        (self.0)(event)
    }
}

/// Wrap an async closure as a [`Subscriber`].
pub fn subscriber_fn<F, Fut>(f: F) -> Arc<dyn Subscriber>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnSubscriber(move |event| {
        Box::pin(f(event)) as SubscriberFuture
    }))
}

#[derive(Default)]
struct Subscribers {
    by_kind: RwLock<HashMap<EventKind, Vec<Arc<dyn Subscriber>>>>,
}

impl Subscribers {
    fn snapshot(&self, kind: EventKind) -> Vec<Arc<dyn Subscriber>> {
        let map = match self.by_kind.read() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(&kind).cloned().unwrap_or_default()
    }

    async fn dispatch(&self, event: Event) {
        let subscribers = self.snapshot(event.kind());
        if subscribers.is_empty() {
            return;
        }

        let mut set = JoinSet::new();
        for subscriber in subscribers {
            let event = event.clone();
            set.spawn(async move { subscriber.notify(event).await });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "parley.events",
                        kind = %event.kind(),
                        meeting_id = %event.meeting_id,
                        error = %e,
                        "event subscriber failed"
                    );
                }
                Err(join_error) => {
                    warn!(
                        target: "parley.events",
                        kind = %event.kind(),
                        meeting_id = %event.meeting_id,
                        error = %join_error,
                        "event subscriber panicked"
                    );
                }
            }
        }
    }
}

/// Per-SDK-instance event bus.
pub struct EventBus {
    subscribers: Arc<Subscribers>,
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Create the bus and spawn its dispatcher task.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(queue_capacity);
        let subscribers = Arc::new(Subscribers::default());

        let dispatch_subscribers = Arc::clone(&subscribers);
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch_subscribers.dispatch(event).await;
            }
        });

        Self {
            subscribers,
            tx: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    /// Register a subscriber for one event kind. Subscribers are invoked in
    /// registration order groups, concurrently per event.
    pub fn subscribe(&self, kind: EventKind, subscriber: Arc<dyn Subscriber>) {
        let mut map = match self.subscribers.by_kind.write() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(kind).or_default().push(subscriber);
    }

    /// Queue an event for dispatch. Never blocks the emitting operation; if
    /// the queue is full or the bus is closed the event is dropped with a
    /// warning.
    pub fn emit(&self, event: Event) {
        metrics::record_event_emitted(event.kind().as_str());

        let sender = {
            let tx = match self.tx.lock() {
                Ok(tx) => tx,
                Err(poisoned) => poisoned.into_inner(),
            };
            tx.clone()
        };

        match sender {
            Some(sender) => {
                if let Err(e) = sender.try_send(event) {
                    warn!(
                        target: "parley.events",
                        error = %e,
                        "event queue rejected an event"
                    );
                }
            }
            None => {
                debug!(target: "parley.events", "event emitted after bus close; dropped");
            }
        }
    }

    /// Stop accepting events and drain the queue.
    pub async fn close(&self) {
        let sender = {
            let mut tx = match self.tx.lock() {
                Ok(tx) => tx,
                Err(poisoned) => poisoned.into_inner(),
            };
            tx.take()
        };
        drop(sender);

        let dispatcher = {
            let mut handle = match self.dispatcher.lock() {
                Ok(handle) => handle,
                Err(poisoned) => poisoned.into_inner(),
            };
            handle.take()
        };

        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(target: "parley.events", error = %e, "event dispatcher task failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn collector() -> (Arc<StdMutex<Vec<EventKind>>>, Arc<dyn Subscriber>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let subscriber = subscriber_fn(move |event: Event| {
            let seen = Arc::clone(&seen_clone);
            async move {
                seen.lock().unwrap().push(event.kind());
                Ok(())
            }
        });
        (seen, subscriber)
    }

    #[tokio::test]
    async fn test_events_delivered_in_emission_order() {
        let bus = EventBus::new(16);
        let (seen, subscriber) = collector();

        bus.subscribe(EventKind::TimeoutOccurred, Arc::clone(&subscriber));
        bus.subscribe(EventKind::TurnChanged, subscriber);

        let meeting_id = MeetingId::new();
        bus.emit(Event::new(
            meeting_id,
            EventData::TimeoutOccurred {
                speaker: "bob".to_string(),
            },
        ));
        bus.emit(Event::new(
            meeting_id,
            EventData::TurnChanged {
                previous: Some("bob".to_string()),
                current: "carol".to_string(),
            },
        ));

        bus.close().await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![EventKind::TimeoutOccurred, EventKind::TurnChanged]
        );
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_siblings() {
        let bus = EventBus::new(16);
        let (seen, good) = collector();
        let failing = subscriber_fn(|_| async { Err(anyhow::anyhow!("subscriber broke")) });

        bus.subscribe(EventKind::MeetingEnded, failing);
        bus.subscribe(EventKind::MeetingEnded, good);

        bus.emit(Event::new(MeetingId::new(), EventData::MeetingEnded));
        bus.close().await;

        assert_eq!(*seen.lock().unwrap(), vec![EventKind::MeetingEnded]);
    }

    #[tokio::test]
    async fn test_unsubscribed_kinds_are_ignored() {
        let bus = EventBus::new(16);
        let (seen, subscriber) = collector();

        bus.subscribe(EventKind::TurnChanged, subscriber);
        bus.emit(Event::new(
            MeetingId::new(),
            EventData::ParticipantJoined {
                agent: "dave".to_string(),
            },
        ));

        bus.close().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emit_after_close_is_dropped() {
        let bus = EventBus::new(16);
        bus.close().await;
        // Must not panic or hang.
        bus.emit(Event::new(MeetingId::new(), EventData::MeetingEnded));
    }
}
