//! Per-session reply wait primitive.
//!
//! At most one caller is parked per session (the session is `waiting` while
//! they are), so the registry holds one oneshot sender per session id.
//! Resolution consumes the entry: every parked caller is resolved exactly
//! once, by a reply, an ended conversation, a handler failure, or its own
//! timeout path removing the entry.

use crate::models::MessageRow;
use crate::types::SessionId;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// What resolves a parked `send_and_wait` caller.
#[derive(Debug)]
pub(crate) enum ReplySignal {
    /// The reply message arrived.
    Reply(MessageRow),
    /// The conversation was ended while waiting.
    Ended,
    /// The recipient's handler failed after the caller was parked.
    HandlerFailed(String),
}

#[derive(Default)]
pub(crate) struct SessionWaiters {
    inner: Mutex<HashMap<SessionId, oneshot::Sender<ReplySignal>>>,
}

impl SessionWaiters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register the parked caller for a session, replacing any stale entry.
    pub(crate) fn register(&self, session_id: SessionId) -> oneshot::Receiver<ReplySignal> {
        let (tx, rx) = oneshot::channel();
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.insert(session_id, tx);
        rx
    }

    /// Drop the entry without signalling (immediate replies, error cleanup,
    /// the timeout path).
    pub(crate) fn remove(&self, session_id: SessionId) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.remove(&session_id);
    }

    /// Resolve the parked caller, if any. Returns whether a waiter was
    /// present and still listening.
    pub(crate) fn resolve(&self, session_id: SessionId, signal: ReplySignal) -> bool {
        let sender = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.remove(&session_id)
        };
        match sender {
            Some(sender) => sender.send(signal).is_ok(),
            None => false,
        }
    }

    /// Number of currently parked callers.
    pub(crate) fn count(&self) -> usize {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_reaches_registered_waiter() {
        let waiters = SessionWaiters::new();
        let session_id = SessionId::new();

        let rx = waiters.register(session_id);
        assert_eq!(waiters.count(), 1);

        assert!(waiters.resolve(session_id, ReplySignal::Ended));
        assert!(matches!(rx.await, Ok(ReplySignal::Ended)));
        assert_eq!(waiters.count(), 0);
    }

    #[tokio::test]
    async fn test_resolve_without_waiter_is_false() {
        let waiters = SessionWaiters::new();
        assert!(!waiters.resolve(SessionId::new(), ReplySignal::Ended));
    }

    #[tokio::test]
    async fn test_remove_then_resolve_finds_nothing() {
        let waiters = SessionWaiters::new();
        let session_id = SessionId::new();

        let _rx = waiters.register(session_id);
        waiters.remove(session_id);

        assert!(!waiters.resolve(session_id, ReplySignal::Ended));
    }

    #[tokio::test]
    async fn test_register_replaces_stale_entry() {
        let waiters = SessionWaiters::new();
        let session_id = SessionId::new();

        let stale_rx = waiters.register(session_id);
        let fresh_rx = waiters.register(session_id);
        assert_eq!(waiters.count(), 1);

        waiters.resolve(session_id, ReplySignal::Ended);
        // The stale receiver sees its sender dropped, not a signal.
        assert!(stale_rx.await.is_err());
        assert!(matches!(fresh_rx.await, Ok(ReplySignal::Ended)));
    }
}
