//! Turn timer and turn-wait bookkeeping.
//!
//! One timer slot per meeting: arming replaces (cancels) the previous timer,
//! so a `speak` racing the timer task leaves at most one live timer. The
//! timer task itself re-validates meeting state under the meeting lock before
//! acting; cancellation here is an optimization, not the correctness
//! boundary.

use crate::models::MessageRow;
use crate::types::{AgentId, MeetingId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Per-meeting turn timer slots.
#[derive(Default)]
pub(crate) struct TurnTimers {
    inner: Mutex<HashMap<MeetingId, CancellationToken>>,
}

impl TurnTimers {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arm the timer slot for a meeting, cancelling any previous timer.
    /// Returns the token the new timer task must watch.
    pub(crate) fn arm(&self, meeting_id: MeetingId, shutdown: &CancellationToken) -> CancellationToken {
        let token = shutdown.child_token();
        let previous = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.insert(meeting_id, token.clone())
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    /// Cancel and forget the timer for a meeting (meeting ended).
    pub(crate) fn disarm(&self, meeting_id: MeetingId) {
        let token = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.remove(&meeting_id)
        };
        if let Some(token) = token {
            token.cancel();
        }
    }
}

/// What resolves an agent parked for its turn.
#[derive(Debug)]
pub(crate) enum TurnSignal {
    /// The agent became the current speaker; carries nothing — the waiter
    /// queries what it missed itself.
    YourTurn,
    /// The meeting ended while parked.
    MeetingEnded,
}

/// Outcome of `wait_for_turn`.
#[derive(Debug)]
pub enum TurnOutcome {
    /// It is this agent's turn; the meeting messages persisted while parked.
    YourTurn(Vec<MessageRow>),
    /// The meeting ended before the turn arrived.
    MeetingEnded,
    /// The wait deadline elapsed.
    TimedOut,
}

/// Parked turn-waiters, one slot per (meeting, agent).
#[derive(Default)]
pub(crate) struct TurnWaiters {
    inner: Mutex<HashMap<(MeetingId, AgentId), oneshot::Sender<TurnSignal>>>,
}

impl TurnWaiters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        meeting_id: MeetingId,
        agent_id: AgentId,
    ) -> oneshot::Receiver<TurnSignal> {
        let (tx, rx) = oneshot::channel();
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.insert((meeting_id, agent_id), tx);
        rx
    }

    pub(crate) fn remove(&self, meeting_id: MeetingId, agent_id: AgentId) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.remove(&(meeting_id, agent_id));
    }

    /// Wake the agent whose turn just started, if parked.
    pub(crate) fn resolve_speaker(&self, meeting_id: MeetingId, agent_id: AgentId) {
        let sender = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.remove(&(meeting_id, agent_id))
        };
        if let Some(sender) = sender {
            let _ = sender.send(TurnSignal::YourTurn);
        }
    }

    /// Wake every waiter of a meeting with `MeetingEnded`.
    pub(crate) fn resolve_all(&self, meeting_id: MeetingId) {
        let senders: Vec<_> = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            let keys: Vec<_> = inner
                .keys()
                .filter(|(meeting, _)| *meeting == meeting_id)
                .copied()
                .collect();
            keys.into_iter().filter_map(|key| inner.remove(&key)).collect()
        };
        for sender in senders {
            let _ = sender.send(TurnSignal::MeetingEnded);
        }
    }

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
    async fn test_arming_cancels_previous_timer() {
        let timers = TurnTimers::new();
        let shutdown = CancellationToken::new();
        let meeting_id = MeetingId::new();

        let first = timers.arm(meeting_id, &shutdown);
        let second = timers.arm(meeting_id, &shutdown);

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        timers.disarm(meeting_id);
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_armed_timers() {
        let timers = TurnTimers::new();
        let shutdown = CancellationToken::new();

        let token = timers.arm(MeetingId::new(), &shutdown);
        shutdown.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_resolve_speaker_wakes_only_that_agent() {
        let waiters = TurnWaiters::new();
        let meeting_id = MeetingId::new();
        let speaker = AgentId::new();
        let other = AgentId::new();

        let speaker_rx = waiters.register(meeting_id, speaker);
        let other_rx = waiters.register(meeting_id, other);

        waiters.resolve_speaker(meeting_id, speaker);

        assert!(matches!(speaker_rx.await, Ok(TurnSignal::YourTurn)));
        assert_eq!(waiters.count(), 1);
        drop(other_rx);
    }

    #[tokio::test]
    async fn test_resolve_all_drains_one_meeting_only() {
        let waiters = TurnWaiters::new();
        let ending = MeetingId::new();
        let ongoing = MeetingId::new();

        let ended_rx = waiters.register(ending, AgentId::new());
        let _ongoing_rx = waiters.register(ongoing, AgentId::new());

        waiters.resolve_all(ending);

        assert!(matches!(ended_rx.await, Ok(TurnSignal::MeetingEnded)));
        assert_eq!(waiters.count(), 1);
    }
}
