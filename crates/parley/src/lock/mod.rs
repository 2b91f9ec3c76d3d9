//! Distributed, connection-scoped locks.
//!
//! Every conversation and meeting critical section runs under a named lock
//! backed by the shared store. The failure mode this module is built around:
//! a lock acquired on one connection and "released" on another is a silent
//! no-op, and the original lock persists until its owning connection dies,
//! surfacing elsewhere as a deadlock or leak.
//!
//! The API makes that mistake unrepresentable. [`LockManager::acquire`]
//! returns a [`LockGuard`] that owns the underlying connection for the lock's
//! whole lifetime; [`LockGuard::release`] is the only release path and always
//! runs against that same connection. A guard dropped without release (panic,
//! early return) abandons its connection entirely rather than returning a
//! still-locked connection to a pool.

use crate::errors::Result;
use crate::types::{MeetingId, SessionId};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod postgres;

/// Namespace discriminants keep session and meeting keys from colliding.
const SESSION_NAMESPACE: u64 = 1;
const MEETING_NAMESPACE: u64 = 2;

/// Key in the advisory-lock namespace.
///
/// Derived deterministically from a domain id, so every process computes the
/// same key for the same session or meeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey(i64);

impl LockKey {
    /// Lock key for a conversation session.
    #[must_use]
    pub fn for_session(session_id: SessionId) -> Self {
        Self::derive(SESSION_NAMESPACE, session_id.0)
    }

    /// Lock key for a meeting.
    #[must_use]
    pub fn for_meeting(meeting_id: MeetingId) -> Self {
        Self::derive(MEETING_NAMESPACE, meeting_id.0)
    }

    /// FNV-1a fold of the namespace and uuid halves into the i64 keyspace.
    fn derive(namespace: u64, id: Uuid) -> Self {
        let (hi, lo) = id.as_u64_pair();
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for part in [namespace, hi, lo] {
            hash ^= part;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        #[allow(clippy::cast_possible_wrap)]
        Self(hash as i64)
    }

    /// Raw advisory-lock key value.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

/// Backend-specific state of one held lock.
///
/// Implementations own whatever resource scopes the lock (a checked-out
/// connection, an owned mutex permit) so release cannot target anything else.
#[async_trait]
pub trait LockHold: Send {
    /// Release the lock on the connection it was acquired on.
    async fn release(self: Box<Self>) -> Result<()>;

    /// Best-effort cleanup when the guard is dropped without release.
    fn abandon(self: Box<Self>);
}

/// A held lock. Releasing consumes the guard.
pub struct LockGuard {
    key: LockKey,
    hold: Option<Box<dyn LockHold>>,
}

impl LockGuard {
    pub(crate) fn new(key: LockKey, hold: Box<dyn LockHold>) -> Self {
        Self {
            key,
            hold: Some(hold),
        }
    }

    /// The key this guard holds.
    #[must_use]
    pub fn key(&self) -> LockKey {
        self.key
    }

    /// Release the lock. Always targets the acquiring connection.
    pub async fn release(mut self) -> Result<()> {
        match self.hold.take() {
            Some(hold) => hold.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(hold) = self.hold.take() {
            warn!(
                target: "parley.lock",
                key = self.key.as_i64(),
                "lock guard dropped without release; abandoning its connection"
            );
            hold.abandon();
        }
    }
}

/// Named-mutex contract backed by the shared store.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Block until the lock is held.
    async fn acquire(&self, key: LockKey) -> Result<LockGuard>;

    /// Bounded acquire. Failing to acquire within `wait` is reported as the
    /// distinct `LockUnavailable` error, never silently retried, so callers
    /// can decide whether to queue, fail fast, or back off.
    async fn try_acquire(&self, key: LockKey, wait: Duration) -> Result<LockGuard>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_is_deterministic() {
        let session = SessionId::new();
        assert_eq!(
            LockKey::for_session(session).as_i64(),
            LockKey::for_session(session).as_i64()
        );
    }

    #[test]
    fn test_session_and_meeting_namespaces_disjoint() {
        // Same uuid through the two namespaces must not produce the same key.
        let id = Uuid::new_v4();
        let session_key = LockKey::for_session(SessionId(id));
        let meeting_key = LockKey::for_meeting(MeetingId(id));
        assert_ne!(session_key.as_i64(), meeting_key.as_i64());
    }

    #[test]
    fn test_distinct_ids_rarely_collide() {
        let mut keys = std::collections::HashSet::new();
        for _ in 0..1_000 {
            keys.insert(LockKey::for_session(SessionId::new()).as_i64());
        }
        assert_eq!(keys.len(), 1_000);
    }
}
