//! In-process lock manager for tests.
//!
//! Same contract as the advisory-lock implementation, backed by per-key
//! `tokio` mutexes. The held-lock counter lets tests assert lock symmetry:
//! zero outstanding locks after any operation completes.

use crate::errors::{ParleyError, Result};
use crate::lock::{LockGuard, LockHold, LockKey, LockManager};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// In-memory [`LockManager`].
#[derive(Default)]
pub struct MemoryLockManager {
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    held: Arc<AtomicUsize>,
}

impl MemoryLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of locks currently held across all keys.
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    fn entry(&self, key: LockKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(key.as_i64()).or_default())
    }
}

struct MemoryHold {
    _permit: OwnedMutexGuard<()>,
    held: Arc<AtomicUsize>,
}

impl Drop for MemoryHold {
    fn drop(&mut self) {
        self.held.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LockHold for MemoryHold {
    async fn release(self: Box<Self>) -> Result<()> {
        // Dropping the permit releases the mutex; the Drop impl keeps the
        // held counter accurate.
        Ok(())
    }

    fn abandon(self: Box<Self>) {}
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, key: LockKey) -> Result<LockGuard> {
        let permit = self.entry(key).lock_owned().await;
        self.held.fetch_add(1, Ordering::SeqCst);
        Ok(LockGuard::new(
            key,
            Box::new(MemoryHold {
                _permit: permit,
                held: Arc::clone(&self.held),
            }),
        ))
    }

    async fn try_acquire(&self, key: LockKey, wait: Duration) -> Result<LockGuard> {
        let entry = self.entry(key);
        match tokio::time::timeout(wait, entry.lock_owned()).await {
            Ok(permit) => {
                self.held.fetch_add(1, Ordering::SeqCst);
                Ok(LockGuard::new(
                    key,
                    Box::new(MemoryHold {
                        _permit: permit,
                        held: Arc::clone(&self.held),
                    }),
                ))
            }
            Err(_) => Err(ParleyError::LockUnavailable(key.as_i64())),
        }
    }
}
