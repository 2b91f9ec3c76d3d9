//! Postgres advisory-lock implementation.
//!
//! Session-scoped advisory locks (`pg_advisory_lock`) are tied to the server
//! session of the connection that took them. The guard checks a connection
//! out of the pool, acquires on it, and keeps it until release, so the
//! acquire/release pair can never straddle two connections. An abandoned
//! guard detaches its connection from the pool and closes it; the server
//! releases the lock when the session ends.

use crate::errors::{ParleyError, Result};
use crate::lock::{LockGuard, LockHold, LockKey, LockManager};
use crate::observability::metrics;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Postgres, Row};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Polling interval for bounded acquisition attempts.
const TRY_ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Advisory-lock manager over a shared Postgres pool.
#[derive(Clone)]
pub struct PgLockManager {
    pool: PgPool,
}

impl PgLockManager {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

struct PgLockHold {
    key: LockKey,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl LockHold for PgLockHold {
    async fn release(mut self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let row = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key.as_i64())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| ParleyError::Database(e.to_string()))?;

        let released: bool = row.get(0);
        if !released {
            // The session did not hold the lock; should be unreachable given
            // the guard owns the acquiring connection.
            warn!(
                target: "parley.lock",
                key = self.key.as_i64(),
                "pg_advisory_unlock reported no lock held"
            );
        }

        // Dropping the connection returns it, now unlocked, to the pool.
        Ok(())
    }

    fn abandon(mut self: Box<Self>) {
        if let Some(conn) = self.conn.take() {
            let key = self.key;
            // Never hand a still-locked connection back to the pool. Closing
            // the detached connection ends its server session, which releases
            // the advisory lock.
            tokio::spawn(async move {
                let raw = conn.detach();
                if let Err(e) = raw.close().await {
                    warn!(
                        target: "parley.lock",
                        key = key.as_i64(),
                        error = %e,
                        "failed to close abandoned lock connection"
                    );
                }
            });
        }
    }
}

#[async_trait]
impl LockManager for PgLockManager {
    #[instrument(skip_all, name = "lock.acquire", fields(key = key.as_i64()))]
    async fn acquire(&self, key: LockKey) -> Result<LockGuard> {
        let start = Instant::now();
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| ParleyError::Database(e.to_string()))?;

        let result = sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key.as_i64())
            .execute(&mut *conn)
            .await;

        match result {
            Ok(_) => {
                metrics::record_lock_acquisition("success", start.elapsed());
                Ok(LockGuard::new(
                    key,
                    Box::new(PgLockHold {
                        key,
                        conn: Some(conn),
                    }),
                ))
            }
            Err(e) => {
                metrics::record_lock_acquisition("error", start.elapsed());
                Err(ParleyError::Database(e.to_string()))
            }
        }
    }

    #[instrument(skip_all, name = "lock.try_acquire", fields(key = key.as_i64()))]
    async fn try_acquire(&self, key: LockKey, wait: Duration) -> Result<LockGuard> {
        let start = Instant::now();
        let deadline = start + wait;

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| ParleyError::Database(e.to_string()))?;

        loop {
            let row = sqlx::query("SELECT pg_try_advisory_lock($1)")
                .bind(key.as_i64())
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| {
                    metrics::record_lock_acquisition("error", start.elapsed());
                    ParleyError::Database(e.to_string())
                })?;

            let acquired: bool = row.get(0);
            if acquired {
                metrics::record_lock_acquisition("success", start.elapsed());
                return Ok(LockGuard::new(
                    key,
                    Box::new(PgLockHold {
                        key,
                        conn: Some(conn),
                    }),
                ));
            }

            if Instant::now() + TRY_ACQUIRE_POLL_INTERVAL > deadline {
                debug!(
                    target: "parley.lock",
                    key = key.as_i64(),
                    waited_ms = start.elapsed().as_millis() as u64,
                    "lock attempt window exhausted"
                );
                metrics::record_lock_acquisition("unavailable", start.elapsed());
                return Err(ParleyError::LockUnavailable(key.as_i64()));
            }

            tokio::time::sleep(TRY_ACQUIRE_POLL_INTERVAL).await;
        }
    }
}
