//! Distributed scheduler locks
//!
//! Postgres advisory locks keyed by name, so only one of several
//! concurrently running scheduler replicas executes a given periodic task
//! per tick. Lock ids come from an explicit `named_lock` mapping table
//! rather than a string hash, which keeps unrelated lock names from
//! colliding on the same 64-bit id.
//!
//! Advisory locks are session scoped: the guard pins the pooled connection
//! it locked on and the lock is released on that same connection. There is
//! no fairness, queuing or lease expiry; a holder that crashes without
//! releasing frees the lock when its connection dies.
//!
//! An in-memory backend provides the same try/skip semantics for tests
//! and single-process runs.

use std::collections::HashSet;
use std::sync::Mutex;

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::{error, info, warn};

use crate::error::BillingResult;

enum Backend {
    Postgres(PgPool),
    InMemory(Mutex<HashSet<String>>),
}

/// A held lock. For the Postgres backend this keeps its connection
/// checked out of the pool for as long as the lock is held.
pub struct LockGuard {
    name: String,
    session: Session,
}

enum Session {
    Postgres {
        conn: PoolConnection<Postgres>,
        lock_id: i64,
    },
    InMemory,
}

/// Named, non-blocking, re-entrant-free locks
pub struct LockService {
    backend: Backend,
}

impl LockService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::InMemory(Mutex::new(HashSet::new())),
        }
    }

    /// Try to acquire the named lock without blocking.
    /// Returns `None` when another session already holds it.
    pub async fn try_lock(&self, name: &str) -> BillingResult<Option<LockGuard>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let lock_id = self.lock_id(pool, name).await?;
                let mut conn = pool.acquire().await?;

                let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
                    .bind(lock_id)
                    .fetch_one(&mut *conn)
                    .await?;

                if acquired {
                    info!(name, lock_id, "Lock acquired");
                    Ok(Some(LockGuard {
                        name: name.to_string(),
                        session: Session::Postgres { conn, lock_id },
                    }))
                } else {
                    info!(name, lock_id, "Lock already held");
                    Ok(None)
                }
            }
            Backend::InMemory(held) => {
                let mut held = held.lock().unwrap_or_else(|p| p.into_inner());
                if held.insert(name.to_string()) {
                    info!(name, "Lock acquired");
                    Ok(Some(LockGuard {
                        name: name.to_string(),
                        session: Session::InMemory,
                    }))
                } else {
                    info!(name, "Lock already held");
                    Ok(None)
                }
            }
        }
    }

    /// Release a held lock on the session that acquired it
    pub async fn unlock(&self, guard: LockGuard) {
        match guard.session {
            Session::Postgres { mut conn, lock_id } => {
                let released: Result<(bool,), sqlx::Error> =
                    sqlx::query_as("SELECT pg_advisory_unlock($1)")
                        .bind(lock_id)
                        .fetch_one(&mut *conn)
                        .await;

                match released {
                    Ok((true,)) => info!(name = %guard.name, "Lock released"),
                    Ok((false,)) => warn!(name = %guard.name, "Lock was not held"),
                    // Dropping the connection releases the session lock anyway
                    Err(e) => error!(name = %guard.name, error = %e, "Error releasing lock"),
                }
            }
            Session::InMemory => {
                if let Backend::InMemory(held) = &self.backend {
                    let mut held = held.lock().unwrap_or_else(|p| p.into_inner());
                    held.remove(&guard.name);
                }
                info!(name = %guard.name, "Lock released");
            }
        }
    }

    /// Run `task` only if the named lock can be acquired, otherwise skip.
    /// The lock is released whether the task succeeds or fails.
    /// Returns `Ok(None)` when the lock was held elsewhere.
    pub async fn execute_with_lock<F, Fut, T>(
        &self,
        name: &str,
        task: F,
    ) -> BillingResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = BillingResult<T>>,
    {
        let guard = match self.try_lock(name).await? {
            Some(guard) => guard,
            None => {
                info!(name, "Could not acquire lock, skipping execution");
                return Ok(None);
            }
        };

        info!(name, "Executing task with lock");
        let result = task().await;
        self.unlock(guard).await;

        result.map(Some)
    }

    /// Stable 64-bit id for a lock name via the `named_lock` mapping table
    async fn lock_id(&self, pool: &PgPool, name: &str) -> BillingResult<i64> {
        sqlx::query("INSERT INTO named_lock (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(pool)
            .await?;

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM named_lock WHERE name = $1")
            .bind(name)
            .fetch_one(pool)
            .await?;
        Ok(id)
    }
}
