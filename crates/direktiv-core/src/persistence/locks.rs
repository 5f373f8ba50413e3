// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-wide advisory locks.
//!
//! Postgres session locks are bound to the connection that took them, so
//! [`PostgresLocks`] keeps the connection inside the [`LockGuard`] until the
//! lock is released. Connections come from a dedicated pool so lock holders
//! never starve regular queries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use tokio::sync::Notify;
use tracing::warn;

use crate::error::CoreError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Stable lock key: the first eight bytes of SHA-256 over the parts.
pub fn lock_key(parts: &[&str]) -> i64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

type Release = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A held lock. Call [`LockGuard::unlock`]; dropping releases it in the background.
pub struct LockGuard {
    key: i64,
    release: Option<Release>,
}

impl LockGuard {
    /// Guard for `key`; `release` runs once on unlock or drop.
    pub fn new<F>(key: i64, release: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            key,
            release: Some(Box::new(release)),
        }
    }

    /// The lock key.
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Release the lock.
    pub async fn unlock(mut self) {
        if let Some(release) = self.release.take() {
            release().await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(release());
                }
                Err(_) => warn!(key = self.key, "lock dropped outside a runtime"),
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

/// Advisory lock provider.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Take the lock if it is free.
    async fn try_lock(&self, key: i64) -> Result<Option<LockGuard>, CoreError>;

    /// Wait up to `wait` for the lock.
    async fn lock(&self, key: i64, wait: Duration) -> Result<LockGuard, CoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_lock(key).await? {
                return Ok(guard);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::LockTimeout { key });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Session advisory locks on a dedicated pool.
#[derive(Clone)]
pub struct PostgresLocks {
    pool: PgPool,
}

impl PostgresLocks {
    /// Locks over `pool`, which should not be shared with regular queries.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn advisory_unlock(mut conn: PoolConnection<sqlx::Postgres>, key: i64) {
    let result: Result<bool, sqlx::Error> = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .fetch_one(&mut *conn)
        .await;
    match result {
        Ok(true) => {}
        Ok(false) => warn!(key, "advisory lock was not held"),
        Err(e) => {
            warn!(key, error = %e, "failed to release advisory lock, closing connection");
            // Closing the session releases every lock it holds.
            let _ = conn.detach();
        }
    }
}

#[async_trait]
impl LockManager for PostgresLocks {
    async fn try_lock(&self, key: i64) -> Result<Option<LockGuard>, CoreError> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if !acquired {
            return Ok(None);
        }

        Ok(Some(LockGuard::new(key, move || {
            Box::pin(advisory_unlock(conn, key))
        })))
    }
}

/// Process-local locks.
#[derive(Clone, Default)]
pub struct MemoryLocks {
    held: Arc<DashSet<i64>>,
    released: Arc<Notify>,
}

impl MemoryLocks {
    /// No locks held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` is currently held.
    pub fn is_held(&self, key: i64) -> bool {
        self.held.contains(&key)
    }
}

#[async_trait]
impl LockManager for MemoryLocks {
    async fn try_lock(&self, key: i64) -> Result<Option<LockGuard>, CoreError> {
        if !self.held.insert(key) {
            return Ok(None);
        }
        let held = self.held.clone();
        let released = self.released.clone();
        Ok(Some(LockGuard::new(key, move || {
            Box::pin(async move {
                held.remove(&key);
                released.notify_waiters();
            })
        })))
    }

    async fn lock(&self, key: i64, wait: Duration) -> Result<LockGuard, CoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.released.notified();
            if let Some(guard) = self.try_lock(key).await? {
                return Ok(guard);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(CoreError::LockTimeout { key });
            }
            let _ = tokio::time::timeout((deadline - now).min(POLL_INTERVAL), notified).await;
        }
    }
}
