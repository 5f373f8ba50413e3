// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Publish/subscribe channels between nodes.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::CoreError;

/// Named broadcast channels carrying string payloads.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver `payload` to every subscriber of `channel`, including the sender.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CoreError>;

    /// Stream of payloads published on `channel` from now on.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CoreError>;
}

/// `pg_notify` / `LISTEN` based bus.
#[derive(Clone)]
pub struct PostgresBus {
    pool: PgPool,
}

impl PostgresBus {
    /// Bus over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageBus for PostgresBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CoreError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CoreError> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;

        let stream = listener.into_stream().filter_map(|item| async move {
            match item {
                Ok(notification) => Some(notification.payload().to_string()),
                Err(e) => {
                    warn!(error = %e, "notification listener error");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

const MEMORY_CHANNEL_CAPACITY: usize = 1024;

/// In-process bus; clones share channels.
#[derive(Clone, Default)]
pub struct MemoryBus {
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBus {
    /// Bus without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(MEMORY_CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), CoreError> {
        // No subscribers is not an error.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, CoreError> {
        let receiver = self.sender(channel).subscribe();
        let stream = futures::stream::unfold(receiver, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
