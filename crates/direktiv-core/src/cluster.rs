// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster synchronisation over the database notify channel.
//!
//! Every node subscribes to one channel. Timer changes and cancellations are
//! published as small JSON messages; a node skips messages it sent itself and
//! never re-broadcasts what it receives.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::persistence::MessageBus;

/// Channel all nodes listen on.
pub const CLUSTER_CHANNEL: &str = "direktiv_cluster";

/// Commands exchanged between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterCommand {
    /// A timer was added; `id` is the timer id.
    AddTimer,
    /// A timer was deleted; `id` is the timer name.
    DeleteTimer,
    /// A timer was enabled; `id` is the timer name.
    EnableTimer,
    /// A timer was disabled; `id` is the timer name.
    DisableTimer,
    /// Stop a running action; `id` is the action id.
    CancelIsolate,
    /// Stop a running subflow; `id` is the instance id.
    CancelSubflow,
}

/// Wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMessage {
    /// Command.
    pub cmd: ClusterCommand,
    /// Node that published the message.
    pub sender_id: String,
    /// Command argument.
    pub id: String,
}

/// Receives messages published by other nodes.
#[async_trait]
pub trait ClusterHandler: Send + Sync {
    /// Apply one message.
    async fn handle_cluster_message(&self, message: ClusterMessage);
}

/// Publisher and subscription loop for [`ClusterMessage`]s.
pub struct ClusterSync {
    bus: Arc<dyn MessageBus>,
    node_id: String,
    shutdown: Arc<Notify>,
}

impl ClusterSync {
    /// Create a cluster sync for the node `node_id`.
    pub fn new(bus: Arc<dyn MessageBus>, node_id: impl Into<String>) -> Self {
        Self {
            bus,
            node_id: node_id.into(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Id this node publishes under.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Publish a command to the other nodes.
    pub async fn broadcast(&self, cmd: ClusterCommand, id: &str) -> Result<(), CoreError> {
        let message = ClusterMessage {
            cmd,
            sender_id: self.node_id.clone(),
            id: id.to_string(),
        };
        let payload = serde_json::to_string(&message)?;
        debug!(?cmd, id, "broadcasting cluster message");
        self.bus.publish(CLUSTER_CHANNEL, &payload).await
    }

    /// Subscribe and dispatch messages to `handler` until shutdown or until
    /// the handler is dropped.
    ///
    /// The subscription is established before this returns.
    pub async fn start(&self, handler: Weak<dyn ClusterHandler>) -> Result<JoinHandle<()>, CoreError> {
        let mut messages = self.bus.subscribe(CLUSTER_CHANNEL).await?;
        let node_id = self.node_id.clone();
        let shutdown = self.shutdown.clone();

        info!(node_id = %node_id, "cluster sync started");

        Ok(tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    biased;

                    _ = shutdown.notified() => break,

                    payload = messages.next() => match payload {
                        Some(payload) => payload,
                        None => {
                            warn!("cluster channel closed");
                            break;
                        }
                    },
                };

                let message: ClusterMessage = match serde_json::from_str(&payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed cluster message");
                        continue;
                    }
                };

                if message.sender_id == node_id {
                    continue;
                }

                let Some(handler) = handler.upgrade() else {
                    break;
                };
                handler.handle_cluster_message(message).await;
            }

            info!(node_id = %node_id, "cluster sync stopped");
        }))
    }
}
