// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance logging.
//!
//! Every line an instance writes goes three ways: a tracing event under the
//! `direktiv::instance` target, a row in `instance_logs`, and, when the
//! workflow sets `logToEvents`, a `direktiv.instanceLog` CloudEvent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::events::CloudEvent;
use crate::persistence::Persistence;

/// Event type of published log lines.
pub const INSTANCE_LOG_EVENT: &str = "direktiv.instanceLog";

/// Publishes events into a namespace.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish `event` in `namespace`.
    async fn publish_event(&self, namespace: &str, event: CloudEvent) -> Result<(), EngineError>;
}

/// Log writer for one instance.
pub struct InstanceLogger {
    store: Arc<dyn Persistence>,
    namespace: String,
    instance_id: String,
    sink: Option<Arc<dyn EventSink>>,
}

impl InstanceLogger {
    /// Logger that only writes to tracing and storage.
    pub fn new(
        store: Arc<dyn Persistence>,
        namespace: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            instance_id: instance_id.into(),
            sink: None,
        }
    }

    /// Also publish each line as an event through `sink`.
    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Write one info line. Failures are reported but never propagate.
    pub async fn info(&self, message: &str) {
        self.write("info", message).await;
    }

    /// Write one error line.
    pub async fn error(&self, message: &str) {
        self.write("error", message).await;
    }

    async fn write(&self, level: &str, message: &str) {
        info!(
            target: "direktiv::instance",
            namespace = %self.namespace,
            instance_id = %self.instance_id,
            level,
            "{}",
            message
        );

        if let Err(e) = self
            .store
            .append_instance_log(&self.instance_id, &self.namespace, level, message)
            .await
        {
            warn!(instance_id = %self.instance_id, error = %e, "Failed to store instance log");
        }

        if let Some(sink) = &self.sink {
            let event = CloudEvent::new(INSTANCE_LOG_EVENT, self.instance_id.clone()).with_json(
                json!({
                    "instance": self.instance_id,
                    "level": level,
                    "msg": message,
                }),
            );
            if let Err(e) = sink.publish_event(&self.namespace, event).await {
                warn!(instance_id = %self.instance_id, error = %e, "Failed to publish instance log");
            }
        }
    }
}
