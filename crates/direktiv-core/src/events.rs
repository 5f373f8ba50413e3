// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CloudEvents and the event router.
//!
//! Listeners are stored with their event templates. An inbound event wakes
//! every listener in its namespace that has a template for the event's type
//! and whose context filters match. Listeners that need more than one event
//! collect them in correlation waits: each event lands in a slot named by a
//! hash of its type and the listener's correlation values, and the listener
//! fires once every slot of a wait is filled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use direktiv_dsl::EventTemplate;
use direktiv_workflows::matching::glob_match;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{CoreError, EngineError};
use crate::persistence::{EventListenerRecord, LockManager, Persistence, lock_key};

/// CloudEvents spec version used for generated events.
pub const SPEC_VERSION: &str = "0.3";

/// A CloudEvent (structured JSON mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudEvent {
    /// Spec version.
    #[serde(default = "default_spec_version")]
    pub specversion: String,
    /// Event id.
    pub id: String,
    /// Producer.
    pub source: String,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Content type of `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// Subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Occurrence time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// JSON payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Binary payload, base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_base64: Option<String>,
    /// Extension attributes.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

fn default_spec_version() -> String {
    SPEC_VERSION.to_string()
}

impl CloudEvent {
    /// New event with a random id and the current time.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            specversion: SPEC_VERSION.to_string(),
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type: event_type.into(),
            datacontenttype: None,
            subject: None,
            time: Some(Utc::now()),
            data: None,
            data_base64: None,
            extensions: Map::new(),
        }
    }

    /// Attach a JSON payload.
    pub fn with_json(mut self, data: Value) -> Self {
        self.datacontenttype = Some("application/json".to_string());
        self.data = Some(data);
        self.data_base64 = None;
        self
    }

    /// Attach raw bytes with a content type.
    pub fn with_binary(mut self, content_type: impl Into<String>, bytes: &[u8]) -> Self {
        self.datacontenttype = Some(content_type.into());
        self.data = None;
        self.data_base64 = Some(BASE64.encode(bytes));
        self
    }

    /// Set an extension attribute.
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Check the required attributes.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("event id is empty".to_string());
        }
        if self.source.is_empty() {
            return Err("event source is empty".to_string());
        }
        if self.event_type.is_empty() {
            return Err("event type is empty".to_string());
        }
        Ok(())
    }

    /// Context attribute by name: standard attributes first, then extensions.
    pub fn attribute(&self, key: &str) -> Option<Value> {
        match key {
            "id" => Some(Value::String(self.id.clone())),
            "source" => Some(Value::String(self.source.clone())),
            "type" => Some(Value::String(self.event_type.clone())),
            "specversion" => Some(Value::String(self.specversion.clone())),
            "datacontenttype" => self.datacontenttype.clone().map(Value::String),
            "subject" => self.subject.clone().map(Value::String),
            "time" => self.time.map(|t| Value::String(t.to_rfc3339())),
            _ => self.extensions.get(key).cloned(),
        }
    }

    /// Event as a JSON value, the form stored into instance data.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Returns true if every context filter of `template` matches `event`.
///
/// String filters are glob patterns against string attributes; anything else
/// compares for equality. A filter on an absent attribute never matches.
pub fn matches_template(template: &EventTemplate, event: &CloudEvent) -> bool {
    if template.event_type != event.event_type {
        return false;
    }
    template.context.iter().all(|(key, filter)| {
        let Some(actual) = event.attribute(key) else {
            return false;
        };
        match (filter, &actual) {
            (Value::String(pattern), Value::String(text)) => glob_match(pattern, text),
            _ => *filter == actual,
        }
    })
}

fn attribute_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Correlation values of `event` for `keys`, or `None` if any key is missing.
pub fn correlation_values(keys: &[String], event: &CloudEvent) -> Option<Vec<String>> {
    keys.iter()
        .map(|key| event.attribute(key).map(|v| attribute_text(&v)))
        .collect()
}

/// Slot name for an event type within one correlation group.
pub fn slot_hash(event_type: &str, values: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    for value in values {
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Receiver of fired listeners.
#[async_trait]
pub trait EventWaker: Send + Sync {
    /// Resume the instance suspended under `signature` with `events`.
    async fn wake_events(&self, signature: &[u8], events: Vec<CloudEvent>)
    -> Result<(), EngineError>;

    /// Start `workflow_id` with `events`.
    async fn events_invoke(
        &self,
        workflow_id: Uuid,
        events: Vec<CloudEvent>,
    ) -> Result<(), EngineError>;
}

/// Fields for a new listener.
#[derive(Debug, Clone)]
pub struct NewListener {
    /// Namespace events are received in.
    pub namespace: String,
    /// Owning workflow.
    pub workflow_id: Uuid,
    /// Owning instance, for listeners that resume a suspended step.
    pub instance_id: Option<String>,
    /// Event templates.
    pub templates: Vec<EventTemplate>,
    /// Correlation keys.
    pub correlation: Vec<String>,
    /// Events needed to fire; 1 for single-event listeners.
    pub count: usize,
    /// Resume signature for instance listeners.
    pub signature: Option<Vec<u8>>,
    /// How long partially filled waits are kept.
    pub lifespan: Option<Duration>,
}

/// Routes inbound events to listeners.
pub struct EventRouter {
    store: Arc<dyn Persistence>,
    locks: Arc<dyn LockManager>,
    lock_wait: Duration,
}

impl EventRouter {
    /// Create a router.
    pub fn new(store: Arc<dyn Persistence>, locks: Arc<dyn LockManager>, lock_wait: Duration) -> Self {
        Self {
            store,
            locks,
            lock_wait,
        }
    }

    /// Store a listener and return its id.
    pub async fn add_listener(&self, listener: NewListener) -> Result<Uuid, CoreError> {
        let record = EventListenerRecord {
            id: Uuid::new_v4(),
            namespace: listener.namespace,
            workflow_id: listener.workflow_id,
            instance_id: listener.instance_id,
            events: serde_json::to_value(&listener.templates)?,
            correlation: listener.correlation,
            event_count: listener.count.max(1) as i32,
            signature: listener.signature,
            lifespan_secs: listener.lifespan.map(|d| d.as_secs() as i64),
            created_at: Utc::now(),
        };
        self.store.create_listener(&record).await?;
        debug!(listener_id = %record.id, "event listener added");
        Ok(record.id)
    }

    /// Deliver `event` to every matching listener of `namespace`.
    ///
    /// Returns the number of listeners that fired.
    #[instrument(skip(self, event, waker), fields(event_type = %event.event_type, event_id = %event.id))]
    pub async fn route(
        &self,
        namespace: &str,
        event: &CloudEvent,
        waker: &dyn EventWaker,
    ) -> Result<usize, CoreError> {
        let listeners = self
            .store
            .find_listeners(namespace, &event.event_type)
            .await?;

        let mut fired = 0;
        for listener in listeners {
            let key = lock_key(&[
                "listener",
                &listener.id.to_string(),
                &listener.workflow_id.to_string(),
            ]);
            let guard = match self.locks.lock(key, self.lock_wait).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(listener_id = %listener.id, error = %e, "Failed to lock listener");
                    continue;
                }
            };

            let result = self.deliver(listener.id, event, waker).await;
            guard.unlock().await;

            match result {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => error!(listener_id = %listener.id, error = %e, "Failed to deliver event"),
            }
        }

        info!(namespace, fired, "event routed");
        Ok(fired)
    }

    async fn deliver(
        &self,
        listener_id: Uuid,
        event: &CloudEvent,
        waker: &dyn EventWaker,
    ) -> Result<bool, CoreError> {
        // Re-read under the lock; instance listeners vanish once fired.
        let Some(listener) = self.store.get_listener(listener_id).await? else {
            return Ok(false);
        };

        let templates = listener.templates();
        if !templates.iter().any(|t| matches_template(t, event)) {
            return Ok(false);
        }

        let events = if listener.event_count <= 1 {
            vec![event.clone()]
        } else {
            let Some(values) = correlation_values(&listener.correlation, event) else {
                debug!(%listener_id, "event lacks correlation keys, discarded");
                return Ok(false);
            };
            let slots: Vec<String> = templates
                .iter()
                .map(|t| slot_hash(&t.event_type, &values))
                .collect();
            let slot = slot_hash(&event.event_type, &values);
            let encoded = BASE64.encode(serde_json::to_vec(event)?);
            let expire_before = listener
                .lifespan_secs
                .map(|secs| Utc::now() - chrono::Duration::seconds(secs));

            let Some(filled) = self
                .store
                .store_event_wait(listener_id, &slot, &slots, &encoded, expire_before)
                .await?
            else {
                return Ok(false);
            };
            decode_wait(&slots, &filled)?
        };

        self.fire(&listener, events, waker).await;
        Ok(true)
    }

    async fn fire(&self, listener: &EventListenerRecord, events: Vec<CloudEvent>, waker: &dyn EventWaker) {
        let result = match &listener.signature {
            Some(signature) => {
                if let Err(e) = self.store.delete_listener(listener.id).await {
                    error!(listener_id = %listener.id, error = %e, "Failed to delete fired listener");
                }
                waker.wake_events(signature, events).await
            }
            None => waker.events_invoke(listener.workflow_id, events).await,
        };
        if let Err(e) = result {
            error!(listener_id = %listener.id, error = %e, "listener wake failed");
        }
    }
}

fn decode_wait(
    slots: &[String],
    filled: &HashMap<String, String>,
) -> Result<Vec<CloudEvent>, CoreError> {
    let mut events = Vec::with_capacity(slots.len());
    for slot in slots {
        let Some(encoded) = filled.get(slot) else {
            continue;
        };
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| CoreError::database("decode event wait", e))?;
        events.push(serde_json::from_slice(&bytes)?);
    }
    Ok(events)
}
