// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for direktiv-core.
//!
//! This module defines the storage abstraction the engine runs on:
//!
//! | Trait | Postgres | In-memory |
//! |-------|----------|-----------|
//! | [`Persistence`] | [`PostgresPersistence`] | [`MemoryPersistence`] |
//! | [`LockManager`] | [`PostgresLocks`] | [`MemoryLocks`] |
//! | [`MessageBus`] | [`PostgresBus`] | [`MemoryBus`] |
//!
//! The in-memory backends share the semantics of the Postgres ones within a
//! single process and back the engine test-suite.

pub mod locks;
pub mod memory;
pub mod notify;
pub mod postgres;

pub use self::locks::{LockGuard, LockManager, MemoryLocks, PostgresLocks, lock_key};
pub use self::memory::MemoryPersistence;
pub use self::notify::{MemoryBus, MessageBus, PostgresBus};
pub use self::postgres::{PostgresPersistence, begin_serializable};

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktiv_dsl::EventTemplate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;

// ============================================================================
// Paging
// ============================================================================

/// Offset pagination. A limit of zero means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    /// Rows to skip.
    pub offset: i64,
    /// Maximum rows to return, 0 for all.
    pub limit: i64,
}

impl Page {
    /// Everything.
    pub const ALL: Page = Page {
        offset: 0,
        limit: 0,
    };

    /// Page with the given offset and limit.
    pub fn new(offset: i64, limit: i64) -> Self {
        Self { offset, limit }
    }

    pub(crate) fn apply<T>(&self, rows: impl Iterator<Item = T>) -> Vec<T> {
        let skipped = rows.skip(self.offset.max(0) as usize);
        if self.limit > 0 {
            skipped.take(self.limit as usize).collect()
        } else {
            skipped.collect()
        }
    }
}

// ============================================================================
// Namespaces and Workflows
// ============================================================================

/// Namespace record.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct NamespaceRecord {
    /// Unique name.
    pub name: String,
    /// When the namespace was created.
    pub created_at: DateTime<Utc>,
}

/// Returns true if `name` is a valid namespace name.
pub fn is_valid_namespace_name(name: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-z][a-z0-9._-]{1,34}[a-z0-9]$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

/// Workflow record.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct WorkflowRecord {
    /// Workflow id.
    pub id: Uuid,
    /// Owning namespace.
    pub namespace: String,
    /// Name, unique per namespace.
    pub name: String,
    /// Monotone revision, bumped on each update.
    pub revision: i32,
    /// Inactive workflows are not started by crons or events.
    pub active: bool,
    /// Raw YAML document.
    pub document: Vec<u8>,
    /// Description.
    pub description: Option<String>,
    /// Publish instance logs as CloudEvents.
    pub log_to_events: bool,
    /// When the workflow was created.
    pub created_at: DateTime<Utc>,
    /// When the workflow was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Fields for a new workflow.
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    /// Owning namespace.
    pub namespace: String,
    /// Name, unique per namespace.
    pub name: String,
    /// Raw YAML document.
    pub document: Vec<u8>,
    /// Description.
    pub description: Option<String>,
    /// Initial active flag.
    pub active: bool,
    /// Publish instance logs as CloudEvents.
    pub log_to_events: bool,
}

/// Changes applied by [`Persistence::update_workflow`]. `None` keeps a field.
#[derive(Debug, Clone, Default)]
pub struct WorkflowUpdate {
    /// New document.
    pub document: Option<Vec<u8>>,
    /// New description.
    pub description: Option<String>,
    /// New active flag.
    pub active: Option<bool>,
    /// New log publishing flag.
    pub log_to_events: Option<bool>,
}

// ============================================================================
// Instances
// ============================================================================

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "instance_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Enqueued or suspended.
    Pending,
    /// A step is executing.
    Running,
    /// Finished successfully.
    Complete,
    /// Finished with a workflow error.
    Failed,
    /// Cancelled by API, timeout or parent.
    Cancelled,
    /// Finished with an internal error.
    Crashed,
}

impl InstanceStatus {
    /// Pending and running are the active statuses.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference from a child instance back to the step that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    /// Parent instance id.
    pub instance_id: String,
    /// Parent state id.
    pub state: String,
    /// Parent step.
    pub step: i32,
    /// Nesting depth of the child.
    pub depth: i32,
    /// Child id as known to the parent's state logic.
    pub action_id: String,
}

/// Outcome of [`Persistence::cancel_instance`].
#[derive(Debug, Clone, PartialEq)]
pub struct CancelledInstance {
    /// The instance as stored after cancellation.
    pub instance: InstanceRecord,
    /// Names of the timers deleted with it.
    pub timers: Vec<String>,
    /// Event listeners deleted with it.
    pub listeners: u64,
}

/// Instance record.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct InstanceRecord {
    /// `<namespace>/<workflow>/<6 letters>`.
    pub id: String,
    /// Owning namespace.
    pub namespace: String,
    /// Workflow the instance runs.
    pub workflow_id: Uuid,
    /// Workflow name at invocation time.
    pub workflow_name: String,
    /// Workflow revision snapshot.
    pub revision: i32,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// How the instance was started (api, cron, events, subflow).
    pub invoker: String,
    /// Input as received.
    pub input: Value,
    /// Current state data.
    pub state_data: Value,
    /// State ids visited, one per step.
    pub flow: Vec<String>,
    /// Saved continuation of the current step.
    pub memory: Option<Vec<u8>>,
    /// Deadline of the current step.
    pub deadline: Option<DateTime<Utc>>,
    /// Retries performed at the current step.
    pub attempts: i32,
    /// Terminal error code.
    pub error_code: Option<String>,
    /// Terminal error message.
    pub error_message: Option<String>,
    /// Output of a completed instance.
    pub output: Option<Value>,
    /// Parent reference for subflows, as JSON.
    pub invoked_by: Option<Value>,
    /// Hostname of the node that last stepped the instance.
    pub controller: String,
    /// Creation time.
    pub begin_time: DateTime<Utc>,
    /// When the current state was entered.
    pub state_begin_time: Option<DateTime<Utc>>,
    /// Set once the instance reaches a terminal status.
    pub end_time: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Current step; equals the length of the flow.
    pub fn step(&self) -> i32 {
        self.flow.len() as i32
    }

    /// State the instance is in.
    pub fn current_state(&self) -> Option<&str> {
        self.flow.last().map(String::as_str)
    }

    /// Pending or running.
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Parent reference, if the instance is a subflow.
    pub fn caller(&self) -> Option<CallerInfo> {
        self.invoked_by
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Subflow depth; top level instances are at depth 0.
    pub fn depth(&self) -> i32 {
        self.caller().map(|c| c.depth).unwrap_or(0)
    }
}

/// Fields for a new instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    /// Instance id.
    pub id: String,
    /// Owning namespace.
    pub namespace: String,
    /// Workflow id.
    pub workflow_id: Uuid,
    /// Workflow name.
    pub workflow_name: String,
    /// Revision snapshot.
    pub revision: i32,
    /// Invoker kind.
    pub invoker: String,
    /// Input, also the initial state data.
    pub input: Value,
    /// Creating node.
    pub controller: String,
    /// Parent reference.
    pub invoked_by: Option<CallerInfo>,
}

// ============================================================================
// Timers
// ============================================================================

/// Timer record.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TimerRecord {
    /// Timer id.
    pub id: Uuid,
    /// Unique name.
    pub name: String,
    /// Registered handler invoked on fire.
    pub handler: String,
    /// Cron pattern, for recurring timers.
    pub cron: Option<String>,
    /// Fire time, for one-shot timers.
    pub one_shot: Option<DateTime<Utc>>,
    /// Opaque handler payload.
    pub payload: Vec<u8>,
    /// Tick the timer last fired for.
    pub last_fired: Option<DateTime<Utc>>,
    /// Disabled timers stay scheduled but do not fire.
    pub enabled: bool,
    /// When the timer was created.
    pub created_at: DateTime<Utc>,
}

/// Fields for a new timer. Exactly one of `cron` and `one_shot` is set.
#[derive(Debug, Clone)]
pub struct NewTimer {
    /// Unique name; an existing timer with the same name is replaced.
    pub name: String,
    /// Handler name.
    pub handler: String,
    /// Cron pattern.
    pub cron: Option<String>,
    /// Fire time.
    pub one_shot: Option<DateTime<Utc>>,
    /// Handler payload.
    pub payload: Vec<u8>,
}

// ============================================================================
// Events
// ============================================================================

/// Event listener record.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct EventListenerRecord {
    /// Listener id.
    pub id: Uuid,
    /// Namespace events are received in.
    pub namespace: String,
    /// Owning workflow.
    pub workflow_id: Uuid,
    /// Owning instance; `None` for workflow start listeners.
    pub instance_id: Option<String>,
    /// JSON array of event templates.
    pub events: Value,
    /// Extension keys used for correlation.
    pub correlation: Vec<String>,
    /// Events needed before the listener fires.
    pub event_count: i32,
    /// Resume signature for instance listeners.
    pub signature: Option<Vec<u8>>,
    /// How long partially filled waits are kept.
    pub lifespan_secs: Option<i64>,
    /// When the listener was created.
    pub created_at: DateTime<Utc>,
}

impl EventListenerRecord {
    /// Decode the event templates.
    pub fn templates(&self) -> Vec<EventTemplate> {
        serde_json::from_value(self.events.clone()).unwrap_or_default()
    }
}

/// Instance log line.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct InstanceLogRecord {
    /// Sequence id.
    pub id: i64,
    /// Instance the line belongs to.
    pub instance_id: String,
    /// Namespace of the instance.
    pub namespace: String,
    /// Level name.
    pub level: String,
    /// Message.
    pub message: String,
    /// When the line was written.
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Persistence Trait
// ============================================================================

/// Persistence interface used by the engine, timers and the event router.
#[async_trait]
#[allow(missing_docs)]
pub trait Persistence: Send + Sync {
    // === Namespaces ===
    async fn create_namespace(&self, name: &str) -> Result<NamespaceRecord, CoreError>;

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>, CoreError>;

    async fn list_namespaces(&self, page: Page) -> Result<Vec<NamespaceRecord>, CoreError>;

    /// Delete a namespace and everything it owns.
    async fn delete_namespace(&self, name: &str) -> Result<(), CoreError>;

    // === Workflows ===
    /// Create a workflow at revision 1 and store its first snapshot.
    async fn create_workflow(&self, workflow: &NewWorkflow) -> Result<WorkflowRecord, CoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRecord>, CoreError>;

    async fn get_workflow_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkflowRecord>, CoreError>;

    async fn list_workflows(
        &self,
        namespace: &str,
        page: Page,
    ) -> Result<Vec<WorkflowRecord>, CoreError>;

    /// Apply an update, bumping the revision by one.
    ///
    /// Fails with [`CoreError::AlreadyUpdated`] when `expected_revision` is set
    /// and does not match.
    async fn update_workflow(
        &self,
        id: Uuid,
        expected_revision: Option<i32>,
        update: &WorkflowUpdate,
    ) -> Result<WorkflowRecord, CoreError>;

    /// Document stored for a revision.
    async fn get_workflow_revision(
        &self,
        id: Uuid,
        revision: i32,
    ) -> Result<Option<Vec<u8>>, CoreError>;

    async fn delete_workflow(&self, id: Uuid) -> Result<(), CoreError>;

    // === Instances ===
    async fn create_instance(&self, instance: &NewInstance) -> Result<InstanceRecord, CoreError>;

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, CoreError>;

    /// Instances of a namespace, newest first.
    async fn list_instances(
        &self,
        namespace: &str,
        page: Page,
    ) -> Result<Vec<InstanceRecord>, CoreError>;

    /// Write the mutable fields of an active instance.
    ///
    /// Fails with [`CoreError::InvalidInstanceState`] once the stored row is
    /// terminal, so a late step cannot overwrite a cancellation.
    async fn save_instance(&self, instance: &InstanceRecord) -> Result<(), CoreError>;

    /// Instances created in a namespace since `since`.
    async fn count_instances_since(
        &self,
        namespace: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, CoreError>;

    /// Transactionally cancel an active instance and delete its timers and
    /// event listeners.
    ///
    /// Returns `None` when the instance is already terminal.
    async fn cancel_instance(
        &self,
        id: &str,
        code: &str,
        message: &str,
    ) -> Result<Option<CancelledInstance>, CoreError>;

    async fn list_instances_by_controller(
        &self,
        controller: &str,
        status: InstanceStatus,
    ) -> Result<Vec<InstanceRecord>, CoreError>;

    // === Timers ===
    /// Insert a timer, replacing any timer with the same name.
    async fn upsert_timer(&self, timer: &NewTimer) -> Result<TimerRecord, CoreError>;

    async fn get_timer(&self, name: &str) -> Result<Option<TimerRecord>, CoreError>;

    async fn get_timer_by_id(&self, id: Uuid) -> Result<Option<TimerRecord>, CoreError>;

    async fn list_timers(&self) -> Result<Vec<TimerRecord>, CoreError>;

    /// Returns true if a timer was deleted.
    async fn delete_timer(&self, name: &str) -> Result<bool, CoreError>;

    /// Delete every timer whose name starts with `prefix`, returning their names.
    async fn delete_timers_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CoreError>;

    async fn set_timer_last_fired(&self, name: &str, at: DateTime<Utc>)
    -> Result<(), CoreError>;

    /// Returns true if the timer exists.
    async fn set_timer_enabled(&self, name: &str, enabled: bool) -> Result<bool, CoreError>;

    /// Delete one-shot timers due before `before`, returning their names.
    async fn delete_overdue_one_shots(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError>;

    // === Event listeners ===
    async fn create_listener(&self, listener: &EventListenerRecord) -> Result<(), CoreError>;

    async fn get_listener(&self, id: Uuid) -> Result<Option<EventListenerRecord>, CoreError>;

    /// Listeners in a namespace with a template for `event_type`.
    async fn find_listeners(
        &self,
        namespace: &str,
        event_type: &str,
    ) -> Result<Vec<EventListenerRecord>, CoreError>;

    async fn delete_listener(&self, id: Uuid) -> Result<(), CoreError>;

    async fn delete_instance_listeners(&self, instance_id: &str) -> Result<u64, CoreError>;

    /// Delete the start listeners (no owning instance) of a workflow.
    async fn delete_start_listeners(&self, workflow_id: Uuid) -> Result<u64, CoreError>;

    /// Store an event in the oldest wait of `listener_id` whose `slot` is empty
    /// and whose filled slots all belong to `slots`, creating a wait when none
    /// has room. Slot names carry the correlation values, so `slots` selects
    /// the correlation group.
    ///
    /// Waits created before `expire_before` are discarded first. When every
    /// slot of the wait is filled the wait is deleted and its slots returned.
    async fn store_event_wait(
        &self,
        listener_id: Uuid,
        slot: &str,
        slots: &[String],
        event: &str,
        expire_before: Option<DateTime<Utc>>,
    ) -> Result<Option<HashMap<String, String>>, CoreError>;

    // === Instance logs ===
    async fn append_instance_log(
        &self,
        instance_id: &str,
        namespace: &str,
        level: &str,
        message: &str,
    ) -> Result<(), CoreError>;

    async fn list_instance_logs(
        &self,
        instance_id: &str,
        page: Page,
    ) -> Result<Vec<InstanceLogRecord>, CoreError>;

    /// Check that storage is reachable.
    async fn health_check(&self) -> Result<(), CoreError>;
}
