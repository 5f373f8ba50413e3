// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance engine.
//!
//! The engine owns every moving part of a node: the timer manager, the event
//! router, cluster sync and the sandbox. Instances advance one step at a
//! time; each step runs on its own task under the instance's advisory lock
//! and a per-node permit:
//!
//! ```text
//!  invoke ──► create row ──► transition(start) ──► schedule(step 1)
//!                                                        │
//!          ┌─────────────────────────────────────────────┘
//!          ▼
//!   permit + lock ──► reload ──► stale? drop
//!          │
//!          ▼
//!   StateLogic::run(savedata, wakedata)
//!     ├─ suspended ─► save memory, pending ─► timer / event / child result ─► schedule(step)
//!     ├─ transition ─► transform ─► leave step ─► transition(next) ─► schedule(step + 1)
//!     ├─ done ──────► complete ─► report to caller
//!     └─ error ─────► catchers ─► retry ─► fail / crash ─► report to caller
//! ```
//!
//! Nothing about a suspended instance lives in memory: wakeups are timers,
//! listeners and child reports, all persisted, so any node can resume any
//! instance.

mod context;
mod handlers;
mod invoke;
mod lifecycle;
mod step;
mod workflows;

pub use invoke::new_instance_id;
pub use step::retry_delay;

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use direktiv_dsl::{Workflow, parse_workflow};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::actions::Sandbox;
use crate::cluster::{ClusterHandler, ClusterSync};
use crate::config::EngineConfig;
use crate::error::{CoreError, EngineError};
use crate::events::EventRouter;
use crate::persistence::{LockManager, MessageBus, Persistence};
use crate::timers::{TimerConfig, TimerManager};
use crate::vars::{SecretStore, VariableStore};

/// Timer handler resuming a delayed step.
pub const SLEEP_WAKEUP: &str = "sleepWakeup";
/// Timer handler re-running a step after a retry delay.
pub const RETRY_WAKEUP: &str = "retryWakeup";
/// Timer handler raising a soft timeout.
pub const SOFT_CANCEL: &str = "softCancel";
/// Timer handler cancelling an instance at its kill bound.
pub const HARD_CANCEL: &str = "hardCancel";
/// Timer handler starting scheduled workflows.
pub const CRON_INVOKE: &str = "cronInvoke";

/// Name of the cron timer of a scheduled workflow.
pub fn cron_timer_name(workflow_id: Uuid) -> String {
    format!("cron:{}", workflow_id)
}

/// Everything an [`Engine`] runs on.
pub struct EngineParts {
    /// Storage.
    pub store: Arc<dyn Persistence>,
    /// Advisory locks.
    pub locks: Arc<dyn LockManager>,
    /// Cluster pub/sub.
    pub bus: Arc<dyn MessageBus>,
    /// Container call backend.
    pub sandbox: Arc<dyn Sandbox>,
    /// Variable storage.
    pub variables: Arc<dyn VariableStore>,
    /// Secret storage.
    pub secrets: Arc<dyn SecretStore>,
    /// Limits.
    pub config: EngineConfig,
    /// Timer manager settings.
    pub timers: TimerConfig,
}

/// A parsed workflow revision.
pub(crate) struct Snapshot {
    pub(crate) workflow: Workflow,
    pub(crate) log_to_events: bool,
}

/// Reference to one step of an instance; payload of wakeup timers and
/// the signature of instance listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StepRef {
    pub(crate) instance_id: String,
    pub(crate) step: i32,
}

/// Payload of soft timeout timers. Workflow interrupts carry no step and
/// hit whichever step is current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TimeoutRef {
    pub(crate) instance_id: String,
    #[serde(default)]
    pub(crate) step: Option<i32>,
}

/// Payload of cron timers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CronRef {
    pub(crate) workflow_id: Uuid,
}

/// The workflow engine of one node.
pub struct Engine {
    store: Arc<dyn Persistence>,
    locks: Arc<dyn LockManager>,
    cluster: Arc<ClusterSync>,
    timers: Arc<TimerManager>,
    router: EventRouter,
    sandbox: Arc<dyn Sandbox>,
    variables: Arc<dyn VariableStore>,
    secrets: Arc<dyn SecretStore>,
    config: EngineConfig,
    steps: Arc<Semaphore>,
    cancels: DashMap<String, CancellationToken>,
    snapshots: DashMap<(Uuid, i32), Arc<Snapshot>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    this: Weak<Engine>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("node_id", &self.cluster.node_id())
            .field("hostname", &self.config.hostname)
            .field("cancels", &self.cancels.len())
            .finish()
    }
}

impl Engine {
    /// Build an engine and register its timer handlers. Nothing runs until
    /// [`Engine::start`].
    pub fn new(parts: EngineParts) -> Result<Arc<Self>, EngineError> {
        let short = Uuid::new_v4().simple().to_string();
        let node_id = format!("{}-{}", parts.config.hostname, &short[..8]);
        let cluster = Arc::new(ClusterSync::new(parts.bus, node_id));
        let timers = TimerManager::new(
            parts.store.clone(),
            parts.locks.clone(),
            cluster.clone(),
            parts.timers,
        );
        let router = EventRouter::new(
            parts.store.clone(),
            parts.locks.clone(),
            parts.config.lock_wait,
        );
        let permits = parts.config.max_concurrent_steps.max(1);

        let engine = Arc::new_cyclic(|this| Engine {
            store: parts.store,
            locks: parts.locks,
            cluster,
            timers,
            router,
            sandbox: parts.sandbox,
            variables: parts.variables,
            secrets: parts.secrets,
            config: parts.config,
            steps: Arc::new(Semaphore::new(permits)),
            cancels: DashMap::new(),
            snapshots: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            this: this.clone(),
        });
        engine.register_timer_handlers()?;
        Ok(engine)
    }

    /// Subscribe to the cluster channel, schedule stored timers and resume
    /// instances this node was running.
    pub async fn start(&self) -> Result<(), EngineError> {
        let handler: Weak<dyn ClusterHandler> = self.this.clone();
        let sync = self.cluster.start(handler).await?;
        self.timers.start().await?;
        let timers = self.timers.clone();
        let sweeper = tokio::spawn(async move { timers.run().await });
        self.tasks.lock().await.extend([sync, sweeper]);

        let resumed = self.kickstart().await?;
        info!(
            node_id = %self.cluster.node_id(),
            hostname = %self.config.hostname,
            resumed,
            "Engine started"
        );
        Ok(())
    }

    /// Stop background loops. Instances stay where they are and resume on
    /// the next start of any node.
    pub async fn shutdown(&self) {
        self.cluster.shutdown_handle().notify_one();
        self.timers.shutdown_handle().notify_one();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                tracing::warn!(error = %e, "Engine task ended abnormally");
            }
        }
        info!(node_id = %self.cluster.node_id(), "Engine stopped");
    }

    /// Cluster id of this node.
    pub fn node_id(&self) -> &str {
        self.cluster.node_id()
    }

    /// Engine limits.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Storage the engine runs on.
    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    /// Instances with a step in progress on this node.
    pub fn stepping_instances(&self) -> usize {
        self.cancels.len()
    }

    /// Names of the timers scheduled on this node.
    pub fn scheduled_timers(&self) -> Vec<String> {
        self.timers.scheduled()
    }

    /// Parsed revision of a workflow, cached per `(id, revision)`.
    pub(crate) async fn snapshot(
        &self,
        workflow_id: Uuid,
        revision: i32,
    ) -> Result<Arc<Snapshot>, EngineError> {
        if let Some(snapshot) = self.snapshots.get(&(workflow_id, revision)) {
            return Ok(snapshot.clone());
        }

        let record = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| CoreError::not_found("workflow", workflow_id.to_string()))?;
        let document = self
            .store
            .get_workflow_revision(workflow_id, revision)
            .await?
            .ok_or_else(|| {
                CoreError::not_found("workflow revision", format!("{}@{}", workflow_id, revision))
            })?;
        let workflow = parse_workflow(&document).map_err(EngineError::internal)?;

        let snapshot = Arc::new(Snapshot {
            workflow,
            log_to_events: record.log_to_events,
        });
        self.snapshots
            .insert((workflow_id, revision), snapshot.clone());
        Ok(snapshot)
    }

    fn cancel_token(&self, instance_id: &str) -> CancellationToken {
        self.cancels
            .entry(instance_id.to_string())
            .or_default()
            .clone()
    }
}

/// `at + duration`, saturating far in the future.
pub(crate) fn after(at: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(duration)
        .ok()
        .filter(|d| *d < chrono::Duration::days(3650))
        .unwrap_or_else(|| chrono::Duration::days(3650));
    at + delta
}
