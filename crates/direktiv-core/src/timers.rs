// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster-coordinated cron and one-shot timers.
//!
//! Every node schedules every enabled timer locally. When a local schedule
//! fires, the node races for an advisory lock on `(timer id, name)`; only the
//! winner re-reads the row and invokes the handler:
//!
//! ```text
//!  local tick ──► try_lock(id, name) ──lost──► skip
//!                      │
//!                      won
//!                      ▼
//!               re-read timer row ──gone──► drop local entry
//!                      │
//!        one-shot: delete row      cron: last_fired >= tick ? skip : set last_fired
//!                      │
//!                      ▼
//!               handler(payload)
//!                      │
//!               unlock after skew grace
//! ```
//!
//! The delayed unlock together with the `last_fired` check keeps a node with
//! a slightly late clock from firing the same cron tick again.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cluster::{ClusterCommand, ClusterSync};
use crate::error::CoreError;
use crate::persistence::{LockManager, NewTimer, Persistence, TimerRecord, lock_key};

/// Error returned by timer handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Registered timer callback, invoked with the timer payload.
pub type TimerHandler =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Errors raised by the timer manager.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    /// A handler with this name is already registered.
    #[error("timer handler '{0}' already registered")]
    DuplicateHandler(String),

    /// No handler with this name is registered.
    #[error("timer handler '{0}' not registered")]
    UnknownHandler(String),

    /// The cron pattern does not parse.
    #[error("invalid cron pattern '{pattern}': {reason}")]
    InvalidCron {
        /// The pattern.
        pattern: String,
        /// Parser message.
        reason: String,
    },

    /// A one-shot timer was requested too far in the past.
    #[error("one-shot timer '{name}' at {at} is in the past")]
    InPast {
        /// Timer name.
        name: String,
        /// Requested fire time.
        at: DateTime<Utc>,
    },

    /// Storage failure.
    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Configuration for the timer manager.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// How long the fire lock is held after the handler returns.
    pub skew_grace: Duration,
    /// How far in the past a new one-shot may be.
    pub past_grace: Duration,
    /// One-shots overdue by more than this are deleted by the sweeper.
    pub overdue_after: Duration,
    /// How often the sweeper runs.
    pub sweep_interval: Duration,
    /// Fires holding a timer lock at once, skew grace included.
    pub max_concurrent_fires: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            skew_grace: Duration::from_secs(1),
            past_grace: Duration::from_secs(10),
            overdue_after: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            max_concurrent_fires: 4,
        }
    }
}

struct LocalTimer {
    id: Uuid,
    task: JoinHandle<()>,
}

/// Node-local view of the cluster's timers.
pub struct TimerManager {
    store: Arc<dyn Persistence>,
    locks: Arc<dyn LockManager>,
    cluster: Arc<ClusterSync>,
    handlers: DashMap<String, TimerHandler>,
    local: DashMap<String, LocalTimer>,
    fires: Arc<Semaphore>,
    config: TimerConfig,
    shutdown: Arc<Notify>,
    this: Weak<TimerManager>,
}

fn parse_cron(pattern: &str) -> Result<Cron, TimerError> {
    Cron::new(pattern)
        .parse()
        .map_err(|e| TimerError::InvalidCron {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

impl TimerManager {
    /// Create a timer manager. Nothing is scheduled until [`TimerManager::start`].
    pub fn new(
        store: Arc<dyn Persistence>,
        locks: Arc<dyn LockManager>,
        cluster: Arc<ClusterSync>,
        config: TimerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            locks,
            cluster,
            handlers: DashMap::new(),
            local: DashMap::new(),
            fires: Arc::new(Semaphore::new(config.max_concurrent_fires.max(1))),
            config,
            shutdown: Arc::new(Notify::new()),
            this: this.clone(),
        })
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Register a handler. Names are write-once.
    pub fn register_handler(&self, name: &str, handler: TimerHandler) -> Result<(), TimerError> {
        match self.handlers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(TimerError::DuplicateHandler(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Load every stored timer and schedule the enabled ones.
    pub async fn start(&self) -> Result<(), TimerError> {
        let timers = self.store.list_timers().await?;
        let count = timers.len();
        for timer in timers {
            if timer.enabled {
                self.schedule_local(timer);
            }
        }
        info!(timers = count, "timer manager started");
        Ok(())
    }

    /// Sweep overdue one-shots until shutdown.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Timer manager received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Failed to sweep overdue timers");
                    }
                }
            }
        }

        for entry in self.local.iter() {
            entry.value().task.abort();
        }
        self.local.clear();
        info!("Timer manager stopped");
    }

    /// Delete one-shots that are overdue by more than the configured bound.
    pub async fn sweep(&self) -> Result<Vec<String>, TimerError> {
        let overdue = chrono::Duration::from_std(self.config.overdue_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(2));
        let names = self.store.delete_overdue_one_shots(Utc::now() - overdue).await?;
        for name in &names {
            warn!(timer = %name, "deleted overdue one-shot timer");
            self.unschedule_local(name);
        }
        Ok(names)
    }

    /// Add or replace a recurring timer.
    #[instrument(skip(self, payload))]
    pub async fn add_cron(
        &self,
        name: &str,
        handler: &str,
        pattern: &str,
        payload: Vec<u8>,
    ) -> Result<TimerRecord, TimerError> {
        parse_cron(pattern)?;
        self.ensure_handler(handler)?;
        let record = self
            .store
            .upsert_timer(&NewTimer {
                name: name.to_string(),
                handler: handler.to_string(),
                cron: Some(pattern.to_string()),
                one_shot: None,
                payload,
            })
            .await?;
        self.added(record).await
    }

    /// Add or replace a timer that fires once at `at`.
    #[instrument(skip(self, payload))]
    pub async fn add_one_shot(
        &self,
        name: &str,
        handler: &str,
        at: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Result<TimerRecord, TimerError> {
        let grace = chrono::Duration::from_std(self.config.past_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        if at < Utc::now() - grace {
            return Err(TimerError::InPast {
                name: name.to_string(),
                at,
            });
        }
        self.ensure_handler(handler)?;
        let record = self
            .store
            .upsert_timer(&NewTimer {
                name: name.to_string(),
                handler: handler.to_string(),
                cron: None,
                one_shot: Some(at),
                payload,
            })
            .await?;
        self.added(record).await
    }

    fn ensure_handler(&self, handler: &str) -> Result<(), TimerError> {
        if self.handlers.contains_key(handler) {
            Ok(())
        } else {
            Err(TimerError::UnknownHandler(handler.to_string()))
        }
    }

    async fn added(&self, record: TimerRecord) -> Result<TimerRecord, TimerError> {
        self.schedule_local(record.clone());
        self.broadcast(ClusterCommand::AddTimer, &record.id.to_string())
            .await;
        Ok(record)
    }

    /// Delete a timer. Returns true if it existed.
    pub async fn delete(&self, name: &str) -> Result<bool, TimerError> {
        let existed = self.store.delete_timer(name).await?;
        self.unschedule_local(name);
        self.broadcast(ClusterCommand::DeleteTimer, name).await;
        Ok(existed)
    }

    /// Delete every timer whose name starts with `prefix`.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>, TimerError> {
        let names = self.store.delete_timers_with_prefix(prefix).await?;
        self.forget_prefix(prefix, &names).await;
        Ok(names)
    }

    /// Drop local schedules under `prefix` and tell the cluster about rows
    /// already deleted from storage.
    pub async fn forget_prefix(&self, prefix: &str, deleted: &[String]) {
        // Local entries may exist for rows another node already removed.
        let local: Vec<String> = self
            .local
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        for name in local {
            self.unschedule_local(&name);
        }

        for name in deleted {
            self.broadcast(ClusterCommand::DeleteTimer, name).await;
        }
    }

    /// Enable a timer. Returns false if it does not exist.
    pub async fn enable(&self, name: &str) -> Result<bool, TimerError> {
        if !self.store.set_timer_enabled(name, true).await? {
            return Ok(false);
        }
        self.reload_local(name).await?;
        self.broadcast(ClusterCommand::EnableTimer, name).await;
        Ok(true)
    }

    /// Disable a timer. Returns false if it does not exist.
    pub async fn disable(&self, name: &str) -> Result<bool, TimerError> {
        if !self.store.set_timer_enabled(name, false).await? {
            return Ok(false);
        }
        self.unschedule_local(name);
        self.broadcast(ClusterCommand::DisableTimer, name).await;
        Ok(true)
    }

    /// Apply a timer command received from another node.
    pub async fn handle_cluster(&self, cmd: ClusterCommand, id: &str) {
        let result = match cmd {
            ClusterCommand::AddTimer => match Uuid::parse_str(id) {
                Ok(id) => match self.store.get_timer_by_id(id).await {
                    Ok(Some(record)) if record.enabled => {
                        self.schedule_local(record);
                        Ok(())
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.into()),
                },
                Err(e) => {
                    warn!(id, error = %e, "AddTimer with malformed id");
                    Ok(())
                }
            },
            ClusterCommand::DeleteTimer | ClusterCommand::DisableTimer => {
                self.unschedule_local(id);
                Ok(())
            }
            ClusterCommand::EnableTimer => self.reload_local(id).await,
            ClusterCommand::CancelIsolate | ClusterCommand::CancelSubflow => Ok(()),
        };
        if let Err(e) = result {
            error!(?cmd, id, error = %e, "Failed to apply cluster timer command");
        }
    }

    /// Names of the timers scheduled on this node.
    pub fn scheduled(&self) -> Vec<String> {
        let mut names: Vec<String> = self.local.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    async fn reload_local(&self, name: &str) -> Result<(), TimerError> {
        match self.store.get_timer(name).await? {
            Some(record) if record.enabled => self.schedule_local(record),
            _ => self.unschedule_local(name),
        }
        Ok(())
    }

    async fn broadcast(&self, cmd: ClusterCommand, id: &str) {
        if let Err(e) = self.cluster.broadcast(cmd, id).await {
            warn!(?cmd, id, error = %e, "Failed to broadcast timer change");
        }
    }

    fn unschedule_local(&self, name: &str) {
        if let Some((_, entry)) = self.local.remove(name) {
            entry.task.abort();
            debug!(timer = %name, "unscheduled local timer");
        }
    }

    fn schedule_local(&self, record: TimerRecord) {
        let this = self.this.clone();
        let name = record.name.clone();
        let id = record.id;

        let task = if let Some(at) = record.one_shot {
            tokio::spawn(async move {
                let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                if let Some(manager) = this.upgrade() {
                    // Fire on its own task so unscheduling cannot abort a handler.
                    tokio::spawn(async move { manager.fire(&record.name, record.id, at).await });
                }
            })
        } else if let Some(pattern) = record.cron.clone() {
            let cron = match parse_cron(&pattern) {
                Ok(cron) => cron,
                Err(e) => {
                    error!(timer = %name, error = %e, "stored timer has invalid cron");
                    return;
                }
            };
            tokio::spawn(async move {
                let mut after = Utc::now();
                loop {
                    let next = match cron.find_next_occurrence(&after, false) {
                        Ok(next) => next,
                        Err(e) => {
                            error!(timer = %record.name, error = %e, "no next cron occurrence");
                            return;
                        }
                    };
                    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;
                    let Some(manager) = this.upgrade() else {
                        return;
                    };
                    let fire_name = record.name.clone();
                    tokio::spawn(async move { manager.fire(&fire_name, record.id, next).await });
                    after = next.max(Utc::now());
                }
            })
        } else {
            return;
        };

        if let Some(previous) = self.local.insert(name, LocalTimer { id, task }) {
            previous.task.abort();
        }
    }

    /// Attempt to fire timer `name` (with id `id`) for `tick`.
    ///
    /// Returns true if this node won the lock and invoked the handler.
    #[instrument(skip(self), fields(timer = %name))]
    pub async fn fire(&self, name: &str, id: Uuid, tick: DateTime<Utc>) -> bool {
        let Ok(permit) = self.fires.clone().acquire_owned().await else {
            return false;
        };
        let key = lock_key(&[&id.to_string(), name]);
        let guard = match self.locks.try_lock(key).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!("timer lock held elsewhere, skipping");
                return false;
            }
            Err(e) => {
                error!(error = %e, "Failed to take timer lock");
                return false;
            }
        };

        let fired = self.fire_locked(name, id, tick).await;

        let grace = self.config.skew_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            guard.unlock().await;
            drop(permit);
        });

        fired
    }

    async fn fire_locked(&self, name: &str, id: Uuid, tick: DateTime<Utc>) -> bool {
        let record = match self.store.get_timer(name).await {
            Ok(Some(record)) if record.id == id => record,
            Ok(_) => {
                debug!("timer vanished before firing");
                self.forget_local(name, id);
                return false;
            }
            Err(e) => {
                error!(error = %e, "Failed to re-read timer");
                return false;
            }
        };

        if !record.enabled {
            return false;
        }

        if record.one_shot.is_some() {
            if let Err(e) = self.store.delete_timer(name).await {
                error!(error = %e, "Failed to delete fired one-shot timer");
                return false;
            }
            self.forget_local(name, id);
        } else {
            if record.last_fired.is_some_and(|last| last >= tick) {
                debug!(%tick, "cron tick already fired");
                return false;
            }
            if let Err(e) = self.store.set_timer_last_fired(name, tick).await {
                error!(error = %e, "Failed to record cron fire");
                return false;
            }
        }

        let Some(handler) = self.handlers.get(&record.handler).map(|h| h.value().clone()) else {
            error!(handler = %record.handler, "timer handler not registered");
            return false;
        };

        debug!(handler = %record.handler, "firing timer");
        if let Err(e) = handler(record.payload).await {
            error!(handler = %record.handler, error = %e, "timer handler failed");
        }
        true
    }

    fn forget_local(&self, name: &str, id: Uuid) {
        // Only drop the entry if it still belongs to this timer generation.
        self.local.remove_if(name, |_, entry| entry.id == id);
    }
}
