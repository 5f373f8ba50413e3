// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process persistence.
//!
//! Mirrors the Postgres backend for a single node: unique keys, revision
//! snapshots, cascading deletes and the correlation wait queue all behave the
//! same way. Used by embedded setups and the engine tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CancelledInstance, EventListenerRecord, InstanceLogRecord, InstanceRecord, InstanceStatus,
    NamespaceRecord, NewInstance, NewTimer, NewWorkflow, Page, Persistence, TimerRecord,
    WorkflowRecord, WorkflowUpdate,
};
use crate::error::CoreError;

#[derive(Debug, Clone)]
struct EventWait {
    id: Uuid,
    listener_id: Uuid,
    events: HashMap<String, String>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    namespaces: BTreeMap<String, NamespaceRecord>,
    workflows: HashMap<Uuid, WorkflowRecord>,
    revisions: HashMap<(Uuid, i32), Vec<u8>>,
    instances: HashMap<String, InstanceRecord>,
    timers: BTreeMap<String, TimerRecord>,
    listeners: Vec<EventListenerRecord>,
    waits: Vec<EventWait>,
    logs: Vec<InstanceLogRecord>,
}

impl Tables {
    fn drop_instance(&mut self, id: &str) {
        self.instances.remove(id);
        let listener_ids: Vec<Uuid> = self
            .listeners
            .iter()
            .filter(|l| l.instance_id.as_deref() == Some(id))
            .map(|l| l.id)
            .collect();
        self.drop_listeners(&listener_ids);
        self.logs.retain(|l| l.instance_id != id);
    }

    fn drop_listeners(&mut self, ids: &[Uuid]) {
        self.listeners.retain(|l| !ids.contains(&l.id));
        self.waits.retain(|w| !ids.contains(&w.listener_id));
    }

    fn drop_workflow(&mut self, id: Uuid) {
        self.workflows.remove(&id);
        self.revisions.retain(|(wf, _), _| *wf != id);
        self.timers.remove(&format!("cron:{}", id));
        let instances: Vec<String> = self
            .instances
            .values()
            .filter(|i| i.workflow_id == id)
            .map(|i| i.id.clone())
            .collect();
        for instance in instances {
            self.drop_instance(&instance);
        }
        let listeners: Vec<Uuid> = self
            .listeners
            .iter()
            .filter(|l| l.workflow_id == id)
            .map(|l| l.id)
            .collect();
        self.drop_listeners(&listeners);
    }
}

/// Persistence held in process memory.
#[derive(Default)]
pub struct MemoryPersistence {
    tables: Mutex<Tables>,
}

impl MemoryPersistence {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn create_namespace(&self, name: &str) -> Result<NamespaceRecord, CoreError> {
        let mut t = self.tables.lock().await;
        if t.namespaces.contains_key(name) {
            return Err(CoreError::AlreadyExists {
                kind: "namespace",
                id: name.to_string(),
            });
        }
        let record = NamespaceRecord {
            name: name.to_string(),
            created_at: Utc::now(),
        };
        t.namespaces.insert(name.to_string(), record.clone());
        Ok(record)
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>, CoreError> {
        Ok(self.tables.lock().await.namespaces.get(name).cloned())
    }

    async fn list_namespaces(&self, page: Page) -> Result<Vec<NamespaceRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(page.apply(t.namespaces.values().cloned()))
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        if t.namespaces.remove(name).is_none() {
            return Err(CoreError::not_found("namespace", name));
        }
        let workflows: Vec<Uuid> = t
            .workflows
            .values()
            .filter(|w| w.namespace == name)
            .map(|w| w.id)
            .collect();
        for id in workflows {
            t.drop_workflow(id);
        }
        let prefix = format!("{}/", name);
        t.timers.retain(|n, _| !n.starts_with(&prefix));
        Ok(())
    }

    async fn create_workflow(&self, workflow: &NewWorkflow) -> Result<WorkflowRecord, CoreError> {
        let mut t = self.tables.lock().await;
        if !t.namespaces.contains_key(&workflow.namespace) {
            return Err(CoreError::not_found("namespace", &workflow.namespace));
        }
        if t
            .workflows
            .values()
            .any(|w| w.namespace == workflow.namespace && w.name == workflow.name)
        {
            return Err(CoreError::AlreadyExists {
                kind: "workflow",
                id: format!("{}/{}", workflow.namespace, workflow.name),
            });
        }
        let now = Utc::now();
        let record = WorkflowRecord {
            id: Uuid::new_v4(),
            namespace: workflow.namespace.clone(),
            name: workflow.name.clone(),
            revision: 1,
            active: workflow.active,
            document: workflow.document.clone(),
            description: workflow.description.clone(),
            log_to_events: workflow.log_to_events,
            created_at: now,
            updated_at: now,
        };
        t.revisions
            .insert((record.id, 1), record.document.clone());
        t.workflows.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRecord>, CoreError> {
        Ok(self.tables.lock().await.workflows.get(&id).cloned())
    }

    async fn get_workflow_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkflowRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t
            .workflows
            .values()
            .find(|w| w.namespace == namespace && w.name == name)
            .cloned())
    }

    async fn list_workflows(
        &self,
        namespace: &str,
        page: Page,
    ) -> Result<Vec<WorkflowRecord>, CoreError> {
        let t = self.tables.lock().await;
        let mut rows: Vec<_> = t
            .workflows
            .values()
            .filter(|w| w.namespace == namespace)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(page.apply(rows.into_iter()))
    }

    async fn update_workflow(
        &self,
        id: Uuid,
        expected_revision: Option<i32>,
        update: &WorkflowUpdate,
    ) -> Result<WorkflowRecord, CoreError> {
        let mut t = self.tables.lock().await;
        let record = t
            .workflows
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("workflow", id.to_string()))?;

        if let Some(expected) = expected_revision
            && expected != record.revision
        {
            return Err(CoreError::AlreadyUpdated {
                workflow_id: id.to_string(),
                expected,
                actual: record.revision,
            });
        }

        record.revision += 1;
        if let Some(document) = &update.document {
            record.document = document.clone();
        }
        if let Some(description) = &update.description {
            record.description = Some(description.clone());
        }
        if let Some(active) = update.active {
            record.active = active;
        }
        if let Some(log_to_events) = update.log_to_events {
            record.log_to_events = log_to_events;
        }
        record.updated_at = Utc::now();

        let record = record.clone();
        t.revisions
            .insert((id, record.revision), record.document.clone());
        Ok(record)
    }

    async fn get_workflow_revision(
        &self,
        id: Uuid,
        revision: i32,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(self.tables.lock().await.revisions.get(&(id, revision)).cloned())
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        if !t.workflows.contains_key(&id) {
            return Err(CoreError::not_found("workflow", id.to_string()));
        }
        t.drop_workflow(id);
        Ok(())
    }

    async fn create_instance(&self, instance: &NewInstance) -> Result<InstanceRecord, CoreError> {
        let mut t = self.tables.lock().await;
        if t.instances.contains_key(&instance.id) {
            return Err(CoreError::AlreadyExists {
                kind: "instance",
                id: instance.id.clone(),
            });
        }
        if !t.workflows.contains_key(&instance.workflow_id) {
            return Err(CoreError::not_found("workflow", instance.workflow_id.to_string()));
        }
        let record = InstanceRecord {
            id: instance.id.clone(),
            namespace: instance.namespace.clone(),
            workflow_id: instance.workflow_id,
            workflow_name: instance.workflow_name.clone(),
            revision: instance.revision,
            status: InstanceStatus::Pending,
            invoker: instance.invoker.clone(),
            input: instance.input.clone(),
            state_data: instance.input.clone(),
            flow: Vec::new(),
            memory: None,
            deadline: None,
            attempts: 0,
            error_code: None,
            error_message: None,
            output: None,
            invoked_by: instance
                .invoked_by
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
            controller: instance.controller.clone(),
            begin_time: Utc::now(),
            state_begin_time: None,
            end_time: None,
        };
        t.instances.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        Ok(self.tables.lock().await.instances.get(id).cloned())
    }

    async fn list_instances(
        &self,
        namespace: &str,
        page: Page,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let t = self.tables.lock().await;
        let mut rows: Vec<_> = t
            .instances
            .values()
            .filter(|i| i.namespace == namespace)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.begin_time.cmp(&a.begin_time).then(a.id.cmp(&b.id)));
        Ok(page.apply(rows.into_iter()))
    }

    async fn save_instance(&self, instance: &InstanceRecord) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let Some(stored) = t.instances.get_mut(&instance.id) else {
            return Err(CoreError::not_found("instance", &instance.id));
        };
        if !stored.is_active() {
            return Err(CoreError::InvalidInstanceState {
                instance_id: instance.id.clone(),
                expected: "active".to_string(),
                actual: stored.status.to_string(),
            });
        }
        stored.status = instance.status;
        stored.state_data = instance.state_data.clone();
        stored.flow = instance.flow.clone();
        stored.memory = instance.memory.clone();
        stored.deadline = instance.deadline;
        stored.attempts = instance.attempts;
        stored.error_code = instance.error_code.clone();
        stored.error_message = instance.error_message.clone();
        stored.output = instance.output.clone();
        stored.controller = instance.controller.clone();
        stored.state_begin_time = instance.state_begin_time;
        stored.end_time = instance.end_time;
        Ok(())
    }

    async fn count_instances_since(
        &self,
        namespace: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        let t = self.tables.lock().await;
        Ok(t
            .instances
            .values()
            .filter(|i| i.namespace == namespace && i.begin_time >= since)
            .count() as i64)
    }

    async fn cancel_instance(
        &self,
        id: &str,
        code: &str,
        message: &str,
    ) -> Result<Option<CancelledInstance>, CoreError> {
        let mut t = self.tables.lock().await;
        let Some(instance) = t.instances.get_mut(id) else {
            return Err(CoreError::not_found("instance", id));
        };
        if !instance.is_active() {
            return Ok(None);
        }
        instance.status = InstanceStatus::Cancelled;
        instance.error_code = Some(code.to_string());
        instance.error_message = Some(message.to_string());
        instance.deadline = None;
        instance.end_time = Some(Utc::now());
        let instance = instance.clone();

        let timers: Vec<String> = t
            .timers
            .keys()
            .filter(|n| n.starts_with(id))
            .cloned()
            .collect();
        for name in &timers {
            t.timers.remove(name);
        }
        let listeners: Vec<Uuid> = t
            .listeners
            .iter()
            .filter(|l| l.instance_id.as_deref() == Some(id))
            .map(|l| l.id)
            .collect();
        t.drop_listeners(&listeners);

        Ok(Some(CancelledInstance {
            instance,
            timers,
            listeners: listeners.len() as u64,
        }))
    }

    async fn list_instances_by_controller(
        &self,
        controller: &str,
        status: InstanceStatus,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        let t = self.tables.lock().await;
        let mut rows: Vec<_> = t
            .instances
            .values()
            .filter(|i| i.controller == controller && i.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|i| i.begin_time);
        Ok(rows)
    }

    async fn upsert_timer(&self, timer: &NewTimer) -> Result<TimerRecord, CoreError> {
        if timer.cron.is_some() == timer.one_shot.is_some() {
            return Err(CoreError::validation(
                "timer",
                "exactly one of cron and one_shot must be set",
            ));
        }
        let record = TimerRecord {
            id: Uuid::new_v4(),
            name: timer.name.clone(),
            handler: timer.handler.clone(),
            cron: timer.cron.clone(),
            one_shot: timer.one_shot,
            payload: timer.payload.clone(),
            last_fired: None,
            enabled: true,
            created_at: Utc::now(),
        };
        self.tables
            .lock()
            .await
            .timers
            .insert(record.name.clone(), record.clone());
        Ok(record)
    }

    async fn get_timer(&self, name: &str) -> Result<Option<TimerRecord>, CoreError> {
        Ok(self.tables.lock().await.timers.get(name).cloned())
    }

    async fn get_timer_by_id(&self, id: Uuid) -> Result<Option<TimerRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.timers.values().find(|r| r.id == id).cloned())
    }

    async fn list_timers(&self) -> Result<Vec<TimerRecord>, CoreError> {
        Ok(self.tables.lock().await.timers.values().cloned().collect())
    }

    async fn delete_timer(&self, name: &str) -> Result<bool, CoreError> {
        Ok(self.tables.lock().await.timers.remove(name).is_some())
    }

    async fn delete_timers_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        let mut t = self.tables.lock().await;
        let names: Vec<String> = t
            .timers
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();
        for name in &names {
            t.timers.remove(name);
        }
        Ok(names)
    }

    async fn set_timer_last_fired(
        &self,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if let Some(timer) = self.tables.lock().await.timers.get_mut(name) {
            timer.last_fired = Some(at);
        }
        Ok(())
    }

    async fn set_timer_enabled(&self, name: &str, enabled: bool) -> Result<bool, CoreError> {
        match self.tables.lock().await.timers.get_mut(name) {
            Some(timer) => {
                timer.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_overdue_one_shots(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError> {
        let mut t = self.tables.lock().await;
        let names: Vec<String> = t
            .timers
            .values()
            .filter(|r| r.one_shot.is_some_and(|at| at < before))
            .map(|r| r.name.clone())
            .collect();
        for name in &names {
            t.timers.remove(name);
        }
        Ok(names)
    }

    async fn create_listener(&self, listener: &EventListenerRecord) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        if t.listeners.iter().any(|l| l.id == listener.id) {
            return Err(CoreError::AlreadyExists {
                kind: "listener",
                id: listener.id.to_string(),
            });
        }
        t.listeners.push(listener.clone());
        Ok(())
    }

    async fn get_listener(&self, id: Uuid) -> Result<Option<EventListenerRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.listeners.iter().find(|l| l.id == id).cloned())
    }

    async fn find_listeners(
        &self,
        namespace: &str,
        event_type: &str,
    ) -> Result<Vec<EventListenerRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(t.listeners
            .iter()
            .filter(|l| l.namespace == namespace)
            .filter(|l| l.templates().iter().any(|e| e.event_type == event_type))
            .cloned()
            .collect())
    }

    async fn delete_listener(&self, id: Uuid) -> Result<(), CoreError> {
        self.tables.lock().await.drop_listeners(&[id]);
        Ok(())
    }

    async fn delete_instance_listeners(&self, instance_id: &str) -> Result<u64, CoreError> {
        let mut t = self.tables.lock().await;
        let ids: Vec<Uuid> = t
            .listeners
            .iter()
            .filter(|l| l.instance_id.as_deref() == Some(instance_id))
            .map(|l| l.id)
            .collect();
        t.drop_listeners(&ids);
        Ok(ids.len() as u64)
    }

    async fn delete_start_listeners(&self, workflow_id: Uuid) -> Result<u64, CoreError> {
        let mut t = self.tables.lock().await;
        let ids: Vec<Uuid> = t
            .listeners
            .iter()
            .filter(|l| l.workflow_id == workflow_id && l.instance_id.is_none())
            .map(|l| l.id)
            .collect();
        t.drop_listeners(&ids);
        Ok(ids.len() as u64)
    }

    async fn store_event_wait(
        &self,
        listener_id: Uuid,
        slot: &str,
        slots: &[String],
        event: &str,
        expire_before: Option<DateTime<Utc>>,
    ) -> Result<Option<HashMap<String, String>>, CoreError> {
        let mut t = self.tables.lock().await;

        if let Some(before) = expire_before {
            t.waits
                .retain(|w| w.listener_id != listener_id || w.created_at >= before);
        }

        // Waits are kept in insertion order, so the first match is the oldest.
        let index = match t
            .waits
            .iter()
            .position(|w| {
                w.listener_id == listener_id
                    && !w.events.contains_key(slot)
                    && w.events.keys().all(|k| slots.contains(k))
            })
        {
            Some(index) => index,
            None => {
                t.waits.push(EventWait {
                    id: Uuid::new_v4(),
                    listener_id,
                    events: HashMap::new(),
                    created_at: Utc::now(),
                });
                t.waits.len() - 1
            }
        };

        let wait = &mut t.waits[index];
        wait.events.insert(slot.to_string(), event.to_string());

        if slots.iter().all(|s| wait.events.contains_key(s)) {
            let id = wait.id;
            let events = std::mem::take(&mut wait.events);
            t.waits.retain(|w| w.id != id);
            return Ok(Some(events));
        }
        Ok(None)
    }

    async fn append_instance_log(
        &self,
        instance_id: &str,
        namespace: &str,
        level: &str,
        message: &str,
    ) -> Result<(), CoreError> {
        let mut t = self.tables.lock().await;
        let id = t.logs.len() as i64 + 1;
        t.logs.push(InstanceLogRecord {
            id,
            instance_id: instance_id.to_string(),
            namespace: namespace.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_instance_logs(
        &self,
        instance_id: &str,
        page: Page,
    ) -> Result<Vec<InstanceLogRecord>, CoreError> {
        let t = self.tables.lock().await;
        Ok(page.apply(
            t.logs
                .iter()
                .filter(|l| l.instance_id == instance_id)
                .cloned(),
        ))
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        Ok(())
    }
}
