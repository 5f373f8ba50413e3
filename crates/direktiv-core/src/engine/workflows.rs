// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Namespace and workflow management, and the start triggers derived from
//! workflow documents.

use direktiv_dsl::{Start, Workflow, parse_duration};
use direktiv_workflows::{LoadError, load_workflow};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{CRON_INVOKE, CronRef, Engine, cron_timer_name};
use crate::error::{CoreError, EngineError, codes};
use crate::events::NewListener;
use crate::persistence::{
    InstanceLogRecord, InstanceRecord, NamespaceRecord, NewWorkflow, Page, WorkflowRecord,
    WorkflowUpdate, is_valid_namespace_name,
};
use crate::states::encode;

/// Returns true if `name` can be used as a workflow name.
///
/// Names end up in instance ids and timer names, so separators are refused.
pub fn is_valid_workflow_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn load(document: &[u8]) -> Result<Workflow, EngineError> {
    match load_workflow(document) {
        Ok((workflow, result)) => {
            for warning in &result.warnings {
                debug!(warning = ?warning, "workflow warning");
            }
            Ok(workflow)
        }
        Err(LoadError::Parse(e)) => Err(CoreError::validation("document", e.to_string()).into()),
        Err(LoadError::Invalid(summary)) => Err(CoreError::validation("document", summary).into()),
    }
}

impl Engine {
    /// Create a namespace.
    pub async fn create_namespace(&self, name: &str) -> Result<NamespaceRecord, EngineError> {
        if !is_valid_namespace_name(name) {
            return Err(CoreError::validation("namespace", format!("invalid name '{}'", name)).into());
        }
        Ok(self.store.create_namespace(name).await?)
    }

    /// Delete a namespace, cancelling its instances and removing the start
    /// triggers of its workflows first.
    #[instrument(skip(self))]
    pub async fn delete_namespace(&self, name: &str) -> Result<(), EngineError> {
        for instance in self.store.list_instances(name, Page::ALL).await? {
            if instance.is_active() {
                self.cancel_instance(&instance.id, codes::CANCELS_API, "namespace deleted")
                    .await?;
            }
        }
        for workflow in self.store.list_workflows(name, Page::ALL).await? {
            self.clear_triggers(workflow.id).await?;
            self.forget_snapshots(workflow.id);
        }
        self.store.delete_namespace(name).await?;
        info!(namespace = name, "Namespace deleted");
        Ok(())
    }

    /// Namespaces.
    pub async fn list_namespaces(&self, page: Page) -> Result<Vec<NamespaceRecord>, EngineError> {
        Ok(self.store.list_namespaces(page).await?)
    }

    /// Validate and store a new workflow, then install its start trigger.
    #[instrument(skip(self, workflow), fields(namespace = %workflow.namespace, name = %workflow.name))]
    pub async fn create_workflow(&self, workflow: NewWorkflow) -> Result<WorkflowRecord, EngineError> {
        if !is_valid_workflow_name(&workflow.name) {
            return Err(
                CoreError::validation("name", format!("invalid workflow name '{}'", workflow.name))
                    .into(),
            );
        }
        let parsed = load(&workflow.document)?;
        if self.store.get_namespace(&workflow.namespace).await?.is_none() {
            return Err(CoreError::not_found("namespace", workflow.namespace).into());
        }

        let record = self.store.create_workflow(&workflow).await?;
        self.reconcile(&record, &parsed).await?;
        info!(workflow_id = %record.id, "Workflow created");
        Ok(record)
    }

    /// Update a workflow. With `expected_revision` set the update fails
    /// unless the stored revision matches.
    #[instrument(skip(self, update))]
    pub async fn update_workflow(
        &self,
        id: Uuid,
        expected_revision: Option<i32>,
        update: WorkflowUpdate,
    ) -> Result<WorkflowRecord, EngineError> {
        if let Some(document) = &update.document {
            load(document)?;
        }
        let record = self
            .store
            .update_workflow(id, expected_revision, &update)
            .await?;
        let parsed = load(&record.document)?;
        self.reconcile(&record, &parsed).await?;
        debug!(revision = record.revision, active = record.active, "Workflow updated");
        Ok(record)
    }

    /// Activate or deactivate a workflow's start trigger.
    pub async fn set_workflow_active(&self, id: Uuid, active: bool) -> Result<WorkflowRecord, EngineError> {
        self.update_workflow(
            id,
            None,
            WorkflowUpdate {
                active: Some(active),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete a workflow and its start trigger.
    #[instrument(skip(self))]
    pub async fn delete_workflow(&self, id: Uuid) -> Result<(), EngineError> {
        self.clear_triggers(id).await?;
        self.store.delete_workflow(id).await?;
        self.forget_snapshots(id);
        info!("Workflow deleted");
        Ok(())
    }

    /// Workflow by name.
    pub async fn get_workflow(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkflowRecord>, EngineError> {
        Ok(self.store.get_workflow_by_name(namespace, name).await?)
    }

    /// Workflows of a namespace.
    pub async fn list_workflows(
        &self,
        namespace: &str,
        page: Page,
    ) -> Result<Vec<WorkflowRecord>, EngineError> {
        Ok(self.store.list_workflows(namespace, page).await?)
    }

    /// Instance by id.
    pub async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, EngineError> {
        Ok(self.store.get_instance(id).await?)
    }

    /// Instances of a namespace, newest first.
    pub async fn list_instances(
        &self,
        namespace: &str,
        page: Page,
    ) -> Result<Vec<InstanceRecord>, EngineError> {
        Ok(self.store.list_instances(namespace, page).await?)
    }

    /// Log lines of an instance.
    pub async fn instance_logs(
        &self,
        instance_id: &str,
        page: Page,
    ) -> Result<Vec<InstanceLogRecord>, EngineError> {
        Ok(self.store.list_instance_logs(instance_id, page).await?)
    }

    /// Bring the cron timer and start listeners in line with the workflow.
    async fn reconcile(&self, record: &WorkflowRecord, workflow: &Workflow) -> Result<(), EngineError> {
        let cron_name = cron_timer_name(record.id);
        self.store.delete_start_listeners(record.id).await?;

        let start = workflow.start_definition();
        match &start {
            Start::Scheduled { cron, .. } if record.active => {
                let payload = encode(&CronRef {
                    workflow_id: record.id,
                })?;
                self.timers
                    .add_cron(&cron_name, CRON_INVOKE, cron, payload)
                    .await?;
            }
            Start::Scheduled { .. } => {
                self.timers.disable(&cron_name).await?;
            }
            _ => {
                self.timers.delete(&cron_name).await?;
            }
        }
        if !record.active {
            return Ok(());
        }

        let listener = match start {
            Start::Event { event, .. } => NewListener {
                namespace: record.namespace.clone(),
                workflow_id: record.id,
                instance_id: None,
                templates: vec![event],
                correlation: Vec::new(),
                count: 1,
                signature: None,
                lifespan: None,
            },
            Start::EventsXor { events, .. } => NewListener {
                namespace: record.namespace.clone(),
                workflow_id: record.id,
                instance_id: None,
                templates: events,
                correlation: Vec::new(),
                count: 1,
                signature: None,
                lifespan: None,
            },
            Start::EventsAnd {
                events,
                lifespan,
                correlate,
                ..
            } => NewListener {
                namespace: record.namespace.clone(),
                workflow_id: record.id,
                instance_id: None,
                count: events.len(),
                templates: events,
                correlation: correlate,
                signature: None,
                lifespan: lifespan.as_deref().and_then(|l| parse_duration(l).ok()),
            },
            Start::Default { .. } | Start::Scheduled { .. } => return Ok(()),
        };
        let id = self.router.add_listener(listener).await?;
        debug!(workflow_id = %record.id, listener_id = %id, "Start listener installed");
        Ok(())
    }

    async fn clear_triggers(&self, workflow_id: Uuid) -> Result<(), EngineError> {
        if let Err(e) = self.timers.delete(&cron_timer_name(workflow_id)).await {
            warn!(workflow_id = %workflow_id, error = %e, "Failed to delete cron timer");
        }
        self.store.delete_start_listeners(workflow_id).await?;
        Ok(())
    }

    fn forget_snapshots(&self, workflow_id: Uuid) {
        self.snapshots.retain(|(id, _), _| *id != workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_names() {
        assert!(is_valid_workflow_name("order-flow"));
        assert!(is_valid_workflow_name("v2.report_daily"));
        assert!(!is_valid_workflow_name(""));
        assert!(!is_valid_workflow_name("a/b"));
        assert!(!is_valid_workflow_name("-lead"));
        assert!(!is_valid_workflow_name("cron:x"));
    }
}
