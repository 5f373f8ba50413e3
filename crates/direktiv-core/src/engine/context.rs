// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! [`StepContext`] backed by the engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktiv_dsl::{EventTemplate, FunctionDefinition, FunctionType, VariableScope};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use super::{Engine, SLEEP_WAKEUP, Snapshot, StepRef, after};
use crate::actions::{ActionContainer, ActionRequest, ActionWorkflow};
use crate::error::{CoreError, EngineError, codes};
use crate::events::{CloudEvent, NewListener};
use crate::logging::{EventSink, InstanceLogger};
use crate::persistence::{CallerInfo, InstanceRecord};
use crate::states::{ChildInfo, ChildKind, FunctionCall, StepContext, encode};
use crate::vars::VariableRecord;

/// Events raised while an instance is locked. They are routed after the
/// lock is released so a step never holds two lock connections.
#[derive(Clone, Default)]
pub(crate) struct Outbox {
    events: Arc<Mutex<Vec<(String, CloudEvent)>>>,
}

impl Outbox {
    pub(crate) async fn push(&self, namespace: &str, event: CloudEvent) {
        self.events.lock().await.push((namespace.to_string(), event));
    }

    pub(crate) async fn take(&self) -> Vec<(String, CloudEvent)> {
        std::mem::take(&mut *self.events.lock().await)
    }
}

#[async_trait]
impl EventSink for Outbox {
    async fn publish_event(&self, namespace: &str, event: CloudEvent) -> Result<(), EngineError> {
        self.push(namespace, event).await;
        Ok(())
    }
}

impl Engine {
    /// Route everything queued in `outbox`.
    pub(crate) async fn flush(&self, outbox: &Outbox) {
        for (namespace, event) in outbox.take().await {
            let event_id = event.id.clone();
            if let Err(e) = self.broadcast_event(&namespace, event).await {
                warn!(event_id = %event_id, error = %e, "Failed to route event");
            }
        }
    }
}

/// One instance being stepped.
pub(crate) struct InstanceContext<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) snapshot: Arc<Snapshot>,
    pub(crate) instance: InstanceRecord,
    pub(crate) token: CancellationToken,
    outbox: Outbox,
    logger: InstanceLogger,
}

impl<'a> InstanceContext<'a> {
    pub(crate) fn new(
        engine: &'a Engine,
        snapshot: Arc<Snapshot>,
        instance: InstanceRecord,
        outbox: Outbox,
    ) -> Self {
        let mut logger =
            InstanceLogger::new(engine.store.clone(), &instance.namespace, &instance.id);
        if snapshot.log_to_events {
            logger = logger.with_events(Arc::new(outbox.clone()) as Arc<dyn EventSink>);
        }
        Self {
            engine,
            token: engine.cancel_token(&instance.id),
            snapshot,
            instance,
            outbox,
            logger,
        }
    }

    pub(crate) fn logger(&self) -> &InstanceLogger {
        &self.logger
    }

    pub(crate) fn step_ref(&self) -> StepRef {
        StepRef {
            instance_id: self.instance.id.clone(),
            step: self.instance.step(),
        }
    }

    fn state_id(&self) -> String {
        self.instance.current_state().unwrap_or_default().to_string()
    }

    fn scope_id(&self, scope: VariableScope) -> String {
        match scope {
            VariableScope::Instance => self.instance.id.clone(),
            VariableScope::Workflow => self.instance.workflow_id.to_string(),
            VariableScope::Namespace => self.instance.namespace.clone(),
        }
    }

    async fn call_subflow(&mut self, call: FunctionCall) -> Result<ChildInfo, EngineError> {
        let engine = self.engine;
        let depth = self.instance.depth() + 1;
        if depth > engine.config.max_subflow_depth {
            return Err(EngineError::uncatchable(
                codes::LIMITS_DEPTH,
                format!(
                    "subflow depth {} exceeds the limit of {}",
                    depth, engine.config.max_subflow_depth
                ),
            ));
        }

        let name = call.function.workflow.clone().unwrap_or_default();
        let record = engine
            .store
            .get_workflow_by_name(&self.instance.namespace, &name)
            .await?
            .ok_or_else(|| {
                EngineError::uncatchable(
                    codes::SUBFLOW_NOT_EXIST,
                    format!("subflow '{}' does not exist", name),
                )
            })?;
        let snapshot = engine.snapshot(record.id, record.revision).await?;

        let id = super::new_instance_id(&record.namespace, &record.name);
        let caller = (!call.is_async).then(|| CallerInfo {
            instance_id: self.instance.id.clone(),
            state: self.state_id(),
            step: self.instance.step(),
            depth,
            action_id: id.clone(),
        });
        engine
            .start_instance(&record, snapshot, call.input, "subflow", caller, id.clone())
            .await?;

        Ok(ChildInfo {
            id,
            kind: ChildKind::Subflow,
        })
    }

    fn call_isolate(&mut self, call: FunctionCall) -> Result<ChildInfo, EngineError> {
        let action_id = Uuid::new_v4().to_string();
        let function = call.function;
        let deadline = self
            .instance
            .deadline
            .unwrap_or_else(|| after(Utc::now(), self.engine.config.default_state_timeout));

        let request = ActionRequest {
            action_id: action_id.clone(),
            workflow: ActionWorkflow {
                instance: self.instance.id.clone(),
                namespace: self.instance.namespace.clone(),
                state: self.state_id(),
                step: self.instance.step(),
                name: self.instance.workflow_name.clone(),
            },
            container: ActionContainer {
                function_type: function.function_type,
                image: function.image,
                cmd: function.cmd,
                size: function.size.unwrap_or_default(),
                service: function.service,
                data: encode(&call.input)?,
                registries: BTreeMap::new(),
            },
            deadline,
        };
        self.engine.spawn_dispatch(request, call.is_async);

        Ok(ChildInfo {
            id: action_id,
            kind: ChildKind::Isolate,
        })
    }
}

#[async_trait]
impl StepContext for InstanceContext<'_> {
    fn instance(&self) -> &InstanceRecord {
        &self.instance
    }

    fn data(&self) -> &Value {
        &self.instance.state_data
    }

    fn set_data(&mut self, data: Value) {
        self.instance.state_data = data;
    }

    fn function(&self, id: &str) -> Option<&FunctionDefinition> {
        self.snapshot.workflow.function(id)
    }

    fn max_parallel_actions(&self) -> usize {
        self.engine.config.max_parallel_actions
    }

    async fn save_memory(&mut self, memory: Vec<u8>) -> Result<(), EngineError> {
        self.instance.memory = Some(memory);
        Ok(())
    }

    async fn sleep_until(&mut self, at: DateTime<Utc>) -> Result<(), EngineError> {
        let payload = encode(&self.step_ref())?;
        self.engine
            .timers
            .add_one_shot(&self.instance.id, SLEEP_WAKEUP, at, payload)
            .await?;
        Ok(())
    }

    async fn listen(
        &mut self,
        templates: Vec<EventTemplate>,
        correlate: Vec<String>,
        all: bool,
    ) -> Result<(), EngineError> {
        let count = if all { templates.len() } else { 1 };
        self.engine
            .router
            .add_listener(NewListener {
                namespace: self.instance.namespace.clone(),
                workflow_id: self.instance.workflow_id,
                instance_id: Some(self.instance.id.clone()),
                templates,
                correlation: correlate,
                count,
                signature: Some(encode(&self.step_ref())?),
                lifespan: None,
            })
            .await?;
        Ok(())
    }

    async fn call(&mut self, call: FunctionCall) -> Result<ChildInfo, EngineError> {
        match call.function.function_type {
            FunctionType::Subflow => self.call_subflow(call).await,
            FunctionType::KnativeWorkflow | FunctionType::KnativeNamespace => {
                self.call_isolate(call)
            }
        }
    }

    async fn emit(&mut self, event: CloudEvent) -> Result<(), EngineError> {
        event
            .validate()
            .map_err(|e| CoreError::validation("event", e))?;
        self.outbox.push(&self.instance.namespace, event).await;
        Ok(())
    }

    async fn get_variable(
        &mut self,
        scope: VariableScope,
        key: &str,
    ) -> Result<Option<VariableRecord>, EngineError> {
        let scope_id = self.scope_id(scope);
        Ok(self.engine.variables.get(scope, &scope_id, key).await?)
    }

    async fn set_variable(
        &mut self,
        scope: VariableScope,
        key: &str,
        value: Option<VariableRecord>,
    ) -> Result<(), EngineError> {
        let scope_id = self.scope_id(scope);
        match value {
            Some(value) => {
                self.engine
                    .variables
                    .set(scope, &scope_id, key, &value)
                    .await?
            }
            None => {
                self.engine.variables.delete(scope, &scope_id, key).await?;
            }
        }
        Ok(())
    }

    async fn secret(&mut self, name: &str) -> Result<String, EngineError> {
        let bytes = self
            .engine
            .secrets
            .get(&self.instance.namespace, name)
            .await?
            .ok_or_else(|| {
                EngineError::uncatchable(
                    codes::SECRETS_NOT_FOUND,
                    format!("secret '{}' not found", name),
                )
            })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn log(&mut self, message: &str) {
        self.logger.info(message).await;
    }
}
