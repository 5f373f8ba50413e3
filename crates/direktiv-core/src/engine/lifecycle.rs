// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance termination, cancellation, child results and kickstart.

use direktiv_dsl::VariableScope;
use tracing::{debug, info, instrument, warn};

use super::Engine;
use super::step::StepInput;
use crate::actions::{ActionRequest, ActionResultPayload, SandboxError};
use crate::cluster::ClusterCommand;
use crate::error::{CoreError, EngineError, codes};
use crate::events::CloudEvent;
use crate::metrics;
use crate::persistence::{InstanceRecord, InstanceStatus};
use crate::states::{self, ChildInfo, ChildKind, encode};

impl Engine {
    /// Cancel an active instance and its children.
    ///
    /// Returns false when the instance had already terminated.
    #[instrument(skip(self))]
    pub async fn cancel_instance(
        &self,
        instance_id: &str,
        code: &str,
        message: &str,
    ) -> Result<bool, EngineError> {
        let Some(cancelled) = self
            .store
            .cancel_instance(instance_id, code, message)
            .await?
        else {
            debug!("Instance already terminal");
            return Ok(false);
        };
        self.timers
            .forget_prefix(instance_id, &cancelled.timers)
            .await;
        let instance = cancelled.instance;

        if let Some((_, token)) = self.cancels.remove(instance_id) {
            token.cancel();
        }
        if let Err(e) = self
            .cluster
            .broadcast(ClusterCommand::CancelSubflow, instance_id)
            .await
        {
            warn!(error = %e, "Failed to broadcast cancellation");
        }

        match self.living_children(&instance).await {
            Ok(children) => self.cancel_children(children, "parent instance cancelled").await,
            Err(e) => warn!(error = %e, "Failed to resolve children of cancelled instance"),
        }

        info!(code, "Instance cancelled");
        self.finish(&instance).await;
        Ok(true)
    }

    async fn living_children(&self, instance: &InstanceRecord) -> Result<Vec<ChildInfo>, EngineError> {
        let snapshot = self.snapshot(instance.workflow_id, instance.revision).await?;
        Ok(instance
            .current_state()
            .and_then(|id| snapshot.workflow.state(id))
            .map(|state| states::logic(state).living_children(instance.memory.as_deref()))
            .unwrap_or_default())
    }

    /// Stop children started by a state.
    pub(crate) async fn cancel_children(&self, children: Vec<ChildInfo>, reason: &str) {
        for child in children {
            match child.kind {
                ChildKind::Subflow => {
                    self.spawn_cancel(child.id, codes::CANCELS_PARENT, reason.to_string())
                }
                ChildKind::Isolate => {
                    self.sandbox.cancel(&child.id).await;
                    if let Err(e) = self
                        .cluster
                        .broadcast(ClusterCommand::CancelIsolate, &child.id)
                        .await
                    {
                        warn!(action_id = %child.id, error = %e, "Failed to broadcast action cancel");
                    }
                }
            }
        }
    }

    fn spawn_cancel(&self, instance_id: String, code: &'static str, message: String) {
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = engine.cancel_instance(&instance_id, code, &message).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to cancel child instance");
            }
        });
    }

    /// Release everything a terminated instance held and report to its
    /// caller.
    pub(crate) async fn finish(&self, instance: &InstanceRecord) {
        let id = &instance.id;
        if let Err(e) = self.timers.delete_prefix(id).await {
            warn!(instance_id = %id, error = %e, "Failed to delete instance timers");
        }
        if let Err(e) = self.store.delete_instance_listeners(id).await {
            warn!(instance_id = %id, error = %e, "Failed to delete instance listeners");
        }
        if let Err(e) = self.variables.delete_scope(VariableScope::Instance, id).await {
            warn!(instance_id = %id, error = %e, "Failed to delete instance variables");
        }
        self.cancels.remove(id);

        let end = instance.end_time.unwrap_or_else(chrono::Utc::now);
        let duration = (end - instance.begin_time).num_milliseconds().max(0) as f64;
        metrics::record_finished(
            &instance.namespace,
            &instance.workflow_name,
            instance.status == InstanceStatus::Complete,
            duration,
        );
        info!(
            instance_id = %id,
            status = %instance.status,
            error_code = instance.error_code.as_deref().unwrap_or_default(),
            duration_ms = duration,
            "Instance finished"
        );

        self.report_to_caller(instance).await;
    }

    async fn report_to_caller(&self, instance: &InstanceRecord) {
        let Some(caller) = instance.caller() else {
            return;
        };
        let payload = match instance.status {
            InstanceStatus::Complete => ActionResultPayload {
                action_id: caller.action_id,
                error_code: None,
                error_message: None,
                output: instance
                    .output
                    .as_ref()
                    .and_then(|o| serde_json::to_vec(o).ok())
                    .unwrap_or_default(),
            },
            _ => ActionResultPayload::failure(
                caller.action_id,
                instance.error_code.as_deref().unwrap_or(codes::INTERNAL),
                instance.error_message.as_deref().unwrap_or_default(),
            ),
        };
        if let Err(e) = self
            .report_action_result(&caller.instance_id, caller.step, payload)
            .await
        {
            warn!(parent = %caller.instance_id, error = %e, "Failed to report subflow result");
        }
    }

    /// Deliver the result of a child call to the step waiting for it.
    ///
    /// Results for a step the instance already left are dropped.
    pub async fn report_action_result(
        &self,
        instance_id: &str,
        step: i32,
        payload: ActionResultPayload,
    ) -> Result<(), EngineError> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| CoreError::not_found("instance", instance_id))?;
        if !instance.is_active() || instance.step() != step {
            debug!(instance_id, step, action_id = %payload.action_id, "Dropping result for a stale step");
            return Ok(());
        }
        let wakedata = encode(&payload)?;
        self.schedule(instance_id, step, StepInput::Run(Some(wakedata)));
        Ok(())
    }

    /// Run a container call on its own task and report the outcome.
    pub(crate) fn spawn_dispatch(&self, request: ActionRequest, is_async: bool) {
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let action_id = request.action_id.clone();
            let instance_id = request.workflow.instance.clone();
            let step = request.workflow.step;

            let payload = match engine.sandbox.dispatch(request).await {
                Ok(output) => ActionResultPayload::from_output(action_id, output),
                Err(SandboxError::Cancelled) => {
                    debug!(action_id = %action_id, "Action cancelled");
                    return;
                }
                Err(e) => {
                    ActionResultPayload::failure(action_id, codes::ACTION_DISPATCH, e.to_string())
                }
            };
            if is_async {
                return;
            }
            if let Err(e) = engine.report_action_result(&instance_id, step, payload).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to report action result");
            }
        });
    }

    /// Validate `event` and route it to the listeners of `namespace`.
    ///
    /// Returns the number of listeners that fired.
    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    pub async fn broadcast_event(
        &self,
        namespace: &str,
        event: CloudEvent,
    ) -> Result<usize, EngineError> {
        event
            .validate()
            .map_err(|e| CoreError::validation("event", e))?;
        Ok(self.router.route(namespace, &event, self).await?)
    }

    /// Resume instances this node was stepping when it stopped.
    pub(crate) async fn kickstart(&self) -> Result<usize, EngineError> {
        let mut resumed = 0;
        for status in [InstanceStatus::Running, InstanceStatus::Pending] {
            let instances = self
                .store
                .list_instances_by_controller(&self.config.hostname, status)
                .await?;
            for instance in instances {
                if instance.flow.is_empty() {
                    self.cancel_instance(
                        &instance.id,
                        codes::CANCELS_KICKSTART,
                        "instance never reached its first state",
                    )
                    .await?;
                    continue;
                }
                if instance.memory.is_some() {
                    continue;
                }
                if status == InstanceStatus::Pending
                    && self.store.get_timer(&instance.id).await?.is_some()
                {
                    continue;
                }
                debug!(instance_id = %instance.id, step = instance.step(), "Kickstarting instance");
                self.schedule(&instance.id, instance.step(), StepInput::Run(None));
                resumed += 1;
            }
        }
        Ok(resumed)
    }
}
