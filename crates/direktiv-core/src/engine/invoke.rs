// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Creating instances.

use std::sync::Arc;

use chrono::Utc;
use direktiv_dsl::{Start, parse_duration};
use rand::Rng;
use serde_json::{Value, json};
use tracing::{info, instrument};

use super::context::{InstanceContext, Outbox};
use super::{Engine, HARD_CANCEL, SOFT_CANCEL, Snapshot, TimeoutRef, after};
use crate::error::{CoreError, EngineError, codes};
use crate::metrics;
use crate::persistence::{CallerInfo, InstanceRecord, NewInstance, WorkflowRecord};
use crate::states::encode;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// New instance id: `<namespace>/<workflow>/<6 random letters>`.
pub fn new_instance_id(namespace: &str, workflow: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| char::from(LETTERS[rng.gen_range(0..LETTERS.len())]))
        .collect();
    format!("{}/{}/{}", namespace, workflow, suffix)
}

impl Engine {
    /// Start a workflow through the API. Only workflows with a default
    /// start may be invoked directly.
    #[instrument(skip(self, input))]
    pub async fn invoke(
        &self,
        namespace: &str,
        workflow: &str,
        input: Value,
    ) -> Result<InstanceRecord, EngineError> {
        let record = self
            .store
            .get_workflow_by_name(namespace, workflow)
            .await?
            .ok_or_else(|| CoreError::not_found("workflow", format!("{}/{}", namespace, workflow)))?;
        let snapshot = self.snapshot(record.id, record.revision).await?;
        let start = snapshot.workflow.start_definition();
        if !matches!(start, Start::Default { .. }) {
            return Err(CoreError::validation(
                "start",
                format!("workflows with a {} start cannot be invoked directly", start.kind()),
            )
            .into());
        }

        let id = new_instance_id(namespace, &record.name);
        self.start_instance(&record, snapshot, input, "api", None, id)
            .await
    }

    async fn check_rate_limit(&self, namespace: &str) -> Result<(), EngineError> {
        let since = Utc::now()
            - chrono::Duration::from_std(self.config.instance_limit_interval)
                .unwrap_or_else(|_| chrono::Duration::minutes(1));
        let count = self.store.count_instances_since(namespace, since).await?;
        if count >= self.config.max_instances_per_interval {
            return Err(EngineError::uncatchable(
                codes::LIMITS_INSTANCES,
                format!(
                    "namespace '{}' reached {} instances per {:?}",
                    namespace, self.config.max_instances_per_interval, self.config.instance_limit_interval
                ),
            ));
        }
        Ok(())
    }

    /// Create an instance of `record` and schedule its first state.
    pub(crate) async fn start_instance(
        &self,
        record: &WorkflowRecord,
        snapshot: Arc<Snapshot>,
        input: Value,
        invoker: &str,
        caller: Option<CallerInfo>,
        id: String,
    ) -> Result<InstanceRecord, EngineError> {
        self.check_rate_limit(&record.namespace).await?;

        let start = snapshot
            .workflow
            .start_state()
            .ok_or_else(|| CoreError::validation("states", "workflow has no states"))?
            .to_string();
        let input = match input {
            Value::Object(_) => input,
            other => json!({ "input": other }),
        };

        let instance = self
            .store
            .create_instance(&NewInstance {
                id,
                namespace: record.namespace.clone(),
                workflow_id: record.id,
                workflow_name: record.name.clone(),
                revision: record.revision,
                invoker: invoker.to_string(),
                input,
                controller: self.config.hostname.clone(),
                invoked_by: caller,
            })
            .await?;
        metrics::record_invoked(&instance.namespace, &instance.workflow_name);
        info!(instance_id = %instance.id, invoker, revision = instance.revision, "Instance created");

        self.arm_workflow_timeouts(&instance, &snapshot).await?;

        let outbox = Outbox::default();
        let mut ctx = InstanceContext::new(self, snapshot, instance, outbox.clone());
        let result = self.transition(&mut ctx, &start).await;
        let instance = ctx.instance;
        if result.is_err() {
            self.cancels.remove(&instance.id);
        }
        self.flush(&outbox).await;
        result.map(|()| instance)
    }

    async fn arm_workflow_timeouts(
        &self,
        instance: &InstanceRecord,
        snapshot: &Snapshot,
    ) -> Result<(), EngineError> {
        let timeouts = snapshot.workflow.timeouts.clone().unwrap_or_default();
        let interrupt = timeouts
            .interrupt
            .as_deref()
            .and_then(|d| parse_duration(d).ok())
            .unwrap_or(self.config.default_interrupt);
        let kill = timeouts
            .kill
            .as_deref()
            .and_then(|d| parse_duration(d).ok())
            .unwrap_or(interrupt + self.config.kill_grace);

        let payload = encode(&TimeoutRef {
            instance_id: instance.id.clone(),
            step: None,
        })?;
        self.timers
            .add_one_shot(
                &format!("{}:interrupt", instance.id),
                SOFT_CANCEL,
                after(instance.begin_time, interrupt),
                payload.clone(),
            )
            .await?;
        self.timers
            .add_one_shot(
                &format!("{}:hard", instance.id),
                HARD_CANCEL,
                after(instance.begin_time, kill),
                payload,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_format() {
        let id = new_instance_id("team", "orders");
        let (prefix, suffix) = id.rsplit_once('/').unwrap();
        assert_eq!(prefix, "team/orders");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_alphabetic()));
        assert_ne!(id, new_instance_id("team", "orders"));
    }
}
