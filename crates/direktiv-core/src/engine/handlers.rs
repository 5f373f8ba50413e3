// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entry points other components call into: timer handlers, cluster
//! messages, fired event listeners and published log lines.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::step::StepInput;
use super::{
    CRON_INVOKE, CronRef, Engine, HARD_CANCEL, RETRY_WAKEUP, SLEEP_WAKEUP, SOFT_CANCEL, StepRef,
    TimeoutRef,
};
use crate::cluster::{ClusterCommand, ClusterHandler, ClusterMessage};
use crate::error::{EngineError, codes};
use crate::events::{CloudEvent, EventWaker};
use crate::states::{decode, encode};
use crate::timers::{HandlerError, TimerHandler};

impl Engine {
    pub(super) fn register_timer_handlers(&self) -> Result<(), EngineError> {
        self.timers
            .register_handler(SLEEP_WAKEUP, self.timer_handler(Engine::sleep_wakeup))?;
        self.timers
            .register_handler(RETRY_WAKEUP, self.timer_handler(Engine::retry_wakeup))?;
        self.timers
            .register_handler(SOFT_CANCEL, self.timer_handler(Engine::soft_cancel))?;
        self.timers
            .register_handler(HARD_CANCEL, self.timer_handler(Engine::hard_cancel))?;
        self.timers
            .register_handler(CRON_INVOKE, self.timer_handler(Engine::cron_invoke))?;
        Ok(())
    }

    /// Wrap an engine method as a timer handler holding a weak reference.
    fn timer_handler<F, Fut>(&self, handler: F) -> TimerHandler
    where
        F: Fn(Arc<Engine>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let engine = self.this.clone();
        Arc::new(move |payload| {
            let run = engine.upgrade().map(|engine| handler(engine, payload));
            Box::pin(async move {
                match run {
                    Some(run) => run.await.map_err(|e| Box::new(e) as HandlerError),
                    None => Ok(()),
                }
            })
        })
    }

    async fn sleep_wakeup(self: Arc<Self>, payload: Vec<u8>) -> Result<(), EngineError> {
        let step: StepRef = decode(&payload, "sleep payload")?;
        self.schedule(&step.instance_id, step.step, StepInput::Run(Some(b"{}".to_vec())));
        Ok(())
    }

    async fn retry_wakeup(self: Arc<Self>, payload: Vec<u8>) -> Result<(), EngineError> {
        let step: StepRef = decode(&payload, "retry payload")?;
        self.schedule(&step.instance_id, step.step, StepInput::Retry);
        Ok(())
    }

    async fn soft_cancel(self: Arc<Self>, payload: Vec<u8>) -> Result<(), EngineError> {
        let timeout: TimeoutRef = decode(&payload, "timeout payload")?;
        let (step, message) = match timeout.step {
            Some(step) => (step, "state timed out"),
            None => {
                let Some(instance) = self.store.get_instance(&timeout.instance_id).await? else {
                    return Ok(());
                };
                (instance.step(), "workflow timed out")
            }
        };
        debug!(instance_id = %timeout.instance_id, step, "Soft timeout");
        self.schedule(
            &timeout.instance_id,
            step,
            StepInput::Fail(EngineError::catchable(codes::CANCELS_TIMEOUT_SOFT, message)),
        );
        Ok(())
    }

    async fn hard_cancel(self: Arc<Self>, payload: Vec<u8>) -> Result<(), EngineError> {
        let timeout: TimeoutRef = decode(&payload, "timeout payload")?;
        self.cancel_instance(
            &timeout.instance_id,
            codes::CANCELS_TIMEOUT,
            "workflow exceeded its kill timeout",
        )
        .await?;
        Ok(())
    }

    async fn cron_invoke(self: Arc<Self>, payload: Vec<u8>) -> Result<(), EngineError> {
        let cron: CronRef = decode(&payload, "cron payload")?;
        let Some(record) = self.store.get_workflow(cron.workflow_id).await? else {
            debug!(workflow_id = %cron.workflow_id, "Scheduled workflow is gone");
            return Ok(());
        };
        if !record.active {
            return Ok(());
        }
        let snapshot = self.snapshot(record.id, record.revision).await?;
        let id = super::new_instance_id(&record.namespace, &record.name);
        self.start_instance(&record, snapshot, Value::Object(Map::new()), "cron", None, id)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterHandler for Engine {
    async fn handle_cluster_message(&self, message: ClusterMessage) {
        match message.cmd {
            ClusterCommand::AddTimer
            | ClusterCommand::DeleteTimer
            | ClusterCommand::EnableTimer
            | ClusterCommand::DisableTimer => {
                self.timers.handle_cluster(message.cmd, &message.id).await
            }
            ClusterCommand::CancelSubflow => {
                if let Some((_, token)) = self.cancels.remove(&message.id) {
                    debug!(instance_id = %message.id, "Cancelled by another node");
                    token.cancel();
                }
            }
            ClusterCommand::CancelIsolate => self.sandbox.cancel(&message.id).await,
        }
    }
}

#[async_trait]
impl EventWaker for Engine {
    async fn wake_events(
        &self,
        signature: &[u8],
        events: Vec<CloudEvent>,
    ) -> Result<(), EngineError> {
        let step: StepRef = decode(signature, "listener signature")?;
        let wakedata = encode(&events)?;
        self.schedule(&step.instance_id, step.step, StepInput::Run(Some(wakedata)));
        Ok(())
    }

    async fn events_invoke(
        &self,
        workflow_id: Uuid,
        events: Vec<CloudEvent>,
    ) -> Result<(), EngineError> {
        let Some(record) = self.store.get_workflow(workflow_id).await? else {
            return Ok(());
        };
        if !record.active {
            debug!(workflow_id = %workflow_id, "Ignoring events for inactive workflow");
            return Ok(());
        }
        let input: Map<String, Value> = events
            .iter()
            .map(|e| (e.event_type.clone(), e.to_value()))
            .collect();
        let snapshot = self.snapshot(record.id, record.revision).await?;
        let id = super::new_instance_id(&record.namespace, &record.name);
        if let Err(e) = self
            .start_instance(&record, snapshot, Value::Object(input), "events", None, id)
            .await
        {
            warn!(workflow_id = %workflow_id, error = %e, "Failed to start workflow from events");
            return Err(e);
        }
        Ok(())
    }
}
