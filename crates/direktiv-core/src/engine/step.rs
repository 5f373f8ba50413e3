// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step execution: running a state, settling its outcome and moving the
//! instance along.

use std::time::Duration;

use chrono::Utc;
use direktiv_dsl::{RetryPolicy, State, parse_duration};
use direktiv_workflows::jq;
use direktiv_workflows::matching::glob_match;
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use super::context::{InstanceContext, Outbox};
use super::{Engine, RETRY_WAKEUP, SOFT_CANCEL, TimeoutRef, after};
use crate::error::{CoreError, EngineError, codes};
use crate::metrics;
use crate::persistence::{InstanceStatus, lock_key};
use crate::states::{self, Transition, encode, insert};

/// What a scheduled step is asked to do.
#[derive(Debug)]
pub(crate) enum StepInput {
    /// Run the current state. `None` is a first entry, `Some` resumes a
    /// suspended state with wake data.
    Run(Option<Vec<u8>>),
    /// Re-run the state after a retry delay.
    Retry,
    /// Raise an error in the current state without running it.
    Fail(EngineError),
}

/// Delay before retry number `attempt` (counted from zero):
/// `delay × multiplier^attempt`.
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .delay
        .as_deref()
        .and_then(|d| parse_duration(d).ok())
        .unwrap_or(Duration::ZERO);
    let multiplier = policy.multiplier.unwrap_or(1.0);
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    Duration::try_from_secs_f64(base.as_secs_f64() * multiplier.powi(exponent)).unwrap_or(base)
}

/// Transition of the first catcher matching `code`.
fn catcher<'s>(state: &'s State, code: &str) -> Option<Option<&'s String>> {
    state
        .common()
        .catch
        .iter()
        .find(|c| glob_match(&c.error, code))
        .map(|c| c.transition.as_ref())
}

fn retryable(policy: &RetryPolicy, code: &str) -> bool {
    policy.codes.is_empty() || policy.codes.iter().any(|pattern| glob_match(pattern, code))
}

impl Engine {
    /// Run a step of `instance_id` on its own task.
    pub(crate) fn schedule(&self, instance_id: &str, step: i32, input: StepInput) {
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            engine.run_step(&instance_id, step, input).await;
        });
    }

    #[instrument(skip(self, input))]
    async fn run_step(&self, instance_id: &str, step: i32, input: StepInput) {
        if let Err(e) = self.run_step_locked(instance_id, step, input).await {
            error!(error = %e, "Step aborted");
        }
    }

    async fn run_step_locked(
        &self,
        instance_id: &str,
        step: i32,
        input: StepInput,
    ) -> Result<(), EngineError> {
        let _permit = self
            .steps
            .clone()
            .acquire_owned()
            .await
            .map_err(EngineError::internal)?;
        let guard = self
            .locks
            .lock(lock_key(&["instance", instance_id]), self.config.lock_wait)
            .await?;
        let outbox = Outbox::default();
        let result = self.execute(instance_id, step, input, &outbox).await;
        // Tokens live for one step; a cancel between steps is caught by the
        // status guard on save.
        self.cancels.remove(instance_id);
        guard.unlock().await;
        self.flush(&outbox).await;
        result
    }

    async fn execute(
        &self,
        instance_id: &str,
        step: i32,
        input: StepInput,
        outbox: &Outbox,
    ) -> Result<(), EngineError> {
        let Some(instance) = self.store.get_instance(instance_id).await? else {
            debug!("Instance is gone");
            return Ok(());
        };
        if !instance.is_active() || instance.step() != step {
            debug!(status = %instance.status, current = instance.step(), "Dropping stale step");
            return Ok(());
        }

        let wakedata = match input {
            StepInput::Run(wakedata) if wakedata.is_some() != instance.memory.is_some() => {
                debug!("Dropping wakeup that does not match the saved continuation");
                return Ok(());
            }
            StepInput::Retry if instance.memory.is_some() => {
                debug!("Dropping retry of a suspended step");
                return Ok(());
            }
            StepInput::Run(wakedata) => wakedata,
            StepInput::Retry => None,
            StepInput::Fail(err) => {
                let snapshot = self.snapshot(instance.workflow_id, instance.revision).await?;
                let mut ctx = InstanceContext::new(self, snapshot.clone(), instance, outbox.clone());
                let Some(state) = ctx
                    .instance
                    .current_state()
                    .and_then(|id| snapshot.workflow.state(id))
                else {
                    return self.crash(&mut ctx, EngineError::internal("current state is missing")).await;
                };
                return self.handle_error(&mut ctx, state, err).await;
            }
        };

        let snapshot = self.snapshot(instance.workflow_id, instance.revision).await?;
        let mut ctx = InstanceContext::new(self, snapshot.clone(), instance, outbox.clone());
        let Some(state) = ctx
            .instance
            .current_state()
            .and_then(|id| snapshot.workflow.state(id))
        else {
            return self.crash(&mut ctx, EngineError::internal("current state is missing")).await;
        };

        ctx.instance.status = InstanceStatus::Running;
        ctx.instance.controller = self.config.hostname.clone();
        if !self.save(&ctx).await? {
            return Ok(());
        }

        if wakedata.is_none()
            && let Some(expression) = &state.common().log
        {
            match jq::query_one(expression, &ctx.instance.state_data) {
                Ok(Value::String(line)) => ctx.logger().info(&line).await,
                Ok(value) => ctx.logger().info(&value.to_string()).await,
                Err(e) => return self.handle_error(&mut ctx, state, e.into()).await,
            }
        }

        debug!(state = %state.id(), resumed = wakedata.is_some(), "Running state");
        let savedata = ctx.instance.memory.clone();
        let result = states::logic(state)
            .run(&mut ctx, savedata.as_deref(), wakedata.as_deref())
            .await;
        self.settle(&mut ctx, state, result).await
    }

    async fn settle(
        &self,
        ctx: &mut InstanceContext<'_>,
        state: &State,
        result: Result<Option<Transition>, EngineError>,
    ) -> Result<(), EngineError> {
        let transition = match result {
            Ok(Some(transition)) => transition,
            Ok(None) => {
                ctx.instance.status = InstanceStatus::Pending;
                self.save(ctx).await?;
                return Ok(());
            }
            Err(err) => return self.handle_error(ctx, state, err).await,
        };

        if let Some(transform) = &transition.transform {
            match jq::transform(transform, &ctx.instance.state_data) {
                Ok(data) => ctx.instance.state_data = data,
                Err(e) => return self.handle_error(ctx, state, e.into()).await,
            }
        }

        self.leave_step(ctx, state).await;
        match transition.next {
            Some(next) => self.transition(ctx, &next).await,
            None => self.complete(ctx).await,
        }
    }

    /// Route an error raised in `state`: catchers, then the retry policy,
    /// then failure.
    pub(crate) async fn handle_error(
        &self,
        ctx: &mut InstanceContext<'_>,
        state: &State,
        err: EngineError,
    ) -> Result<(), EngineError> {
        let (code, message) = match err {
            EngineError::Catchable { code, message } => (code, message),
            EngineError::Uncatchable { code, message } => {
                self.leave_step(ctx, state).await;
                return self.fail(ctx, code, message).await;
            }
            internal => {
                self.leave_step(ctx, state).await;
                return self.crash(ctx, internal).await;
            }
        };

        if let Some(next) = catcher(state, &code) {
            return self.catch(ctx, state, &code, &message, next.cloned()).await;
        }

        if let Some(policy) = state.retries()
            && retryable(policy, &code)
        {
            let attempts = u32::try_from(ctx.instance.attempts).unwrap_or(0);
            if attempts + 1 < policy.max_attempts {
                return self.retry(ctx, state, policy, &code, attempts).await;
            }
            if let Some(throw) = &policy.throw {
                info!(code = %code, throw = %throw, "Retries exhausted");
                if let Some(next) = catcher(state, throw) {
                    return self.catch(ctx, state, throw, &message, next.cloned()).await;
                }
                self.leave_step(ctx, state).await;
                return self.fail(ctx, throw.clone(), message).await;
            }
        }

        self.leave_step(ctx, state).await;
        self.fail(ctx, code, message).await
    }

    async fn catch(
        &self,
        ctx: &mut InstanceContext<'_>,
        state: &State,
        code: &str,
        message: &str,
        next: Option<String>,
    ) -> Result<(), EngineError> {
        ctx.logger()
            .error(&format!("state '{}' caught error {}: {}", state.id(), code, message))
            .await;
        self.leave_step(ctx, state).await;
        insert(
            &mut ctx.instance.state_data,
            "error",
            json!({ "code": code, "msg": message }),
        );
        match next {
            Some(next) => self.transition(ctx, &next).await,
            None => self.complete(ctx).await,
        }
    }

    async fn retry(
        &self,
        ctx: &mut InstanceContext<'_>,
        state: &State,
        policy: &RetryPolicy,
        code: &str,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let delay = retry_delay(policy, attempt);
        ctx.logger()
            .error(&format!(
                "state '{}' failed with {}, retrying in {:?}",
                state.id(),
                code,
                delay
            ))
            .await;
        self.leave_step(ctx, state).await;

        let at = after(Utc::now(), delay);
        let timeout = states::deadline(state, self.config.default_state_timeout);
        ctx.instance.attempts += 1;
        ctx.instance.memory = None;
        ctx.instance.status = InstanceStatus::Pending;
        ctx.instance.deadline = Some(after(at, timeout));
        if !self.save(ctx).await? {
            return Ok(());
        }

        let payload = encode(&ctx.step_ref())?;
        self.timers
            .add_one_shot(&ctx.instance.id, RETRY_WAKEUP, at, payload)
            .await?;
        self.arm_soft_timeout(ctx).await
    }

    /// Clean up after the current state: stop its children, drop its
    /// listeners and wakeup timer.
    pub(crate) async fn leave_step(&self, ctx: &InstanceContext<'_>, state: &State) {
        let children = states::logic(state).living_children(ctx.instance.memory.as_deref());
        self.cancel_children(children, "parent state finished").await;

        let id = &ctx.instance.id;
        if let Err(e) = self.store.delete_instance_listeners(id).await {
            warn!(instance_id = %id, error = %e, "Failed to delete instance listeners");
        }
        if let Err(e) = self.timers.delete(id).await {
            warn!(instance_id = %id, error = %e, "Failed to delete wakeup timer");
        }
        if let Some(begin) = ctx.instance.state_begin_time {
            let elapsed = (Utc::now() - begin).num_milliseconds().max(0) as f64;
            metrics::record_state(state.id(), elapsed);
        }
    }

    /// Move to `next` and schedule its first run.
    pub(crate) async fn transition(
        &self,
        ctx: &mut InstanceContext<'_>,
        next: &str,
    ) -> Result<(), EngineError> {
        let snapshot = ctx.snapshot.clone();
        let Some(state) = snapshot.workflow.state(next) else {
            return self
                .crash(ctx, EngineError::internal(format!("state '{}' does not exist", next)))
                .await;
        };

        let now = Utc::now();
        let timeout = states::deadline(state, self.config.default_state_timeout);
        let instance = &mut ctx.instance;
        instance.memory = None;
        instance.flow.push(next.to_string());
        instance.attempts = 0;
        instance.state_begin_time = Some(now);
        instance.deadline = Some(after(now, timeout));
        instance.status = InstanceStatus::Pending;
        if !self.save(ctx).await? {
            return Ok(());
        }

        debug!(instance_id = %ctx.instance.id, state = %next, step = ctx.instance.step(), "Transitioned");
        self.arm_soft_timeout(ctx).await?;
        self.schedule(&ctx.instance.id, ctx.instance.step(), StepInput::Run(None));
        Ok(())
    }

    async fn arm_soft_timeout(&self, ctx: &InstanceContext<'_>) -> Result<(), EngineError> {
        let Some(deadline) = ctx.instance.deadline else {
            return Ok(());
        };
        let payload = encode(&TimeoutRef {
            instance_id: ctx.instance.id.clone(),
            step: Some(ctx.instance.step()),
        })?;
        self.timers
            .add_one_shot(&format!("{}:soft", ctx.instance.id), SOFT_CANCEL, deadline, payload)
            .await?;
        Ok(())
    }

    async fn complete(&self, ctx: &mut InstanceContext<'_>) -> Result<(), EngineError> {
        ctx.instance.output = Some(ctx.instance.state_data.clone());
        self.terminate(ctx, InstanceStatus::Complete).await
    }

    async fn fail(
        &self,
        ctx: &mut InstanceContext<'_>,
        code: String,
        message: String,
    ) -> Result<(), EngineError> {
        ctx.logger()
            .error(&format!("workflow failed with {}: {}", code, message))
            .await;
        self.record_error(ctx, code, message);
        self.terminate(ctx, InstanceStatus::Failed).await
    }

    pub(crate) async fn crash(
        &self,
        ctx: &mut InstanceContext<'_>,
        err: EngineError,
    ) -> Result<(), EngineError> {
        error!(instance_id = %ctx.instance.id, error = %err, "Instance crashed");
        ctx.logger()
            .error(&format!("workflow crashed: {}", err.message()))
            .await;
        self.record_error(ctx, err.code().to_string(), err.message());
        self.terminate(ctx, InstanceStatus::Crashed).await
    }

    fn record_error(&self, ctx: &mut InstanceContext<'_>, code: String, message: String) {
        let instance = &mut ctx.instance;
        match &instance.error_code {
            Some(first) => {
                instance.error_message = Some(format!("{} after {}: {}", code, first, message));
                instance.error_code = Some(codes::MULTIPLE_ERRORS.to_string());
            }
            None => {
                instance.error_code = Some(code);
                instance.error_message = Some(message);
            }
        }
    }

    async fn terminate(
        &self,
        ctx: &mut InstanceContext<'_>,
        status: InstanceStatus,
    ) -> Result<(), EngineError> {
        let instance = &mut ctx.instance;
        instance.status = status;
        instance.memory = None;
        instance.deadline = None;
        instance.end_time = Some(Utc::now());
        if !self.save(ctx).await? {
            return Ok(());
        }
        self.finish(&ctx.instance).await;
        Ok(())
    }

    /// Write the instance unless it was cancelled meanwhile. Returns false
    /// when the write was skipped and the step must stop.
    pub(crate) async fn save(&self, ctx: &InstanceContext<'_>) -> Result<bool, EngineError> {
        if ctx.token.is_cancelled() {
            debug!(instance_id = %ctx.instance.id, "Instance cancelled, skipping write");
            return Ok(false);
        }
        match self.store.save_instance(&ctx.instance).await {
            Ok(()) => Ok(true),
            Err(CoreError::InvalidInstanceState { actual, .. }) => {
                debug!(instance_id = %ctx.instance.id, status = %actual, "Instance already terminal, skipping write");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
