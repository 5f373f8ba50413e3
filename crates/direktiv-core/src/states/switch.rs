// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
use async_trait::async_trait;
use direktiv_dsl::SwitchState;
use direktiv_workflows::jq;
use serde_json::Value;

use super::{StateLogic, StepContext, Transition};
use crate::error::EngineError;

fn holds(condition: &Value, data: &Value) -> Result<bool, EngineError> {
    match condition {
        Value::String(expression) => Ok(jq::condition(expression, data)?),
        literal => Ok(jq::is_truthy(literal)),
    }
}

#[async_trait]
impl StateLogic for SwitchState {
    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        _savedata: Option<&[u8]>,
        _wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        for condition in &self.conditions {
            if holds(&condition.condition, ctx.data())? {
                return Ok(Some(Transition::new(
                    condition.transform.as_ref(),
                    condition.transition.as_ref(),
                )));
            }
        }
        Ok(Some(Transition::new(
            self.default_transform.as_ref(),
            self.default_transition.as_ref(),
        )))
    }
}
