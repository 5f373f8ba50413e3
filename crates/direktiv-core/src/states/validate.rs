// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
use async_trait::async_trait;
use direktiv_dsl::ValidateState;
use direktiv_workflows::{jq, schema};

use super::{StateLogic, StepContext, Transition};
use crate::error::{EngineError, codes};

#[async_trait]
impl StateLogic for ValidateState {
    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        _savedata: Option<&[u8]>,
        _wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        let subject = match &self.subject {
            Some(expression) => jq::query_one(expression, ctx.data())?,
            None => ctx.data().clone(),
        };
        schema::validate(&self.schema, &subject)
            .map_err(|errors| EngineError::catchable(codes::SCHEMA_FAILED, errors.join("; ")))?;
        Ok(Some(Transition::new(
            self.transform.as_ref(),
            self.transition.as_ref(),
        )))
    }
}
