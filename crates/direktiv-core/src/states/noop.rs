// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
use async_trait::async_trait;
use direktiv_dsl::NoopState;

use super::{StateLogic, StepContext, Transition};
use crate::error::EngineError;

#[async_trait]
impl StateLogic for NoopState {
    async fn run(
        &self,
        _ctx: &mut dyn StepContext,
        _savedata: Option<&[u8]>,
        _wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        Ok(Some(Transition::new(
            self.transform.as_ref(),
            self.transition.as_ref(),
        )))
    }
}
