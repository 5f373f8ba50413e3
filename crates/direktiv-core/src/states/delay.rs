// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktiv_dsl::{DelayState, parse_duration};
use serde::{Deserialize, Serialize};

use super::{StateLogic, StepContext, Transition, encode};
use crate::error::EngineError;

/// Slack between the wakeup and the state deadline.
const DEADLINE_SLACK: Duration = Duration::from_secs(60);

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sleeping {
    wake_at: DateTime<Utc>,
}

fn delay_of(state: &DelayState) -> Result<Duration, EngineError> {
    parse_duration(&state.duration).map_err(EngineError::internal)
}

#[async_trait]
impl StateLogic for DelayState {
    fn timeout(&self) -> Option<Duration> {
        delay_of(self).ok().map(|delay| delay + DEADLINE_SLACK)
    }

    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        savedata: Option<&[u8]>,
        wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        if savedata.is_some() && wakedata.is_some() {
            return Ok(Some(Transition::new(
                self.transform.as_ref(),
                self.transition.as_ref(),
            )));
        }

        let delay = chrono::Duration::from_std(delay_of(self)?).map_err(EngineError::internal)?;
        let wake_at = Utc::now() + delay;
        ctx.save_memory(encode(&Sleeping { wake_at })?).await?;
        ctx.sleep_until(wake_at).await?;
        Ok(None)
    }
}
