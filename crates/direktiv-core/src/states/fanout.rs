// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `foreach` and `parallel`: bounded fan-out over function calls.
//!
//! Both start every call at once and keep one slot per child in the step
//! memory. Each child result wakes the step, fills its slot and either
//! suspends again or finishes the state with an array under `return`.

use std::time::Duration;

use async_trait::async_trait;
use direktiv_dsl::{BranchMode, ForeachState, ParallelState};
use direktiv_workflows::jq;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::action::{output_value, prepare_call, result_error};
use super::{
    ChildInfo, FunctionCall, StateLogic, StepContext, Transition, decode, encode, insert,
    parse_timeout,
};
use crate::actions::ActionResultPayload;
use crate::error::{EngineError, codes};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Slot {
    child: ChildInfo,
    #[serde(default)]
    done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<(String, String)>,
}

/// Start every call. Returns the results right away when there is nothing
/// to wait for.
async fn dispatch(
    ctx: &mut dyn StepContext,
    calls: Vec<FunctionCall>,
) -> Result<Option<Value>, EngineError> {
    if calls.is_empty() {
        return Ok(Some(Value::Array(Vec::new())));
    }
    let limit = ctx.max_parallel_actions();
    if calls.len() > limit {
        return Err(EngineError::uncatchable(
            codes::LIMITS_PARALLEL,
            format!("{} actions requested, at most {} allowed", calls.len(), limit),
        ));
    }

    let mut slots = Vec::with_capacity(calls.len());
    for call in calls {
        let child = ctx.call(call).await?;
        slots.push(Slot {
            child,
            done: false,
            output: None,
            error: None,
        });
    }
    ctx.save_memory(encode(&slots)?).await?;
    Ok(None)
}

/// Record one child result and decide whether the state is finished.
async fn resume(
    ctx: &mut dyn StepContext,
    mode: BranchMode,
    savedata: &[u8],
    wakedata: &[u8],
) -> Result<Option<Value>, EngineError> {
    let mut slots: Vec<Slot> = decode(savedata, "fan-out memory")?;
    let result: ActionResultPayload = decode(wakedata, "action result")?;

    let Some(index) = slots
        .iter()
        .position(|s| s.child.id == result.action_id && !s.done)
    else {
        ctx.log(&format!(
            "ignoring result of unknown action '{}'",
            result.action_id
        ))
        .await;
        return Ok(None);
    };

    let slot = &mut slots[index];
    slot.done = true;
    match result_error(&result) {
        Some(err) => {
            if mode == BranchMode::And {
                return Err(err);
            }
            slot.error = Some((err.code().to_string(), err.message()));
        }
        None => {
            let output = output_value(&result.output);
            if mode == BranchMode::Or {
                let mut results = vec![Value::Null; slots.len()];
                results[index] = output;
                return Ok(Some(Value::Array(results)));
            }
            slot.output = Some(output);
        }
    }

    if slots.iter().any(|s| !s.done) {
        ctx.save_memory(encode(&slots)?).await?;
        return Ok(None);
    }

    match mode {
        BranchMode::And => Ok(Some(Value::Array(
            slots
                .into_iter()
                .map(|s| s.output.unwrap_or(Value::Null))
                .collect(),
        ))),
        BranchMode::Or => {
            let reasons: Vec<String> = slots
                .iter()
                .filter_map(|s| s.error.as_ref())
                .map(|(code, message)| format!("{}: {}", code, message))
                .collect();
            Err(EngineError::catchable(
                codes::PARALLEL_ALL_FAILED,
                format!("all branches failed: {}", reasons.join("; ")),
            ))
        }
    }
}

fn living(savedata: Option<&[u8]>) -> Vec<ChildInfo> {
    savedata
        .and_then(|bytes| serde_json::from_slice::<Vec<Slot>>(bytes).ok())
        .map(|slots| {
            slots
                .into_iter()
                .filter(|s| !s.done)
                .map(|s| s.child)
                .collect()
        })
        .unwrap_or_default()
}

fn finish(
    ctx: &mut dyn StepContext,
    results: Option<Value>,
    transform: Option<&Value>,
    transition: Option<&String>,
) -> Option<Transition> {
    let results = results?;
    let mut data = ctx.data().clone();
    insert(&mut data, "return", results);
    ctx.set_data(data);
    Some(Transition::new(transform, transition))
}

#[async_trait]
impl StateLogic for ForeachState {
    fn timeout(&self) -> Option<Duration> {
        parse_timeout(self.timeout.as_ref())
    }

    fn living_children(&self, savedata: Option<&[u8]>) -> Vec<ChildInfo> {
        living(savedata)
    }

    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        savedata: Option<&[u8]>,
        wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        let results = match (savedata, wakedata) {
            (Some(savedata), Some(wakedata)) => {
                resume(ctx, BranchMode::And, savedata, wakedata).await?
            }
            _ => {
                let array = match jq::query_one(&self.array, ctx.data())? {
                    Value::Array(items) => items,
                    other => {
                        return Err(EngineError::catchable(
                            codes::JQ_BAD_COMMAND,
                            format!("foreach expects an array, got {}", jq::type_name(&other)),
                        ));
                    }
                };
                let mut calls = Vec::with_capacity(array.len());
                for item in &array {
                    calls.push(prepare_call(ctx, &self.action, item, false).await?);
                }
                dispatch(ctx, calls).await?
            }
        };
        Ok(finish(
            ctx,
            results,
            self.transform.as_ref(),
            self.transition.as_ref(),
        ))
    }
}

#[async_trait]
impl StateLogic for ParallelState {
    fn timeout(&self) -> Option<Duration> {
        parse_timeout(self.timeout.as_ref())
    }

    fn living_children(&self, savedata: Option<&[u8]>) -> Vec<ChildInfo> {
        living(savedata)
    }

    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        savedata: Option<&[u8]>,
        wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        let results = match (savedata, wakedata) {
            (Some(savedata), Some(wakedata)) => resume(ctx, self.mode, savedata, wakedata).await?,
            _ => {
                let subject = ctx.data().clone();
                let mut calls = Vec::with_capacity(self.actions.len());
                for action in &self.actions {
                    calls.push(prepare_call(ctx, action, &subject, false).await?);
                }
                dispatch(ctx, calls).await?
            }
        };
        Ok(finish(
            ctx,
            results,
            self.transform.as_ref(),
            self.transition.as_ref(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::logic;
    use crate::states::testing::{FakeContext, state};
    use serde_json::json;

    fn ok(id: &str, output: Value) -> Vec<u8> {
        serde_json::to_vec(&ActionResultPayload {
            action_id: id.into(),
            output: serde_json::to_vec(&output).unwrap(),
            ..Default::default()
        })
        .unwrap()
    }

    fn failed(id: &str) -> Vec<u8> {
        serde_json::to_vec(&ActionResultPayload::failure(id, "au.com.direktiv.error.x", "bad"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_foreach_collects_in_order() {
        let s = state(
            "id: each\ntype: foreach\narray: '.items'\naction:\n  function: echo\n  input: '{n: .}'\n",
        );
        let mut ctx = FakeContext::new(json!({"items": [1, 2]}));
        assert!(logic(&s).run(&mut ctx, None, None).await.unwrap().is_none());
        assert_eq!(ctx.calls[1].input, json!({"n": 2}));

        // Results arrive out of order.
        let memory = ctx.memory.clone().unwrap();
        assert!(
            logic(&s)
                .run(&mut ctx, Some(&memory), Some(&ok("child-1", json!("b"))))
                .await
                .unwrap()
                .is_none()
        );
        let memory = ctx.memory.clone().unwrap();
        assert_eq!(logic(&s).living_children(Some(&memory)).len(), 1);

        let t = logic(&s)
            .run(&mut ctx, Some(&memory), Some(&ok("child-0", json!("a"))))
            .await
            .unwrap();
        assert!(t.is_some());
        assert_eq!(ctx.data()["return"], json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_foreach_over_empty_array_finishes_immediately() {
        let s = state("id: each\ntype: foreach\narray: '.items'\naction:\n  function: echo\n");
        let mut ctx = FakeContext::new(json!({"items": []}));
        assert!(logic(&s).run(&mut ctx, None, None).await.unwrap().is_some());
        assert_eq!(ctx.data()["return"], json!([]));
        assert!(ctx.calls.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_limit_is_uncatchable() {
        let s = state("id: each\ntype: foreach\narray: '.items'\naction:\n  function: echo\n");
        let mut ctx = FakeContext::new(json!({"items": [1, 2, 3]}));
        ctx.max_parallel = 2;
        let err = logic(&s).run(&mut ctx, None, None).await.unwrap_err();
        assert_eq!(err.code(), codes::LIMITS_PARALLEL);
        assert!(matches!(err, EngineError::Uncatchable { .. }));
    }

    #[tokio::test]
    async fn test_parallel_or_first_success_wins() {
        let s = state(
            "id: p\ntype: parallel\nmode: or\nactions:\n  - function: echo\n  - function: echo\n",
        );
        let mut ctx = FakeContext::new(json!({}));
        logic(&s).run(&mut ctx, None, None).await.unwrap();
        let memory = ctx.memory.clone().unwrap();

        assert!(
            logic(&s)
                .run(&mut ctx, Some(&memory), Some(&failed("child-0")))
                .await
                .unwrap()
                .is_none()
        );
        let memory = ctx.memory.clone().unwrap();
        logic(&s)
            .run(&mut ctx, Some(&memory), Some(&ok("child-1", json!({"v": 1}))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.data()["return"], json!([null, {"v": 1}]));
    }

    #[tokio::test]
    async fn test_parallel_or_all_failed() {
        let s = state(
            "id: p\ntype: parallel\nmode: or\nactions:\n  - function: echo\n  - function: echo\n",
        );
        let mut ctx = FakeContext::new(json!({}));
        logic(&s).run(&mut ctx, None, None).await.unwrap();
        let memory = ctx.memory.clone().unwrap();
        logic(&s)
            .run(&mut ctx, Some(&memory), Some(&failed("child-1")))
            .await
            .unwrap();
        let memory = ctx.memory.clone().unwrap();
        let err = logic(&s)
            .run(&mut ctx, Some(&memory), Some(&failed("child-0")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::PARALLEL_ALL_FAILED);
        assert!(matches!(err, EngineError::Catchable { .. }));
    }

    #[tokio::test]
    async fn test_parallel_and_fails_on_first_error() {
        let s = state("id: p\ntype: parallel\nactions:\n  - function: echo\n  - function: echo\n");
        let mut ctx = FakeContext::new(json!({}));
        logic(&s).run(&mut ctx, None, None).await.unwrap();
        let memory = ctx.memory.clone().unwrap();
        let err = logic(&s)
            .run(&mut ctx, Some(&memory), Some(&failed("child-1")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "au.com.direktiv.error.x");
    }
}
