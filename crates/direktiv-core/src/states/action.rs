// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `action`: one function call.
//!
//! A synchronous action suspends until the child's [`ActionResultPayload`]
//! arrives as wake data and stores the result under `return`. Async actions
//! start the call and move on.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use direktiv_dsl::{ActionDefinition, ActionState};
use direktiv_workflows::jq;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    ChildInfo, FunctionCall, StateLogic, StepContext, Transition, decode, encode, insert,
    parse_timeout,
};
use crate::actions::ActionResultPayload;
use crate::error::EngineError;

#[derive(Serialize, Deserialize)]
struct Waiting {
    child: ChildInfo,
}

/// Build the call for `action` with `subject` as jq input.
///
/// Requested secrets are visible to the input expression under `secrets`.
pub(super) async fn prepare_call(
    ctx: &mut dyn StepContext,
    action: &ActionDefinition,
    subject: &Value,
    is_async: bool,
) -> Result<FunctionCall, EngineError> {
    let function = ctx
        .function(&action.function)
        .cloned()
        .ok_or_else(|| EngineError::internal(format!("function '{}' not defined", action.function)))?;

    let input = match action.input.as_deref() {
        None => subject.clone(),
        Some(expression) => {
            let mut scope = subject.clone();
            if !action.secrets.is_empty() {
                let mut secrets = Map::new();
                for name in &action.secrets {
                    secrets.insert(name.clone(), Value::String(ctx.secret(name).await?));
                }
                insert(&mut scope, "secrets", Value::Object(secrets));
            }
            jq::query_one(expression, &scope)?
        }
    };

    Ok(FunctionCall {
        function,
        input,
        is_async,
    })
}

/// Decode a child's output: JSON when it parses, otherwise a base64 string.
pub(super) fn output_value(output: &[u8]) -> Value {
    if output.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(output).unwrap_or_else(|_| Value::String(BASE64.encode(output)))
}

/// Turn a failed child result into a catchable error.
pub(super) fn result_error(result: &ActionResultPayload) -> Option<EngineError> {
    result.error_code.as_ref().map(|code| {
        EngineError::catchable(
            code.clone(),
            result.error_message.clone().unwrap_or_default(),
        )
    })
}

#[async_trait]
impl StateLogic for ActionState {
    fn timeout(&self) -> Option<Duration> {
        parse_timeout(self.timeout.as_ref())
    }

    fn living_children(&self, savedata: Option<&[u8]>) -> Vec<ChildInfo> {
        savedata
            .and_then(|bytes| serde_json::from_slice::<Waiting>(bytes).ok())
            .map(|w| vec![w.child])
            .unwrap_or_default()
    }

    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        savedata: Option<&[u8]>,
        wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        let (Some(savedata), Some(wakedata)) = (savedata, wakedata) else {
            let subject = ctx.data().clone();
            let call = prepare_call(ctx, &self.action, &subject, self.is_async).await?;
            let child = ctx.call(call).await?;
            if self.is_async {
                return Ok(Some(Transition::new(
                    self.transform.as_ref(),
                    self.transition.as_ref(),
                )));
            }
            ctx.save_memory(encode(&Waiting { child })?).await?;
            return Ok(None);
        };

        let waiting: Waiting = decode(savedata, "action memory")?;
        let result: ActionResultPayload = decode(wakedata, "action result")?;
        if result.action_id != waiting.child.id {
            ctx.log(&format!(
                "ignoring result of unknown action '{}'",
                result.action_id
            ))
            .await;
            return Ok(None);
        }
        if let Some(err) = result_error(&result) {
            return Err(err);
        }

        let mut data = ctx.data().clone();
        insert(&mut data, "return", output_value(&result.output));
        ctx.set_data(data);
        Ok(Some(Transition::new(
            self.transform.as_ref(),
            self.transition.as_ref(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::logic;
    use crate::states::testing::{FakeContext, state};
    use serde_json::json;

    const ACTION: &str = r#"
id: call
type: action
action:
  function: echo
  input: '{name: .name, token: .secrets.token}'
  secrets: [token]
transition: next
"#;

    #[tokio::test]
    async fn test_action_suspends_then_stores_return() {
        let s = state(ACTION);
        let mut ctx = FakeContext::new(json!({"name": "ada"}));
        ctx.secrets.insert("token".into(), "t0k".into());

        assert!(logic(&s).run(&mut ctx, None, None).await.unwrap().is_none());
        assert_eq!(ctx.calls.len(), 1);
        assert_eq!(ctx.calls[0].input, json!({"name": "ada", "token": "t0k"}));
        assert!(ctx.data().get("secrets").is_none());

        let memory = ctx.memory.clone().unwrap();
        assert_eq!(logic(&s).living_children(Some(&memory))[0].id, "child-0");

        let wake = serde_json::to_vec(&ActionResultPayload {
            action_id: "child-0".into(),
            output: br#"{"greeting":"hi ada"}"#.to_vec(),
            ..Default::default()
        })
        .unwrap();
        let t = logic(&s)
            .run(&mut ctx, Some(&memory), Some(&wake))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.next.as_deref(), Some("next"));
        assert_eq!(ctx.data()["return"], json!({"greeting": "hi ada"}));
    }

    #[tokio::test]
    async fn test_function_error_is_catchable() {
        let s = state(ACTION);
        let mut ctx = FakeContext::new(json!({"name": "ada"}));
        ctx.secrets.insert("token".into(), "t0k".into());
        logic(&s).run(&mut ctx, None, None).await.unwrap();
        let memory = ctx.memory.clone().unwrap();

        let wake = serde_json::to_vec(&ActionResultPayload::failure(
            "child-0",
            "au.com.direktiv.error.greeting",
            "no greeting",
        ))
        .unwrap();
        let err = logic(&s)
            .run(&mut ctx, Some(&memory), Some(&wake))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Catchable { .. }));
        assert_eq!(err.code(), "au.com.direktiv.error.greeting");
    }

    #[tokio::test]
    async fn test_missing_secret_fails_before_calling() {
        let s = state(ACTION);
        let mut ctx = FakeContext::new(json!({"name": "ada"}));
        let err = logic(&s).run(&mut ctx, None, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Uncatchable { .. }));
        assert!(ctx.calls.is_empty());
    }

    #[tokio::test]
    async fn test_async_action_moves_on() {
        let s = state("id: a\ntype: action\nasync: true\naction:\n  function: echo\ntransition: b\n");
        let mut ctx = FakeContext::new(json!({"x": 1}));
        let t = logic(&s).run(&mut ctx, None, None).await.unwrap().unwrap();
        assert_eq!(t.next.as_deref(), Some("b"));
        assert!(ctx.calls[0].is_async);
        assert!(ctx.memory.is_none());
    }

    #[test]
    fn test_binary_output_becomes_base64() {
        assert_eq!(output_value(&[0xff, 0xfe]), json!("//4="));
        assert_eq!(output_value(b"[1,2]"), json!([1, 2]));
        assert_eq!(output_value(b""), Value::Null);
    }
}
