// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use direktiv_dsl::GenerateEventState;
use direktiv_workflows::jq;
use serde_json::Value;

use super::{StateLogic, StepContext, Transition};
use crate::error::{EngineError, codes};
use crate::events::CloudEvent;

fn is_json(content_type: Option<&str>) -> bool {
    match content_type {
        None | Some("") => true,
        Some(ct) => ct == "application/json" || ct.ends_with("+json"),
    }
}

#[async_trait]
impl StateLogic for GenerateEventState {
    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        _savedata: Option<&[u8]>,
        _wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        let definition = &self.event;
        let source = definition
            .source
            .clone()
            .unwrap_or_else(|| ctx.instance().id.clone());

        let payload = jq::query_one(definition.data.as_deref().unwrap_or("."), ctx.data())?;
        let mut event = CloudEvent::new(&definition.event_type, source);
        let content_type = definition.datacontenttype.as_deref();
        event = if is_json(content_type) {
            event.with_json(payload)
        } else {
            let bytes = match payload {
                Value::String(text) => BASE64.decode(&text).unwrap_or_else(|_| text.into_bytes()),
                other => other.to_string().into_bytes(),
            };
            event.with_binary(content_type.unwrap_or_default(), &bytes)
        };

        for (key, value) in &definition.context {
            let value = jq::evaluate(value, ctx.data()).map_err(|e| {
                EngineError::catchable(
                    codes::EVENT_JQ,
                    format!("context '{}' failed: {}", key, e),
                )
            })?;
            event = event.with_extension(key, value);
        }

        ctx.emit(event).await?;
        Ok(Some(Transition::new(
            self.transform.as_ref(),
            self.transition.as_ref(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SPEC_VERSION;
    use crate::states::logic;
    use crate::states::testing::{FakeContext, state};
    use serde_json::json;

    #[tokio::test]
    async fn test_generates_json_event_with_context() {
        let s = state(
            r#"
id: gen
type: generateEvent
event:
  type: order.shipped
  data: '.order'
  context:
    orderid: '.order.id'
    region: '"eu"'
    priority: 3
transition: done
"#,
        );
        let mut ctx = FakeContext::new(json!({"order": {"id": "o-1"}}));
        logic(&s).run(&mut ctx, None, None).await.unwrap().unwrap();

        let event = &ctx.emitted[0];
        assert_eq!(event.specversion, SPEC_VERSION);
        assert_eq!(event.source, "ns/wf/abcdef");
        assert_eq!(event.data, Some(json!({"id": "o-1"})));
        assert_eq!(event.extensions["orderid"], "o-1");
        assert_eq!(event.extensions["region"], "eu");
        assert_eq!(event.extensions["priority"], 3);
    }

    #[tokio::test]
    async fn test_binary_payload_is_base64() {
        let s = state(
            "id: gen\ntype: generateEvent\nevent:\n  type: blob\n  source: me\n  datacontenttype: text/plain\n  data: '.text'\n",
        );
        let mut ctx = FakeContext::new(json!({"text": "aGVsbG8="}));
        logic(&s).run(&mut ctx, None, None).await.unwrap().unwrap();

        let event = &ctx.emitted[0];
        assert_eq!(event.source, "me");
        assert_eq!(event.data_base64.as_deref(), Some("aGVsbG8="));
        assert_eq!(event.datacontenttype.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_bad_context_expression_raises_event_jq() {
        let s = state(
            "id: gen\ntype: generateEvent\nevent:\n  type: x\n  context:\n    bad: '.['\n",
        );
        let mut ctx = FakeContext::new(json!({}));
        let err = logic(&s).run(&mut ctx, None, None).await.unwrap_err();
        assert_eq!(err.code(), codes::EVENT_JQ);
        assert!(ctx.emitted.is_empty());
    }
}
