// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `consumeEvent`, `eventsAnd` and `eventsXor`.
//!
//! All three register an instance listener on first entry and suspend. The
//! listener fires once and wakes the step with the matched events, each of
//! which is stored in the state data under its event type.

use std::time::Duration;

use async_trait::async_trait;
use direktiv_dsl::{ConsumeEventState, EventTemplate, EventsAndState, EventsXorState};
use serde_json::json;

use super::{StateLogic, StepContext, Transition, decode, encode, insert, parse_timeout};
use crate::error::EngineError;
use crate::events::{CloudEvent, matches_template};

async fn wait_for(
    ctx: &mut dyn StepContext,
    templates: Vec<EventTemplate>,
    correlate: Vec<String>,
    all: bool,
) -> Result<Option<Transition>, EngineError> {
    ctx.save_memory(encode(&json!({"listening": true}))?).await?;
    ctx.listen(templates, correlate, all).await?;
    Ok(None)
}

fn store_events(ctx: &mut dyn StepContext, events: &[CloudEvent]) {
    let mut data = ctx.data().clone();
    for event in events {
        insert(&mut data, &event.event_type, event.to_value());
    }
    ctx.set_data(data);
}

#[async_trait]
impl StateLogic for ConsumeEventState {
    fn timeout(&self) -> Option<Duration> {
        parse_timeout(self.timeout.as_ref())
    }

    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        _savedata: Option<&[u8]>,
        wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        let Some(wakedata) = wakedata else {
            return wait_for(ctx, vec![self.event.clone()], Vec::new(), false).await;
        };
        let events: Vec<CloudEvent> = decode(wakedata, "event wake data")?;
        store_events(ctx, &events);
        Ok(Some(Transition::new(
            self.transform.as_ref(),
            self.transition.as_ref(),
        )))
    }
}

#[async_trait]
impl StateLogic for EventsAndState {
    fn timeout(&self) -> Option<Duration> {
        parse_timeout(self.timeout.as_ref())
    }

    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        _savedata: Option<&[u8]>,
        wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        let Some(wakedata) = wakedata else {
            return wait_for(ctx, self.events.clone(), self.correlate.clone(), true).await;
        };
        let events: Vec<CloudEvent> = decode(wakedata, "event wake data")?;
        if events.len() != self.events.len() {
            return Err(EngineError::internal(format!(
                "eventsAnd woke with {} of {} events",
                events.len(),
                self.events.len()
            )));
        }
        store_events(ctx, &events);
        Ok(Some(Transition::new(
            self.transform.as_ref(),
            self.transition.as_ref(),
        )))
    }
}

#[async_trait]
impl StateLogic for EventsXorState {
    fn timeout(&self) -> Option<Duration> {
        parse_timeout(self.timeout.as_ref())
    }

    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        _savedata: Option<&[u8]>,
        wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        let Some(wakedata) = wakedata else {
            let templates = self.events.iter().map(|b| b.event.clone()).collect();
            return wait_for(ctx, templates, Vec::new(), false).await;
        };
        let events: Vec<CloudEvent> = decode(wakedata, "event wake data")?;
        let Some(event) = events.first() else {
            return Err(EngineError::internal("woken without an event"));
        };
        let Some(branch) = self.events.iter().find(|b| matches_template(&b.event, event)) else {
            return Err(EngineError::internal(format!(
                "event '{}' matches no branch",
                event.event_type
            )));
        };
        store_events(ctx, std::slice::from_ref(event));
        Ok(Some(Transition::new(
            branch.transform.as_ref(),
            branch.transition.as_ref(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::logic;
    use crate::states::testing::{FakeContext, state};
    use serde_json::json;

    fn wake(events: &[CloudEvent]) -> Vec<u8> {
        serde_json::to_vec(events).unwrap()
    }

    #[tokio::test]
    async fn test_consume_event_listens_then_stores_event() {
        let s = state(
            "id: wait\ntype: consumeEvent\nevent:\n  type: order.created\ntimeout: PT1H\ntransition: next\n",
        );
        assert_eq!(logic(&s).timeout(), Some(Duration::from_secs(3600)));

        let mut ctx = FakeContext::new(json!({"keep": 1}));
        assert!(logic(&s).run(&mut ctx, None, None).await.unwrap().is_none());
        assert_eq!(ctx.listens.len(), 1);
        assert_eq!(ctx.listens[0].templates[0].event_type, "order.created");
        assert!(!ctx.listens[0].all);
        let memory = ctx.memory.clone().unwrap();

        let event = CloudEvent::new("order.created", "shop").with_json(json!({"id": 9}));
        let t = logic(&s)
            .run(&mut ctx, Some(&memory), Some(&wake(&[event])))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.next.as_deref(), Some("next"));
        assert_eq!(ctx.instance.state_data["keep"], 1);
        assert_eq!(ctx.instance.state_data["order.created"]["data"]["id"], 9);
    }

    #[tokio::test]
    async fn test_events_and_requires_all_with_correlation() {
        let s = state(
            "id: both\ntype: eventsAnd\nevents:\n  - type: a\n  - type: b\ncorrelate: [orderid]\n",
        );
        let mut ctx = FakeContext::new(json!({}));
        assert!(logic(&s).run(&mut ctx, None, None).await.unwrap().is_none());
        assert!(ctx.listens[0].all);
        assert_eq!(ctx.listens[0].correlate, vec!["orderid".to_string()]);

        let events = [CloudEvent::new("a", "x"), CloudEvent::new("b", "x")];
        let memory = ctx.memory.clone().unwrap();
        let t = logic(&s)
            .run(&mut ctx, Some(&memory), Some(&wake(&events)))
            .await
            .unwrap()
            .unwrap();
        assert!(t.next.is_none());
        assert!(ctx.instance.state_data.get("a").is_some());
        assert!(ctx.instance.state_data.get("b").is_some());
    }

    #[tokio::test]
    async fn test_events_and_rejects_partial_wake() {
        let s = state("id: both\ntype: eventsAnd\nevents:\n  - type: a\n  - type: b\n");
        let mut ctx = FakeContext::new(json!({}));
        assert!(logic(&s).run(&mut ctx, None, None).await.unwrap().is_none());

        let memory = ctx.memory.clone().unwrap();
        let err = logic(&s)
            .run(&mut ctx, Some(&memory), Some(&wake(&[CloudEvent::new("a", "x")])))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)), "{:?}", err);
        assert!(ctx.instance.state_data.get("a").is_none());
    }

    #[tokio::test]
    async fn test_events_xor_follows_matching_branch() {
        let s = state(
            r#"
id: either
type: eventsXor
events:
  - event:
      type: approved
    transition: ship
  - event:
      type: rejected
    transform: '{"rejected": true}'
    transition: refund
"#,
        );
        let mut ctx = FakeContext::new(json!({}));
        assert!(logic(&s).run(&mut ctx, None, None).await.unwrap().is_none());
        assert_eq!(ctx.listens[0].templates.len(), 2);

        let memory = ctx.memory.clone().unwrap();
        let t = logic(&s)
            .run(
                &mut ctx,
                Some(&memory),
                Some(&wake(&[CloudEvent::new("rejected", "x")])),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.next.as_deref(), Some("refund"));
        assert!(t.transform.is_some());
    }
}
