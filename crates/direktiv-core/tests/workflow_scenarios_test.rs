// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end workflow runs on the in-memory backends.
//!
//! Each test deploys a document, invokes it and waits for the instance to
//! terminate, then checks output, status and the rows left behind.

mod common;

use std::time::Duration;

use common::*;
use direktiv_core::actions::{MockReply, MockSandbox};
use direktiv_core::error::codes;
use direktiv_core::events::CloudEvent;
use direktiv_core::persistence::{InstanceStatus, Page};
use serde_json::json;

const FUNCTIONS: &str = r#"
functions:
  - id: f
    type: knative-workflow
    image: direktiv/request
  - id: f1
    type: knative-workflow
    image: direktiv/one
  - id: f2
    type: knative-workflow
    image: direktiv/two
"#;

fn with_functions(states: &str) -> String {
    format!("direktiv_api: workflow/v1\n{}{}", FUNCTIONS, states)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_noop_transform() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "noop",
        r#"
direktiv_api: workflow/v1
states:
  - id: s1
    type: noop
    transform: '. + {x: 1}'
"#,
    )
    .await;

    let instance = node.run("noop", json!({"a": 2})).await;
    assert_eq!(instance.status, InstanceStatus::Complete);
    assert_eq!(instance.output, Some(json!({"a": 2, "x": 1})));
    assert_eq!(instance.flow, vec!["s1".to_string()]);
    assert!(instance.end_time.is_some());

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transforms_compose_along_the_flow() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "chain",
        r#"
direktiv_api: workflow/v1
states:
  - id: first
    type: noop
    transform: '. + {n: (.n * 2)}'
    transition: second
  - id: second
    type: noop
    transform: '. + {n: (.n + 3)}'
"#,
    )
    .await;

    let instance = node.run("chain", json!({"n": 5})).await;
    assert_eq!(instance.output, Some(json!({"n": 13})));
    assert_eq!(instance.flow, vec!["first".to_string(), "second".to_string()]);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_switch_default_transition() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "switch",
        r#"
direktiv_api: workflow/v1
states:
  - id: s1
    type: switch
    conditions:
      - condition: '.a > 10'
        transition: hi
    defaultTransition: lo
  - id: hi
    type: noop
  - id: lo
    type: noop
    transform: '. + {picked: "lo"}'
"#,
    )
    .await;

    let instance = node.run("switch", json!({"a": 3})).await;
    assert_eq!(instance.status, InstanceStatus::Complete);
    assert_eq!(instance.output, Some(json!({"a": 3, "picked": "lo"})));
    assert_eq!(instance.flow, vec!["s1".to_string(), "lo".to_string()]);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delay_suspends_on_a_one_shot_timer() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "delay",
        r#"
direktiv_api: workflow/v1
states:
  - id: s1
    type: delay
    duration: PT1S
"#,
    )
    .await;

    let started = std::time::Instant::now();
    let instance = node
        .engine
        .invoke(NAMESPACE, "delay", json!({}))
        .await
        .unwrap();
    let suspended = node.wait_for_suspended(&instance.id, "s1").await;
    assert_eq!(suspended.status, InstanceStatus::Pending);
    assert!(suspended.end_time.is_none());

    let store = node.engine.store();
    let timer = store.get_timer(&instance.id).await.unwrap().expect("wakeup timer");
    assert!(timer.one_shot.is_some());
    assert!(timer.cron.is_none());

    let done = node.wait_for_terminal(&instance.id).await;
    assert_eq!(done.status, InstanceStatus::Complete);
    assert!(started.elapsed() >= Duration::from_secs(1));

    assert!(store.get_timer(&instance.id).await.unwrap().is_none());
    let leftovers: Vec<_> = store
        .list_timers()
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.name.starts_with(&instance.id))
        .collect();
    assert!(leftovers.is_empty(), "timers left behind: {:?}", leftovers);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_and_start_correlates_by_key() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "correlated",
        r#"
direktiv_api: workflow/v1
start:
  type: eventsAnd
  events:
    - type: A
    - type: B
  correlate: [key]
states:
  - id: s1
    type: noop
"#,
    )
    .await;

    for (event_type, key) in [("A", "1"), ("B", "2"), ("A", "2"), ("B", "1")] {
        let event = CloudEvent::new(event_type, "tests").with_extension("key", json!(key));
        node.engine.broadcast_event(NAMESPACE, event).await.unwrap();
    }

    let engine = node.engine.clone();
    assert!(
        eventually(Duration::from_secs(10), || {
            let engine = engine.clone();
            async move {
                let instances = engine.list_instances(NAMESPACE, Page::ALL).await.unwrap();
                instances.len() == 2 && instances.iter().all(|i| !i.is_active())
            }
        })
        .await
    );

    let instances = node.engine.list_instances(NAMESPACE, Page::ALL).await.unwrap();
    let mut keys: Vec<String> = Vec::new();
    for instance in &instances {
        assert_eq!(instance.status, InstanceStatus::Complete);
        assert_eq!(instance.invoker, "events");
        let a = &instance.input["A"];
        let b = &instance.input["B"];
        assert_eq!(a["type"], "A");
        assert_eq!(b["type"], "B");
        assert_eq!(a["key"], b["key"]);
        keys.push(a["key"].as_str().unwrap().to_string());
    }
    keys.sort();
    assert_eq!(keys, vec!["1".to_string(), "2".to_string()]);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_then_throw_into_catcher() {
    let sandbox = MockSandbox::new(|_| MockReply::Error {
        code: "x".into(),
        message: "always broken".into(),
    });
    let node = TestNode::start(sandbox).await;
    node.deploy(
        "retrying",
        &with_functions(
            r#"
states:
  - id: s1
    type: action
    action:
      function: f
      retries:
        maxAttempts: 2
        delay: PT1S
        throw: myErr
    catch:
      - error: myErr
        transition: end
  - id: end
    type: noop
"#,
        ),
    )
    .await;

    let instance = node.run("retrying", json!({})).await;
    assert_eq!(instance.status, InstanceStatus::Complete);
    assert_eq!(instance.flow, vec!["s1".to_string(), "end".to_string()]);
    assert_eq!(node.sandbox.requests().await.len(), 2);

    let output = instance.output.unwrap();
    assert_eq!(output["error"]["code"], "myErr");
    assert_eq!(output["error"]["msg"], "always broken");

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_or_all_failed() {
    let sandbox = MockSandbox::new(|req| MockReply::Error {
        code: format!("{}.failed", req.container.image.clone().unwrap_or_default()),
        message: "no".into(),
    });
    let node = TestNode::start(sandbox).await;
    node.deploy(
        "either",
        &with_functions(
            r#"
states:
  - id: s1
    type: parallel
    mode: or
    actions:
      - function: f1
      - function: f2
"#,
        ),
    )
    .await;

    let instance = node.run("either", json!({})).await;
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.error_code.as_deref(), Some(codes::PARALLEL_ALL_FAILED));
    assert_eq!(node.sandbox.requests().await.len(), 2);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_or_first_success_wins() {
    let sandbox = MockSandbox::new(|req| match req.container.image.as_deref() {
        Some("direktiv/one") => MockReply::Hang,
        _ => MockReply::Json(json!({"winner": 2})),
    });
    let node = TestNode::start(sandbox).await;
    node.deploy(
        "race",
        &with_functions(
            r#"
states:
  - id: s1
    type: parallel
    mode: or
    actions:
      - function: f1
      - function: f2
"#,
        ),
    )
    .await;

    let instance = node.run("race", json!({})).await;
    assert_eq!(instance.status, InstanceStatus::Complete);
    assert_eq!(
        instance.output.unwrap()["return"],
        json!([null, {"winner": 2}])
    );

    // The hanging branch is cancelled once the state is left.
    let hanging = node
        .sandbox
        .requests()
        .await
        .into_iter()
        .find(|r| r.container.image.as_deref() == Some("direktiv/one"))
        .expect("hanging request")
        .action_id;
    let sandbox = node.sandbox.clone();
    assert!(
        eventually(Duration::from_secs(5), || {
            let sandbox = sandbox.clone();
            let hanging = hanging.clone();
            async move { sandbox.cancelled().await.contains(&hanging) }
        })
        .await
    );

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_action_result_stored_under_return() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "echo",
        &with_functions(
            r#"
states:
  - id: call
    type: action
    action:
      function: f
      input: '{greeting: ("hi " + .name)}'
    transform: '{said: .return.greeting}'
"#,
        ),
    )
    .await;

    let instance = node.run("echo", json!({"name": "ada"})).await;
    assert_eq!(instance.status, InstanceStatus::Complete);
    assert_eq!(instance.output, Some(json!({"said": "hi ada"})));

    let requests = node.sandbox.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].workflow.instance, instance.id);
    assert_eq!(requests[0].workflow.step, 1);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_error_state_fails_with_formatted_message() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "raise",
        r#"
direktiv_api: workflow/v1
states:
  - id: s1
    type: error
    error: app.invalid
    message: 'order %s is invalid'
    args: ['.order']
"#,
    )
    .await;

    let instance = node.run("raise", json!({"order": "o-7"})).await;
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.error_code.as_deref(), Some("app.invalid"));
    assert_eq!(instance.error_message.as_deref(), Some("order o-7 is invalid"));

    let logs = node
        .engine
        .instance_logs(&instance.id, Page::ALL)
        .await
        .unwrap();
    assert!(logs.iter().any(|l| l.message.contains("app.invalid")));

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_jq_failure_is_catchable() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "badjq",
        r#"
direktiv_api: workflow/v1
states:
  - id: s1
    type: noop
    transform: '.a.b.c'
    catch:
      - error: 'direktiv.jq.*'
        transition: recover
  - id: recover
    type: noop
    transform: '{recovered: .error.code}'
"#,
    )
    .await;

    let instance = node.run("badjq", json!({"a": 1})).await;
    assert_eq!(instance.status, InstanceStatus::Complete);
    let recovered = instance.output.unwrap()["recovered"].clone();
    assert!(recovered.as_str().unwrap().starts_with("direktiv.jq."));

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_setter_and_getter_share_workflow_variables() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "vars",
        r#"
direktiv_api: workflow/v1
states:
  - id: store
    type: setter
    variables:
      - key: counter
        scope: workflow
        value: '.start + 1'
    transition: load
  - id: load
    type: getter
    variables:
      - key: counter
        scope: workflow
"#,
    )
    .await;

    let instance = node.run("vars", json!({"start": 41})).await;
    assert_eq!(instance.status, InstanceStatus::Complete);
    assert_eq!(instance.output.unwrap()["var"]["counter"], json!(42));

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_consume_event_resumes_with_the_event() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "waiter",
        r#"
direktiv_api: workflow/v1
states:
  - id: wait
    type: consumeEvent
    event:
      type: order.paid
      context:
        region: 'eu-*'
"#,
    )
    .await;

    let instance = node
        .engine
        .invoke(NAMESPACE, "waiter", json!({}))
        .await
        .unwrap();
    node.wait_for_suspended(&instance.id, "wait").await;

    let ignored = CloudEvent::new("order.paid", "shop").with_extension("region", json!("us-east"));
    assert_eq!(node.engine.broadcast_event(NAMESPACE, ignored).await.unwrap(), 0);

    let paid = CloudEvent::new("order.paid", "shop")
        .with_extension("region", json!("eu-west"))
        .with_json(json!({"amount": 10}));
    assert_eq!(node.engine.broadcast_event(NAMESPACE, paid).await.unwrap(), 1);

    let done = node.wait_for_terminal(&instance.id).await;
    assert_eq!(done.status, InstanceStatus::Complete);
    let output = done.output.unwrap();
    assert_eq!(output["order.paid"]["data"], json!({"amount": 10}));
    assert_eq!(output["order.paid"]["region"], "eu-west");

    node.shutdown().await;
}
