// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle: cancellation, timeouts, subflows, limits and the
//! triggers kept in sync with workflow documents.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::*;
use direktiv_core::actions::MockSandbox;
use direktiv_core::config::EngineConfig;
use direktiv_core::engine::{Engine, cron_timer_name};
use direktiv_core::error::{CoreError, EngineError, codes};
use direktiv_core::persistence::{InstanceRecord, InstanceStatus, Page, WorkflowUpdate, lock_key};
use serde_json::json;

const SLEEPER: &str = r#"
direktiv_api: workflow/v1
states:
  - id: nap
    type: delay
    duration: PT1H
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_pending_instance() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy("sleeper", SLEEPER).await;

    let instance = node
        .engine
        .invoke(NAMESPACE, "sleeper", json!({}))
        .await
        .unwrap();
    node.wait_for_suspended(&instance.id, "nap").await;

    assert!(
        node.engine
            .cancel_instance(&instance.id, codes::CANCELS_API, "stop")
            .await
            .unwrap()
    );
    let cancelled = node.engine.get_instance(&instance.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Cancelled);
    assert_eq!(cancelled.error_code.as_deref(), Some(codes::CANCELS_API));
    assert!(cancelled.end_time.is_some());

    let timers = node.engine.store().list_timers().await.unwrap();
    assert!(timers.iter().all(|t| !t.name.starts_with(&instance.id)));

    // Terminal instances cannot be cancelled again.
    assert!(
        !node
            .engine
            .cancel_instance(&instance.id, codes::CANCELS_API, "again")
            .await
            .unwrap()
    );

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_row_never_outlives_its_waits() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "waiter",
        r#"
direktiv_api: workflow/v1
states:
  - id: wait
    type: consumeEvent
    event:
      type: parcel.arrived
    timeout: PT1H
"#,
    )
    .await;

    let instance = node.engine.invoke(NAMESPACE, "waiter", json!({})).await.unwrap();
    node.wait_for_suspended(&instance.id, "wait").await;
    let store = node.engine.store();
    assert_eq!(store.find_listeners(NAMESPACE, "parcel.arrived").await.unwrap().len(), 1);

    // The storage cancel alone leaves nothing behind for the instance.
    let cancelled = store
        .cancel_instance(&instance.id, codes::CANCELS_API, "stop")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.instance.status, InstanceStatus::Cancelled);
    assert_eq!(cancelled.listeners, 1);
    assert!(cancelled.timers.contains(&format!("{}:soft", instance.id)));
    assert!(cancelled.timers.contains(&format!("{}:hard", instance.id)));
    assert!(store.find_listeners(NAMESPACE, "parcel.arrived").await.unwrap().is_empty());
    let timers = store.list_timers().await.unwrap();
    assert!(timers.iter().all(|t| !t.name.starts_with(&instance.id)));

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workflow_interrupt_is_catchable() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "impatient",
        r#"
direktiv_api: workflow/v1
timeouts:
  interrupt: PT1S
  kill: PT30S
states:
  - id: nap
    type: delay
    duration: PT1H
    catch:
      - error: 'direktiv.cancels.timeout*'
        transition: woke
  - id: woke
    type: noop
"#,
    )
    .await;

    let instance = node.run("impatient", json!({})).await;
    assert_eq!(instance.status, InstanceStatus::Complete);
    assert_eq!(
        instance.output.unwrap()["error"]["code"],
        codes::CANCELS_TIMEOUT_SOFT
    );

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subflow_output_returned_to_parent() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "double",
        r#"
direktiv_api: workflow/v1
states:
  - id: work
    type: noop
    transform: '{n: (.n * 2)}'
"#,
    )
    .await;
    node.deploy(
        "parent",
        r#"
direktiv_api: workflow/v1
functions:
  - id: child
    type: subflow
    workflow: double
states:
  - id: call
    type: action
    action:
      function: child
      input: '{n: .n}'
"#,
    )
    .await;

    let parent = node.run("parent", json!({"n": 3})).await;
    assert_eq!(parent.status, InstanceStatus::Complete);
    assert_eq!(parent.output.unwrap()["return"], json!({"n": 6}));

    let instances = node.engine.list_instances(NAMESPACE, Page::ALL).await.unwrap();
    let child = instances
        .iter()
        .find(|i| i.workflow_name == "double")
        .expect("child instance");
    assert_eq!(child.invoker, "subflow");
    assert_eq!(child.depth(), 1);
    assert_eq!(child.caller().unwrap().instance_id, parent.id);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recursive_subflow_hits_depth_limit() {
    let config = direktiv_core::config::EngineConfig {
        max_subflow_depth: 2,
        ..test_config("node-a")
    };
    let node = TestNode::start_with(Backends::memory(), MockSandbox::echo(), config).await;
    node.deploy(
        "recurse",
        r#"
direktiv_api: workflow/v1
functions:
  - id: self
    type: subflow
    workflow: recurse
states:
  - id: call
    type: action
    action:
      function: self
"#,
    )
    .await;

    let top = node.run("recurse", json!({})).await;
    assert_eq!(top.status, InstanceStatus::Failed);
    assert_eq!(top.error_code.as_deref(), Some(codes::LIMITS_DEPTH));

    // Depths 0, 1 and 2 ran; the call from depth 2 was refused.
    let instances = node.engine.list_instances(NAMESPACE, Page::ALL).await.unwrap();
    assert_eq!(instances.len(), 3);
    assert!(instances.iter().all(|i| i.status == InstanceStatus::Failed));

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_subflow_fails_parent() {
    let node = TestNode::start(MockSandbox::echo()).await;
    node.deploy(
        "orphan",
        r#"
direktiv_api: workflow/v1
functions:
  - id: ghost
    type: subflow
    workflow: does-not-exist
states:
  - id: call
    type: action
    action:
      function: ghost
"#,
    )
    .await;

    let instance = node.run("orphan", json!({})).await;
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.error_code.as_deref(), Some(codes::SUBFLOW_NOT_EXIST));

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_instance_rate_limit() {
    let config = direktiv_core::config::EngineConfig {
        max_instances_per_interval: 2,
        instance_limit_interval: Duration::from_secs(60),
        ..test_config("node-a")
    };
    let node = TestNode::start_with(Backends::memory(), MockSandbox::echo(), config).await;
    node.deploy(
        "quick",
        r#"
direktiv_api: workflow/v1
states:
  - id: s1
    type: noop
"#,
    )
    .await;

    node.engine.invoke(NAMESPACE, "quick", json!({})).await.unwrap();
    node.engine.invoke(NAMESPACE, "quick", json!({})).await.unwrap();
    let err = node
        .engine
        .invoke(NAMESPACE, "quick", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::LIMITS_INSTANCES);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invoke_unknown_workflow() {
    let node = TestNode::start(MockSandbox::echo()).await;
    let err = node
        .engine
        .invoke(NAMESPACE, "nothing-here", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Core(CoreError::NotFound { .. })));
    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scheduled_workflow_keeps_cron_timer_in_sync() {
    let node = TestNode::start(MockSandbox::echo()).await;
    let record = node
        .deploy(
            "nightly",
            r#"
direktiv_api: workflow/v1
start:
  type: scheduled
  cron: '0 3 * * *'
states:
  - id: s1
    type: noop
"#,
        )
        .await;

    let store = node.engine.store();
    let name = cron_timer_name(record.id);
    let timer = store.get_timer(&name).await.unwrap().expect("cron timer");
    assert_eq!(timer.cron.as_deref(), Some("0 3 * * *"));
    assert!(timer.enabled);

    // Scheduled workflows are not invoked through the api.
    assert!(node.engine.invoke(NAMESPACE, "nightly", json!({})).await.is_err());

    node.engine.set_workflow_active(record.id, false).await.unwrap();
    let timer = store.get_timer(&name).await.unwrap().expect("cron timer");
    assert!(!timer.enabled);

    // Switching to a default start drops the schedule.
    node.engine
        .update_workflow(
            record.id,
            None,
            WorkflowUpdate {
                document: Some(
                    b"direktiv_api: workflow/v1\nstates:\n  - id: s1\n    type: noop\n".to_vec(),
                ),
                active: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(store.get_timer(&name).await.unwrap().is_none());

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_with_stale_revision_is_rejected() {
    let node = TestNode::start(MockSandbox::echo()).await;
    let record = node.deploy("versioned", SLEEPER).await;

    let err = node
        .engine
        .update_workflow(
            record.id,
            Some(record.revision + 5),
            WorkflowUpdate {
                description: Some("late".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Core(CoreError::AlreadyUpdated { .. })));

    let updated = node
        .engine
        .update_workflow(
            record.id,
            Some(record.revision),
            WorkflowUpdate {
                description: Some("fresh".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.description.as_deref(), Some("fresh"));
    assert!(updated.revision > record.revision);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_document_is_rejected() {
    let node = TestNode::start(MockSandbox::echo()).await;
    let err = node
        .engine
        .create_workflow(new_workflow(
            "broken",
            "direktiv_api: workflow/v1\nstates:\n  - id: a\n    type: noop\n    transition: nowhere\n",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Core(CoreError::ValidationError { .. })));
    assert!(
        node.engine
            .get_workflow(NAMESPACE, "broken")
            .await
            .unwrap()
            .is_none()
    );
    node.shutdown().await;
}

const CLUSTER_INSTANCES: usize = 1000;

fn cluster_config(hostname: &str) -> EngineConfig {
    EngineConfig {
        max_instances_per_interval: 10_000,
        max_concurrent_steps: 16,
        ..test_config(hostname)
    }
}

async fn terminal_instances(engine: &Engine) -> Vec<InstanceRecord> {
    engine
        .list_instances(NAMESPACE, Page::ALL)
        .await
        .unwrap()
        .into_iter()
        .filter(|i| !i.is_active())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_runs_every_step_exactly_once() {
    let backends = Backends::memory();
    let audit = LockAudit::default();
    let a = TestNode::start_with(
        Backends {
            locks: audit.node("node-a", backends.locks.clone()),
            ..backends.clone()
        },
        MockSandbox::echo(),
        cluster_config("node-a"),
    )
    .await;
    let b = TestNode::start_with(
        Backends {
            locks: audit.node("node-b", backends.locks.clone()),
            ..backends.clone()
        },
        MockSandbox::echo(),
        cluster_config("node-b"),
    )
    .await;

    a.deploy(
        "shared",
        r#"
direktiv_api: workflow/v1
functions:
  - id: work
    type: knative-workflow
    image: direktiv/work
states:
  - id: pause
    type: delay
    duration: PT1S
    transition: check
  - id: check
    type: switch
    conditions:
      - condition: '.i % 10 == 0'
        transition: broken
    defaultTransition: work
  - id: work
    type: action
    action:
      function: work
      input: '{i: .i}'
    transition: done
  - id: done
    type: noop
  - id: broken
    type: error
    error: app.broken
    message: 'instance %s broken'
    args: ['.i']
"#,
    )
    .await;

    let mut ids = Vec::with_capacity(CLUSTER_INSTANCES);
    for i in 0..CLUSTER_INSTANCES {
        let node = if i % 2 == 0 { &a } else { &b };
        let instance = node
            .engine
            .invoke(NAMESPACE, "shared", json!({"i": i}))
            .await
            .unwrap();
        ids.push(instance.id);
    }

    let engine = a.engine.clone();
    assert!(
        eventually(Duration::from_secs(120), || {
            let engine = engine.clone();
            async move { terminal_instances(&engine).await.len() == CLUSTER_INSTANCES }
        })
        .await,
        "instances did not finish"
    );

    let done = terminal_instances(&a.engine).await;
    let complete = done.iter().filter(|i| i.status == InstanceStatus::Complete).count();
    let failed = done.iter().filter(|i| i.status == InstanceStatus::Failed).count();
    assert_eq!(complete + failed, CLUSTER_INSTANCES);
    assert_eq!(failed, CLUSTER_INSTANCES / 10);
    for instance in &done {
        match instance.status {
            InstanceStatus::Complete => assert_eq!(instance.flow, vec!["pause", "check", "work", "done"]),
            _ => {
                assert_eq!(instance.flow, vec!["pause", "check", "broken"]);
                assert_eq!(instance.error_code.as_deref(), Some("app.broken"));
            }
        }
    }

    // Steps of one instance never overlap, whichever nodes ran them.
    assert_eq!(audit.nodes(), vec!["node-a".to_string(), "node-b".to_string()]);
    for id in &ids {
        let holds = audit.holds(lock_key(&["instance", id]));
        assert!(holds.len() >= 3, "{} ran {} steps", id, holds.len());
        for pair in holds.windows(2) {
            assert!(
                pair[1].taken >= pair[0].released,
                "{}: step on {} started before the step on {} ended",
                id,
                pair[1].node,
                pair[0].node
            );
        }
    }

    // Each action step was dispatched once across the cluster.
    let mut dispatched: HashMap<(String, i32), usize> = HashMap::new();
    for request in a.sandbox.requests().await.into_iter().chain(b.sandbox.requests().await) {
        *dispatched
            .entry((request.workflow.instance, request.workflow.step))
            .or_default() += 1;
    }
    assert_eq!(dispatched.len(), complete);
    assert!(dispatched.values().all(|count| *count == 1));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_step_tokens_do_not_outlive_steps() {
    let backends = Backends::memory();
    let a = TestNode::start_with(backends.clone(), MockSandbox::echo(), test_config("node-a")).await;
    let b = TestNode::start_with(backends.clone(), MockSandbox::echo(), test_config("node-b")).await;
    a.deploy(
        "napper",
        r#"
direktiv_api: workflow/v1
states:
  - id: pause
    type: delay
    duration: PT1S
"#,
    )
    .await;

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(a.engine.invoke(NAMESPACE, "napper", json!({})).await.unwrap().id);
    }
    for id in &ids {
        assert_eq!(a.wait_for_terminal(id).await.status, InstanceStatus::Complete);
    }

    let (ea, eb) = (a.engine.clone(), b.engine.clone());
    assert!(
        eventually(Duration::from_secs(5), || {
            let (ea, eb) = (ea.clone(), eb.clone());
            async move { ea.stepping_instances() == 0 && eb.stepping_instances() == 0 }
        })
        .await,
        "node-a: {}, node-b: {}",
        a.engine.stepping_instances(),
        b.engine.stepping_instances()
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_generated_events_route_after_the_step() {
    let backends = Backends::memory();
    let audit = LockAudit::default();
    let node = TestNode::start_with(
        Backends {
            locks: audit.node("node-a", backends.locks.clone()),
            ..backends.clone()
        },
        MockSandbox::echo(),
        EngineConfig {
            max_concurrent_steps: 1,
            ..test_config("node-a")
        },
    )
    .await;

    node.deploy(
        "announcer",
        r#"
direktiv_api: workflow/v1
states:
  - id: announce
    type: generateEvent
    event:
      type: order.done
      source: shop
      data: '{order: .order}'
"#,
    )
    .await;
    node.deploy(
        "receiver",
        r#"
direktiv_api: workflow/v1
start:
  type: event
  event:
    type: order.done
states:
  - id: receive
    type: noop
"#,
    )
    .await;

    for order in 0..8 {
        let done = node.run("announcer", json!({"order": order})).await;
        assert_eq!(done.status, InstanceStatus::Complete);
    }

    let engine = node.engine.clone();
    assert!(
        eventually(Duration::from_secs(10), || {
            let engine = engine.clone();
            async move {
                terminal_instances(&engine)
                    .await
                    .iter()
                    .filter(|i| i.workflow_name == "receiver" && i.status == InstanceStatus::Complete)
                    .count()
                    == 8
            }
        })
        .await
    );

    // A single step worker never holds more than one lock connection.
    assert_eq!(audit.peak(), 1);

    node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_reaches_instance_on_other_node() {
    let backends = Backends::memory();
    let a = TestNode::start_with(backends.clone(), MockSandbox::echo(), test_config("node-a")).await;
    let b = TestNode::start_with(backends.clone(), MockSandbox::echo(), test_config("node-b")).await;
    a.deploy("sleeper", SLEEPER).await;

    let instance = a.engine.invoke(NAMESPACE, "sleeper", json!({})).await.unwrap();
    a.wait_for_suspended(&instance.id, "nap").await;

    assert!(
        b.engine
            .cancel_instance(&instance.id, codes::CANCELS_API, "from b")
            .await
            .unwrap()
    );
    let done = a.wait_for_terminal(&instance.id).await;
    assert_eq!(done.status, InstanceStatus::Cancelled);

    a.shutdown().await;
    b.shutdown().await;
}
