// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for loading workflow documents.
//!
//! Documents go through [`load_workflow`] the way the engine stores them:
//! YAML parsing first, then validation.

use direktiv_dsl::{Start, State};
use direktiv_workflows::{LoadError, ValidationWarning, load_workflow};

/// A document using every state kind.
const ORDER_PIPELINE: &str = r#"
direktiv_api: workflow/v1
description: process an order end to end
functions:
  - id: charge
    type: knative-workflow
    image: shop/charge:1.2
  - id: notify
    type: subflow
    workflow: notify-customer
  - id: ship
    type: knative-namespace
    service: shipping
timeouts:
  interrupt: PT10M
  kill: PT15M
states:
  - id: check
    type: validate
    subject: .order
    schema:
      type: object
      required: [id, total]
    transition: route
  - id: route
    type: switch
    conditions:
      - condition: '.order.total > 1000'
        transition: review
    defaultTransition: pay
  - id: review
    type: consumeEvent
    event:
      type: order.approved
      context:
        order: '*'
    timeout: PT1H
    transition: pay
  - id: pay
    type: action
    action:
      function: charge
      input: '{amount: .order.total}'
      secrets: [stripe-key]
      retries:
        maxAttempts: 3
        delay: PT2S
        multiplier: 2
        codes: ['payment.*']
    catch:
      - error: 'payment.declined'
        transition: declined
    transition: remember
  - id: remember
    type: setter
    variables:
      - key: last-order
        scope: workflow
        value: '.order.id'
    transition: fulfil
  - id: fulfil
    type: parallel
    mode: and
    actions:
      - function: ship
      - function: notify
    transition: lines
  - id: lines
    type: foreach
    array: '[.order.items[] | {sku: .}]'
    action:
      function: ship
    transition: wait
  - id: wait
    type: eventsXor
    events:
      - event:
          type: order.delivered
        transition: announce
      - event:
          type: order.lost
        transition: declined
  - id: announce
    type: generateEvent
    event:
      type: order.completed
      source: shop
      data: '.order'
    transition: settle
  - id: settle
    type: eventsAnd
    events:
      - type: invoice.paid
      - type: invoice.sent
    transition: report
  - id: report
    type: getter
    variables:
      - key: last-order
        scope: workflow
    transition: pause
  - id: pause
    type: delay
    duration: PT5S
  - id: declined
    type: error
    error: order.declined
    message: 'order %s declined'
    args: ['.order.id']
"#;

fn load(document: &str) -> Result<direktiv_dsl::Workflow, LoadError> {
    load_workflow(document.as_bytes()).map(|(workflow, _)| workflow)
}

fn rejection(document: &str) -> String {
    match load_workflow(document.as_bytes()) {
        Err(LoadError::Invalid(summary)) => summary,
        Err(other) => panic!("expected a validation failure, got {}", other),
        Ok(_) => panic!("expected the document to be rejected"),
    }
}

#[test]
fn test_full_pipeline_loads_cleanly() {
    let (workflow, result) = load_workflow(ORDER_PIPELINE.as_bytes()).unwrap();
    assert!(result.is_ok(), "{}", result.error_summary());
    assert!(!result.has_warnings(), "{:?}", result.warnings);

    assert_eq!(workflow.states.len(), 14);
    assert_eq!(workflow.start_state(), Some("check"));
    assert!(matches!(workflow.start_definition(), Start::Default { .. }));
    assert!(matches!(workflow.state("lines"), Some(State::Foreach(_))));
    assert!(matches!(workflow.state("settle"), Some(State::EventsAnd(_))));
    assert_eq!(workflow.function("notify").unwrap().workflow.as_deref(), Some("notify-customer"));
}

#[test]
fn test_yaml_errors_are_parse_failures() {
    let err = load("direktiv_api: workflow/v1\nstates: [\n").unwrap_err();
    assert!(matches!(err, LoadError::Parse(_)));

    let err = load("direktiv_api: workflow/v1\nstates:\n  - id: a\n    type: teleport\n").unwrap_err();
    assert!(matches!(err, LoadError::Parse(_)));
}

#[test]
fn test_missing_api_version_is_rejected() {
    let summary = rejection("states:\n  - id: a\n    type: noop\n");
    assert!(summary.contains("[E001]"), "{}", summary);
}

#[test]
fn test_every_problem_is_reported() {
    let summary = rejection(
        r#"
direktiv_api: workflow/v1
functions:
  - id: f
    type: knative-workflow
states:
  - id: a
    type: action
    action:
      function: g
    transition: b
  - id: a
    type: delay
    duration: five seconds
"#,
    );
    for code in ["[E010]", "[E020]", "[E021]", "[E022]", "[E030]"] {
        assert!(summary.contains(code), "missing {} in {}", code, summary);
    }
}

#[test]
fn test_transition_typo_gets_a_suggestion() {
    let summary = rejection(
        r#"
direktiv_api: workflow/v1
states:
  - id: start
    type: noop
    transition: finsh
  - id: finish
    type: noop
"#,
    );
    assert!(summary.contains("Did you mean 'finish'?"), "{}", summary);
}

#[test]
fn test_bad_expressions_are_rejected() {
    let summary = rejection(
        r#"
direktiv_api: workflow/v1
states:
  - id: a
    type: switch
    conditions:
      - condition: '.a >'
        transition: b
  - id: b
    type: noop
"#,
    );
    assert!(summary.contains("[E032]"), "{}", summary);
}

#[test]
fn test_start_definitions_are_checked() {
    let summary = rejection(
        r#"
direktiv_api: workflow/v1
start:
  type: scheduled
  cron: 'every day at noon'
states:
  - id: a
    type: noop
"#,
    );
    assert!(summary.contains("[E041]"), "{}", summary);

    let summary = rejection(
        r#"
direktiv_api: workflow/v1
start:
  type: eventsAnd
  events: []
states:
  - id: a
    type: noop
"#,
    );
    assert!(summary.contains("[E042]"), "{}", summary);

    let workflow = load(
        r#"
direktiv_api: workflow/v1
start:
  type: event
  state: b
  event:
    type: user.created
states:
  - id: a
    type: noop
  - id: b
    type: noop
"#,
    )
    .unwrap();
    assert_eq!(workflow.start_state(), Some("b"));
}

#[test]
fn test_dead_ends_are_warnings_only() {
    let (_, result) = load_workflow(
        br#"
direktiv_api: workflow/v1
functions:
  - id: spare
    type: knative-workflow
    image: tools/spare
states:
  - id: a
    type: noop
  - id: island
    type: noop
"#,
    )
    .unwrap();
    assert!(result.is_ok());
    assert!(result.warnings.contains(&ValidationWarning::UnreachableState {
        state_id: "island".into()
    }));
    assert!(result.warnings.contains(&ValidationWarning::UnusedFunction {
        function_id: "spare".into()
    }));
}
