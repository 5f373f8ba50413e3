// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow validation for correctness before a document is stored.
//!
//! This module validates workflows to ensure:
//! - The document declares the supported API version and at least one state
//! - State and function ids are unique
//! - Transitions, catcher targets and branch targets point to existing states
//! - Actions reference declared functions of a usable kind
//! - Durations are ISO-8601, schemas are valid JSON Schema, jq compiles
//! - The start definition fits its kind (cron, events, start state)

use crate::{jq, matching, schema};
use direktiv_dsl::{
    ActionDefinition, FunctionType, Start, State, WORKFLOW_API_VERSION, Workflow,
    is_valid_duration,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

// ============================================================================
// Validation Result Types
// ============================================================================

/// Result of workflow validation containing errors and warnings.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Hard errors that prevent the workflow from being stored.
    pub errors: Vec<ValidationError>,
    /// Soft warnings that indicate potential issues.
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are allowed).
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns true if there are any errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns true if there are any warnings.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Merge another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// All error messages joined for display.
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ============================================================================
// Validation Errors
// ============================================================================

/// Errors that can occur during validation.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)] // Fields are self-documenting from variant docs
pub enum ValidationError {
    // === Document Errors ===
    /// `direktiv_api` is missing.
    MissingApiVersion,
    /// `direktiv_api` names an unsupported kind.
    UnsupportedApiVersion { found: String },
    /// The workflow has no states.
    EmptyWorkflow,

    // === Identity Errors ===
    /// Two states share an id.
    DuplicateStateId { state_id: String },
    /// Two functions share an id.
    DuplicateFunctionId { function_id: String },
    /// A state has an empty id.
    EmptyStateId { index: usize },

    // === Reference Errors ===
    /// A transition points to a state that does not exist.
    InvalidTransition {
        state_id: String,
        place: String,
        target: String,
        available_states: Vec<String>,
    },
    /// An action references an undeclared function.
    UnknownFunction {
        state_id: String,
        function_id: String,
        available_functions: Vec<String>,
    },
    /// A function lacks the field its kind requires.
    IncompleteFunction {
        function_id: String,
        function_type: String,
        missing: &'static str,
    },

    // === Value Errors ===
    /// A duration is not ISO-8601.
    InvalidDuration {
        location: String,
        value: String,
    },
    /// A schema is not valid JSON Schema.
    InvalidSchema { state_id: String, reason: String },
    /// A jq expression does not compile.
    InvalidJq {
        location: String,
        expression: String,
        reason: String,
    },
    /// A catcher or retry code pattern is not a valid glob.
    InvalidPattern { location: String, pattern: String },
    /// A retry policy allows no executions.
    InvalidRetryPolicy { state_id: String, reason: String },

    // === Start Errors ===
    /// The start definition references a missing state.
    StartStateNotFound {
        state_id: String,
        available_states: Vec<String>,
    },
    /// The cron pattern of a scheduled start does not parse.
    InvalidCron { cron: String, reason: String },
    /// An event start lists no events.
    MissingStartEvents { kind: String },
    /// A state-level or start event template has no type.
    EmptyEventType { location: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            // Document Errors
            ValidationError::MissingApiVersion => write!(
                f,
                "[E001] Document does not declare direktiv_api: {}",
                WORKFLOW_API_VERSION
            ),
            ValidationError::UnsupportedApiVersion { found } => write!(
                f,
                "[E002] Unsupported direktiv_api '{}', expected '{}'",
                found, WORKFLOW_API_VERSION
            ),
            ValidationError::EmptyWorkflow => {
                write!(f, "[E003] Workflow has no states defined")
            }

            // Identity Errors
            ValidationError::DuplicateStateId { state_id } => {
                write!(f, "[E010] State id '{}' is used more than once", state_id)
            }
            ValidationError::DuplicateFunctionId { function_id } => write!(
                f,
                "[E011] Function id '{}' is used more than once",
                function_id
            ),
            ValidationError::EmptyStateId { index } => {
                write!(f, "[E012] State at position {} has an empty id", index)
            }

            // Reference Errors
            ValidationError::InvalidTransition {
                state_id,
                place,
                target,
                available_states,
            } => {
                let suggestion = find_similar_name(target, available_states)
                    .map(|s| format!(". Did you mean '{}'?", s))
                    .unwrap_or_default();
                write!(
                    f,
                    "[E020] State '{}' {} points to '{}' which does not exist{}",
                    state_id, place, target, suggestion
                )
            }
            ValidationError::UnknownFunction {
                state_id,
                function_id,
                available_functions,
            } => write!(
                f,
                "[E021] State '{}' calls unknown function '{}'. Available functions: {}",
                state_id,
                function_id,
                if available_functions.is_empty() {
                    "(none)".to_string()
                } else {
                    available_functions.join(", ")
                }
            ),
            ValidationError::IncompleteFunction {
                function_id,
                function_type,
                missing,
            } => write!(
                f,
                "[E022] Function '{}' of type {} requires '{}'",
                function_id, function_type, missing
            ),

            // Value Errors
            ValidationError::InvalidDuration { location, value } => write!(
                f,
                "[E030] {} has invalid ISO-8601 duration '{}'",
                location, value
            ),
            ValidationError::InvalidSchema { state_id, reason } => write!(
                f,
                "[E031] State '{}' has an invalid JSON Schema: {}",
                state_id, reason
            ),
            ValidationError::InvalidJq {
                location,
                expression,
                reason,
            } => write!(
                f,
                "[E032] {} has invalid jq '{}': {}",
                location, expression, reason
            ),
            ValidationError::InvalidPattern { location, pattern } => {
                write!(f, "[E033] {} has invalid pattern '{}'", location, pattern)
            }
            ValidationError::InvalidRetryPolicy { state_id, reason } => write!(
                f,
                "[E034] State '{}' has an invalid retry policy: {}",
                state_id, reason
            ),

            // Start Errors
            ValidationError::StartStateNotFound {
                state_id,
                available_states,
            } => write!(
                f,
                "[E040] Start state '{}' not found. Available states: {}",
                state_id,
                available_states.join(", ")
            ),
            ValidationError::InvalidCron { cron, reason } => {
                write!(f, "[E041] Invalid cron pattern '{}': {}", cron, reason)
            }
            ValidationError::MissingStartEvents { kind } => {
                write!(f, "[E042] Start of type {} lists no events", kind)
            }
            ValidationError::EmptyEventType { location } => {
                write!(f, "[E043] {} has an event without a type", location)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

// ============================================================================
// Validation Warnings
// ============================================================================

/// Warnings that don't prevent storing a workflow.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum ValidationWarning {
    /// A state cannot be reached from the start state.
    UnreachableState { state_id: String },
    /// A declared function is never called.
    UnusedFunction { function_id: String },
    /// A parallel or foreach state declares a retry policy on an action that
    /// is overridden by the state policy.
    ShadowedRetryPolicy { state_id: String },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationWarning::UnreachableState { state_id } => write!(
                f,
                "[W001] State '{}' is unreachable from the start state",
                state_id
            ),
            ValidationWarning::UnusedFunction { function_id } => {
                write!(f, "[W002] Function '{}' is never called", function_id)
            }
            ValidationWarning::ShadowedRetryPolicy { state_id } => write!(
                f,
                "[W003] State '{}' retry policy overrides the action retry policy",
                state_id
            ),
        }
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Validate a parsed workflow document.
pub fn validate_workflow(workflow: &Workflow) -> ValidationResult {
    let mut result = ValidationResult::default();

    validate_document(workflow, &mut result);
    validate_identities(workflow, &mut result);
    validate_references(workflow, &mut result);
    validate_functions(workflow, &mut result);
    validate_values(workflow, &mut result);
    validate_start(workflow, &mut result);
    validate_reachability(workflow, &mut result);

    result
}

/// Validate and return only errors.
pub fn validate_workflow_errors(workflow: &Workflow) -> Vec<ValidationError> {
    validate_workflow(workflow).errors
}

// ============================================================================
// Checks
// ============================================================================

fn validate_document(workflow: &Workflow, result: &mut ValidationResult) {
    match workflow.direktiv_api.as_deref() {
        None => result.errors.push(ValidationError::MissingApiVersion),
        Some(WORKFLOW_API_VERSION) => {}
        Some(other) => result.errors.push(ValidationError::UnsupportedApiVersion {
            found: other.to_string(),
        }),
    }
    if workflow.states.is_empty() {
        result.errors.push(ValidationError::EmptyWorkflow);
    }
}

fn validate_identities(workflow: &Workflow, result: &mut ValidationResult) {
    let mut seen = HashSet::new();
    for (index, state) in workflow.states.iter().enumerate() {
        if state.id().is_empty() {
            result.errors.push(ValidationError::EmptyStateId { index });
            continue;
        }
        if !seen.insert(state.id()) {
            result.errors.push(ValidationError::DuplicateStateId {
                state_id: state.id().to_string(),
            });
        }
    }

    let mut seen = HashSet::new();
    for function in &workflow.functions {
        if !seen.insert(function.id.as_str()) {
            result.errors.push(ValidationError::DuplicateFunctionId {
                function_id: function.id.clone(),
            });
        }
    }
}

fn validate_references(workflow: &Workflow, result: &mut ValidationResult) {
    let available = state_ids(workflow);
    let known: HashSet<&str> = workflow.states.iter().map(State::id).collect();

    for state in &workflow.states {
        for (place, target) in state.transitions() {
            if !known.contains(target) {
                result.errors.push(ValidationError::InvalidTransition {
                    state_id: state.id().to_string(),
                    place,
                    target: target.to_string(),
                    available_states: available.clone(),
                });
            }
        }

        for action in state.actions() {
            if workflow.function(&action.function).is_none() {
                result.errors.push(ValidationError::UnknownFunction {
                    state_id: state.id().to_string(),
                    function_id: action.function.clone(),
                    available_functions: workflow.functions.iter().map(|f| f.id.clone()).collect(),
                });
            }
        }
    }
}

fn validate_functions(workflow: &Workflow, result: &mut ValidationResult) {
    let mut used = HashSet::new();
    for state in &workflow.states {
        for action in state.actions() {
            used.insert(action.function.as_str());
        }
        if let State::Parallel(p) = state
            && p.common.retries.is_some()
            && p.actions.iter().any(|a| a.retries.is_some())
        {
            result.warnings.push(ValidationWarning::ShadowedRetryPolicy {
                state_id: state.id().to_string(),
            });
        }
    }

    for function in &workflow.functions {
        let missing = match function.function_type {
            FunctionType::KnativeWorkflow if function.image.is_none() => Some("image"),
            FunctionType::KnativeNamespace if function.service.is_none() => Some("service"),
            FunctionType::Subflow if function.workflow.is_none() => Some("workflow"),
            _ => None,
        };
        if let Some(missing) = missing {
            result.errors.push(ValidationError::IncompleteFunction {
                function_id: function.id.clone(),
                function_type: function.function_type.to_string(),
                missing,
            });
        }
        if !used.contains(function.id.as_str()) {
            result.warnings.push(ValidationWarning::UnusedFunction {
                function_id: function.id.clone(),
            });
        }
    }
}

fn validate_values(workflow: &Workflow, result: &mut ValidationResult) {
    if let Some(timeouts) = &workflow.timeouts {
        check_duration("timeouts.interrupt", timeouts.interrupt.as_deref(), result);
        check_duration("timeouts.kill", timeouts.kill.as_deref(), result);
    }

    for state in &workflow.states {
        let id = state.id();
        let at = |field: &str| format!("State '{}' {}", id, field);
        let common = state.common();

        check_jq(&at("log"), common.log.as_deref(), result);

        for (i, catcher) in common.catch.iter().enumerate() {
            if !matching::is_valid_glob(&catcher.error) {
                result.errors.push(ValidationError::InvalidPattern {
                    location: at(&format!("catch[{}].error", i)),
                    pattern: catcher.error.clone(),
                });
            }
        }

        if let Some(policy) = state.retries() {
            if policy.max_attempts == 0 {
                result.errors.push(ValidationError::InvalidRetryPolicy {
                    state_id: id.to_string(),
                    reason: "maxAttempts must be at least 1".to_string(),
                });
            }
            if policy.multiplier.is_some_and(|m| !m.is_finite() || m <= 0.0) {
                result.errors.push(ValidationError::InvalidRetryPolicy {
                    state_id: id.to_string(),
                    reason: "multiplier must be a positive number".to_string(),
                });
            }
            check_duration(&at("retries.delay"), policy.delay.as_deref(), result);
            for code in &policy.codes {
                if !matching::is_valid_glob(code) {
                    result.errors.push(ValidationError::InvalidPattern {
                        location: at("retries.codes"),
                        pattern: code.clone(),
                    });
                }
            }
        }

        match state {
            State::Noop(s) => check_transform(&at("transform"), s.transform.as_ref(), result),
            State::Switch(s) => {
                for (i, c) in s.conditions.iter().enumerate() {
                    if let Value::String(expr) = &c.condition {
                        check_jq(&at(&format!("conditions[{}].condition", i)), Some(expr), result);
                    }
                    check_transform(
                        &at(&format!("conditions[{}].transform", i)),
                        c.transform.as_ref(),
                        result,
                    );
                }
                check_transform(&at("defaultTransform"), s.default_transform.as_ref(), result);
            }
            State::Delay(s) => {
                check_duration(&at("duration"), Some(&s.duration), result);
                check_transform(&at("transform"), s.transform.as_ref(), result);
            }
            State::Error(s) => {
                for (i, arg) in s.args.iter().enumerate() {
                    check_jq(&at(&format!("args[{}]", i)), Some(arg), result);
                }
            }
            State::Validate(s) => {
                if let Err(reason) = schema::check_schema(&s.schema) {
                    result.errors.push(ValidationError::InvalidSchema {
                        state_id: id.to_string(),
                        reason,
                    });
                }
                check_jq(&at("subject"), s.subject.as_deref(), result);
                check_transform(&at("transform"), s.transform.as_ref(), result);
            }
            State::ConsumeEvent(s) => {
                check_event_type(&at("event"), &s.event.event_type, result);
                check_duration(&at("timeout"), s.timeout.as_deref(), result);
                check_transform(&at("transform"), s.transform.as_ref(), result);
            }
            State::EventsAnd(s) => {
                for e in &s.events {
                    check_event_type(&at("events"), &e.event_type, result);
                }
                check_duration(&at("timeout"), s.timeout.as_deref(), result);
                check_transform(&at("transform"), s.transform.as_ref(), result);
            }
            State::EventsXor(s) => {
                for (i, b) in s.events.iter().enumerate() {
                    check_event_type(&at(&format!("events[{}]", i)), &b.event.event_type, result);
                    check_transform(
                        &at(&format!("events[{}].transform", i)),
                        b.transform.as_ref(),
                        result,
                    );
                }
                check_duration(&at("timeout"), s.timeout.as_deref(), result);
            }
            State::GenerateEvent(s) => {
                check_event_type(&at("event"), &s.event.event_type, result);
                check_jq(&at("event.data"), s.event.data.as_deref(), result);
                for (key, value) in &s.event.context {
                    if let Value::String(expr) = value {
                        check_jq(&at(&format!("event.context.{}", key)), Some(expr), result);
                    }
                }
                check_transform(&at("transform"), s.transform.as_ref(), result);
            }
            State::Getter(s) => check_transform(&at("transform"), s.transform.as_ref(), result),
            State::Setter(s) => {
                for (i, v) in s.variables.iter().enumerate() {
                    check_jq(&at(&format!("variables[{}].value", i)), Some(&v.value), result);
                }
                check_transform(&at("transform"), s.transform.as_ref(), result);
            }
            State::Action(s) => {
                check_action(&at("action"), &s.action, result);
                check_duration(&at("timeout"), s.timeout.as_deref(), result);
                check_transform(&at("transform"), s.transform.as_ref(), result);
            }
            State::Foreach(s) => {
                check_jq(&at("array"), Some(&s.array), result);
                check_action(&at("action"), &s.action, result);
                check_duration(&at("timeout"), s.timeout.as_deref(), result);
                check_transform(&at("transform"), s.transform.as_ref(), result);
            }
            State::Parallel(s) => {
                for (i, a) in s.actions.iter().enumerate() {
                    check_action(&at(&format!("actions[{}]", i)), a, result);
                }
                check_duration(&at("timeout"), s.timeout.as_deref(), result);
                check_transform(&at("transform"), s.transform.as_ref(), result);
            }
        }
    }
}

fn validate_start(workflow: &Workflow, result: &mut ValidationResult) {
    let start = workflow.start_definition();

    if let Some(state) = start.state()
        && workflow.state(state).is_none()
    {
        result.errors.push(ValidationError::StartStateNotFound {
            state_id: state.to_string(),
            available_states: state_ids(workflow),
        });
    }

    match &start {
        Start::Default { .. } => {}
        Start::Scheduled { cron, .. } => {
            if let Err(reason) = check_cron(cron) {
                result.errors.push(ValidationError::InvalidCron {
                    cron: cron.clone(),
                    reason,
                });
            }
        }
        Start::Event { event, .. } => {
            check_event_type("start.event", &event.event_type, result);
        }
        Start::EventsXor { events, .. } | Start::EventsAnd { events, .. } => {
            if events.is_empty() {
                result.errors.push(ValidationError::MissingStartEvents {
                    kind: start.kind().to_string(),
                });
            }
            for e in events {
                check_event_type("start.events", &e.event_type, result);
            }
        }
    }

    if let Start::EventsAnd { lifespan, .. } = &start {
        check_duration("start.lifespan", lifespan.as_deref(), result);
    }
}

fn validate_reachability(workflow: &Workflow, result: &mut ValidationResult) {
    let Some(start) = workflow.start_state() else {
        return;
    };
    if workflow.state(start).is_none() {
        return;
    }

    let edges: HashMap<&str, Vec<&str>> = workflow
        .states
        .iter()
        .map(|s| {
            (
                s.id(),
                s.transitions().into_iter().map(|(_, t)| t).collect(),
            )
        })
        .collect();

    let mut reachable = HashSet::new();
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(next) = edges.get(id) {
            queue.extend(next.iter().copied());
        }
    }

    for state in &workflow.states {
        if !reachable.contains(state.id()) {
            result.warnings.push(ValidationWarning::UnreachableState {
                state_id: state.id().to_string(),
            });
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn state_ids(workflow: &Workflow) -> Vec<String> {
    workflow.states.iter().map(|s| s.id().to_string()).collect()
}

fn check_duration(location: &str, value: Option<&str>, result: &mut ValidationResult) {
    if let Some(value) = value
        && !is_valid_duration(value)
    {
        result.errors.push(ValidationError::InvalidDuration {
            location: location.to_string(),
            value: value.to_string(),
        });
    }
}

fn check_jq(location: &str, expression: Option<&str>, result: &mut ValidationResult) {
    if let Some(expression) = expression
        && let Err(e) = jq::check(expression)
    {
        let reason = match e {
            jq::JqError::Compile { reason, .. } => reason,
            other => other.to_string(),
        };
        result.errors.push(ValidationError::InvalidJq {
            location: location.to_string(),
            expression: expression.to_string(),
            reason,
        });
    }
}

fn check_transform(location: &str, transform: Option<&Value>, result: &mut ValidationResult) {
    if let Some(Value::String(expression)) = transform {
        check_jq(location, Some(expression), result);
    }
}

fn check_action(location: &str, action: &ActionDefinition, result: &mut ValidationResult) {
    check_jq(&format!("{} input", location), action.input.as_deref(), result);
}

fn check_event_type(location: &str, event_type: &str, result: &mut ValidationResult) {
    if event_type.trim().is_empty() {
        result.errors.push(ValidationError::EmptyEventType {
            location: location.to_string(),
        });
    }
}

/// Parse a cron pattern the way the timer manager does.
pub fn check_cron(pattern: &str) -> Result<(), String> {
    croner::Cron::new(pattern)
        .parse()
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Find a similar name from a list of candidates (for "did you mean" suggestions).
fn find_similar_name(target: &str, candidates: &[String]) -> Option<String> {
    let target_lower = target.to_lowercase();

    candidates
        .iter()
        .filter_map(|candidate| {
            let distance = levenshtein_distance(&target_lower, &candidate.to_lowercase());
            if distance <= target.len() / 2 + 2 {
                Some((candidate.clone(), distance))
            } else {
                None
            }
        })
        .min_by_key(|(_, d)| *d)
        .map(|(name, _)| name)
}

fn levenshtein_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use direktiv_dsl::parse_workflow;

    fn parse(yaml: &str) -> Workflow {
        parse_workflow(yaml.as_bytes()).unwrap()
    }

    fn has(result: &ValidationResult, pred: impl Fn(&ValidationError) -> bool) -> bool {
        result.errors.iter().any(pred)
    }

    #[test]
    fn test_valid_workflow() {
        let wf = parse(
            r#"
direktiv_api: workflow/v1
functions:
  - id: echo
    type: knative-workflow
    image: direktiv/echo
states:
  - id: a
    type: action
    action:
      function: echo
      input: '{x: .x}'
    transition: b
  - id: b
    type: delay
    duration: PT1S
"#,
        );
        let result = validate_workflow(&wf);
        assert!(result.is_ok(), "{}", result.error_summary());
        assert!(!result.has_warnings());
    }

    #[test]
    fn test_missing_api_and_states() {
        let wf = parse("description: nothing\n");
        let result = validate_workflow(&wf);
        assert!(has(&result, |e| *e == ValidationError::MissingApiVersion));
        assert!(has(&result, |e| *e == ValidationError::EmptyWorkflow));
    }

    #[test]
    fn test_unsupported_api() {
        let wf = parse(
            r#"
direktiv_api: workflow/v2
states:
  - id: a
    type: noop
"#,
        );
        let result = validate_workflow(&wf);
        assert!(has(&result, |e| matches!(
            e,
            ValidationError::UnsupportedApiVersion { found } if found == "workflow/v2"
        )));
    }

    #[test]
    fn test_duplicate_state_ids() {
        let wf = parse(
            r#"
direktiv_api: workflow/v1
states:
  - id: a
    type: noop
  - id: a
    type: noop
"#,
        );
        let result = validate_workflow(&wf);
        assert!(has(&result, |e| matches!(
            e,
            ValidationError::DuplicateStateId { state_id } if state_id == "a"
        )));
    }

    #[test]
    fn test_invalid_transition_suggests_name() {
        let wf = parse(
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
        let result = validate_workflow(&wf);
        let err = result
            .errors
            .iter()
            .find(|e| matches!(e, ValidationError::InvalidTransition { .. }))
            .unwrap();
        assert!(err.to_string().contains("Did you mean 'finish'?"));
    }

    #[test]
    fn test_switch_and_catch_targets_checked() {
        let wf = parse(
            r#"
direktiv_api: workflow/v1
states:
  - id: s
    type: switch
    conditions:
      - condition: '.x'
        transition: nowhere
    defaultTransition: elsewhere
    catch:
      - error: "*"
        transition: gone
"#,
        );
        let result = validate_workflow(&wf);
        let targets: Vec<&str> = result
            .errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::InvalidTransition { target, .. } => Some(target.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec!["nowhere", "elsewhere", "gone"]);
    }

    #[test]
    fn test_unknown_and_incomplete_functions() {
        let wf = parse(
            r#"
direktiv_api: workflow/v1
functions:
  - id: child
    type: subflow
states:
  - id: a
    type: action
    action:
      function: missing
"#,
        );
        let result = validate_workflow(&wf);
        assert!(has(&result, |e| matches!(
            e,
            ValidationError::UnknownFunction { function_id, .. } if function_id == "missing"
        )));
        assert!(has(&result, |e| matches!(
            e,
            ValidationError::IncompleteFunction { missing: "workflow", .. }
        )));
        assert!(
            result
                .warnings
                .iter()
                .any(|w| matches!(w, ValidationWarning::UnusedFunction { .. }))
        );
    }

    #[test]
    fn test_bad_values() {
        let wf = parse(
            r#"
direktiv_api: workflow/v1
states:
  - id: wait
    type: delay
    duration: soon
    transition: check
  - id: check
    type: validate
    schema:
      type: 7
    transition: shape
  - id: shape
    type: noop
    transform: '. +'
    retries:
      maxAttempts: 0
"#,
        );
        let result = validate_workflow(&wf);
        assert!(has(&result, |e| matches!(e, ValidationError::InvalidDuration { value, .. } if value == "soon")));
        assert!(has(&result, |e| matches!(e, ValidationError::InvalidSchema { .. })));
        assert!(has(&result, |e| matches!(e, ValidationError::InvalidJq { .. })));
        assert!(has(&result, |e| matches!(e, ValidationError::InvalidRetryPolicy { .. })));
    }

    #[test]
    fn test_start_definitions() {
        let wf = parse(
            r#"
direktiv_api: workflow/v1
start:
  type: scheduled
  cron: "not a cron"
  state: ghost
states:
  - id: a
    type: noop
"#,
        );
        let result = validate_workflow(&wf);
        assert!(has(&result, |e| matches!(e, ValidationError::InvalidCron { .. })));
        assert!(has(&result, |e| matches!(e, ValidationError::StartStateNotFound { .. })));

        let wf = parse(
            r#"
direktiv_api: workflow/v1
start:
  type: scheduled
  cron: "*/5 * * * *"
states:
  - id: a
    type: noop
"#,
        );
        assert!(validate_workflow(&wf).is_ok());

        let wf = parse(
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
        assert!(has(&validate_workflow(&wf), |e| matches!(
            e,
            ValidationError::MissingStartEvents { .. }
        )));
    }

    #[test]
    fn test_unreachable_state_warns() {
        let wf = parse(
            r#"
direktiv_api: workflow/v1
states:
  - id: a
    type: noop
  - id: orphan
    type: noop
"#,
        );
        let result = validate_workflow(&wf);
        assert!(result.is_ok());
        assert_eq!(
            result.warnings,
            vec![ValidationWarning::UnreachableState {
                state_id: "orphan".to_string()
            }]
        );
    }
}
