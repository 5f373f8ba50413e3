// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow document types.
//!
//! These types are the single source of truth for the YAML workflow format:
//! the engine deserializes them, the validator walks them, and the JSON
//! Schema published by [`crate::workflow_json_schema`] is derived from them.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumString};

/// API discriminator every workflow document must declare.
pub const WORKFLOW_API_VERSION: &str = "workflow/v1";

// ============================================================================
// Root Types
// ============================================================================

/// Complete workflow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Document kind, must be `workflow/v1`.
    #[serde(rename = "direktiv_api", skip_serializing_if = "Option::is_none")]
    pub direktiv_api: Option<String>,

    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// How instances of this workflow are started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Start>,

    /// Functions callable from action, foreach and parallel states.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionDefinition>,

    /// Ordered list of states. The first one is the default start state.
    #[serde(default)]
    pub states: Vec<State>,

    /// Workflow level soft and hard timeouts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<Timeouts>,
}

impl Workflow {
    /// Look up a state by id.
    pub fn state(&self, id: &str) -> Option<&State> {
        self.states.iter().find(|s| s.id() == id)
    }

    /// Look up a function by id.
    pub fn function(&self, id: &str) -> Option<&FunctionDefinition> {
        self.functions.iter().find(|f| f.id == id)
    }

    /// The start definition, defaulting to `type: default`.
    pub fn start_definition(&self) -> Start {
        self.start.clone().unwrap_or_default()
    }

    /// Id of the state instances begin in.
    pub fn start_state(&self) -> Option<&str> {
        match self.start.as_ref().and_then(Start::state) {
            Some(state) => Some(state),
            None => self.states.first().map(State::id),
        }
    }
}

/// Workflow level timeouts as ISO-8601 durations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    /// Soft bound; raises a catchable timeout in the running state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<String>,
    /// Hard bound; the instance is cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill: Option<String>,
}

// ============================================================================
// Start Definitions
// ============================================================================

/// Start definition, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Start {
    /// Started through the API.
    Default {
        /// Explicit start state.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
    },
    /// Started by a cron schedule.
    Scheduled {
        /// Explicit start state.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
        /// Cron pattern.
        cron: String,
    },
    /// Started by a single event.
    Event {
        /// Explicit start state.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
        /// Event template.
        event: EventTemplate,
    },
    /// Started by any one of several events.
    EventsXor {
        /// Explicit start state.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
        /// Event templates.
        events: Vec<EventTemplate>,
    },
    /// Started once all events have arrived.
    EventsAnd {
        /// Explicit start state.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<String>,
        /// Event templates.
        events: Vec<EventTemplate>,
        /// How long a partially filled wait is kept.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lifespan: Option<String>,
        /// Extension keys events must agree on.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        correlate: Vec<String>,
    },
}

impl Default for Start {
    fn default() -> Self {
        Start::Default { state: None }
    }
}

impl Start {
    /// Explicit start state, if any.
    pub fn state(&self) -> Option<&str> {
        match self {
            Start::Default { state }
            | Start::Scheduled { state, .. }
            | Start::Event { state, .. }
            | Start::EventsXor { state, .. }
            | Start::EventsAnd { state, .. } => state.as_deref(),
        }
    }

    /// Kind name as written in documents.
    pub fn kind(&self) -> &'static str {
        match self {
            Start::Default { .. } => "default",
            Start::Scheduled { .. } => "scheduled",
            Start::Event { .. } => "event",
            Start::EventsXor { .. } => "eventsXor",
            Start::EventsAnd { .. } => "eventsAnd",
        }
    }

    /// Event templates for event driven starts.
    pub fn events(&self) -> Vec<EventTemplate> {
        match self {
            Start::Event { event, .. } => vec![event.clone()],
            Start::EventsXor { events, .. } | Start::EventsAnd { events, .. } => events.clone(),
            _ => Vec::new(),
        }
    }
}

/// An event type plus filters on its extension context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventTemplate {
    /// CloudEvent type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Extension filters. String values are glob patterns.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

// ============================================================================
// Functions
// ============================================================================

/// Kind of callable a function refers to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FunctionType {
    /// Container image scoped to the workflow.
    KnativeWorkflow,
    /// Pre-existing namespace service.
    KnativeNamespace,
    /// Another workflow in the same namespace.
    Subflow,
}

/// Container size tier.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FunctionSize {
    #[default]
    Small,
    Medium,
    Large,
}

/// A callable declared by the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDefinition {
    /// Identifier referenced by actions.
    pub id: String,
    /// Function kind.
    #[serde(rename = "type")]
    pub function_type: FunctionType,
    /// Container image (`knative-workflow`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Container command (`knative-workflow`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    /// Container size (`knative-workflow`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<FunctionSize>,
    /// Service name (`knative-namespace`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Workflow name (`subflow`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
}

// ============================================================================
// States
// ============================================================================

/// Kind of a state, as written in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum StateType {
    Noop,
    Switch,
    Delay,
    Error,
    Validate,
    ConsumeEvent,
    EventsAnd,
    EventsXor,
    GenerateEvent,
    Getter,
    Setter,
    Action,
    Foreach,
    Parallel,
}

/// Union of all state kinds, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum State {
    /// Passes data through, optionally transformed.
    Noop(NoopState),
    /// Branches on the first truthy jq condition.
    Switch(SwitchState),
    /// Sleeps for a duration.
    Delay(DelayState),
    /// Raises a catchable error.
    Error(ErrorState),
    /// Validates data against a JSON Schema.
    Validate(ValidateState),
    /// Waits for one event.
    ConsumeEvent(ConsumeEventState),
    /// Waits for all listed events.
    EventsAnd(EventsAndState),
    /// Waits for any one of the listed events.
    EventsXor(EventsXorState),
    /// Emits an event.
    GenerateEvent(GenerateEventState),
    /// Reads variables into state data.
    Getter(GetterState),
    /// Writes variables from state data.
    Setter(SetterState),
    /// Calls one function.
    Action(ActionState),
    /// Calls one function per array element.
    Foreach(ForeachState),
    /// Calls several functions at once.
    Parallel(ParallelState),
}

/// Fields shared by every state kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StateCommon {
    /// Unique state identifier.
    pub id: String,
    /// jq expression logged when the state is entered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    /// Error catchers, evaluated in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<ErrorCatcher>,
    /// Retry policy applied to uncaught catchable errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryPolicy>,
    /// Arbitrary metadata, ignored by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Routes matching errors to another state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCatcher {
    /// Glob pattern matched against the error code.
    pub error: String,
    /// Next state. Absent ends the workflow successfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// Retry policy for catchable errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total executions including the first one.
    #[serde(alias = "max_attempts")]
    pub max_attempts: u32,
    /// Base delay as ISO-8601 duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    /// Multiplier applied per attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    /// Glob patterns of codes eligible for retry. Empty retries every code.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,
    /// Code raised into the catchers once retries are exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throw: Option<String>,
}

/// `noop` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NoopState {
    #[serde(flatten)]
    pub common: StateCommon,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// `switch` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SwitchState {
    #[serde(flatten)]
    pub common: StateCommon,
    pub conditions: Vec<SwitchCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_transition: Option<String>,
}

/// One branch of a switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SwitchCondition {
    /// jq expression evaluated for truthiness.
    pub condition: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// `delay` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DelayState {
    #[serde(flatten)]
    pub common: StateCommon,
    /// ISO-8601 duration.
    pub duration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// `error` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorState {
    #[serde(flatten)]
    pub common: StateCommon,
    /// Code of the raised error.
    pub error: String,
    /// Message with `%v` / `%s` placeholders.
    #[serde(default)]
    pub message: String,
    /// jq expressions substituted into the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// `validate` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidateState {
    #[serde(flatten)]
    pub common: StateCommon,
    /// JSON Schema.
    pub schema: Value,
    /// jq expression selecting the validated value. Defaults to all data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// `consumeEvent` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeEventState {
    #[serde(flatten)]
    pub common: StateCommon,
    pub event: EventTemplate,
    /// ISO-8601 duration before the wait times out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// `eventsAnd` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventsAndState {
    #[serde(flatten)]
    pub common: StateCommon,
    pub events: Vec<EventTemplate>,
    /// Extension keys the events must agree on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correlate: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// `eventsXor` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventsXorState {
    #[serde(flatten)]
    pub common: StateCommon,
    pub events: Vec<EventBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// One branch of an `eventsXor` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventBranch {
    pub event: EventTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// `generateEvent` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateEventState {
    #[serde(flatten)]
    pub common: StateCommon,
    pub event: GenerateEventDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// The event emitted by a `generateEvent` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenerateEventDefinition {
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event source. Defaults to the instance id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// jq expression producing the payload. Defaults to all data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Content type. Non-JSON payloads are sent base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// Extension attributes; string values are jq expressions.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

/// Variable scope.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VariableScope {
    Instance,
    Workflow,
    Namespace,
}

/// `getter` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetterState {
    #[serde(flatten)]
    pub common: StateCommon,
    pub variables: Vec<GetterVariable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// A variable read by a getter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetterVariable {
    pub key: String,
    pub scope: VariableScope,
    /// Alternative key under `var`.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// `setter` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetterState {
    #[serde(flatten)]
    pub common: StateCommon,
    pub variables: Vec<SetterVariable>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// A variable written by a setter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetterVariable {
    pub key: String,
    pub scope: VariableScope,
    /// jq expression producing the value.
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A call to a declared function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    /// Function id.
    pub function: String,
    /// jq expression producing the input. Defaults to all data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// Secrets exposed to the function under `secrets`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    /// Retry policy, used when the state declares none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryPolicy>,
}

/// `action` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ActionState {
    #[serde(flatten)]
    pub common: StateCommon,
    pub action: ActionDefinition,
    /// Fire and forget.
    #[serde(rename = "async", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// `foreach` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ForeachState {
    #[serde(flatten)]
    pub common: StateCommon,
    /// jq expression producing the array to iterate.
    pub array: String,
    pub action: ActionDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

/// Completion mode of a parallel state.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BranchMode {
    /// Every branch must succeed.
    #[default]
    And,
    /// The first successful branch wins.
    Or,
}

/// `parallel` state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParallelState {
    #[serde(flatten)]
    pub common: StateCommon,
    pub actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub mode: BranchMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,
}

impl State {
    /// Fields shared by every kind.
    pub fn common(&self) -> &StateCommon {
        match self {
            State::Noop(s) => &s.common,
            State::Switch(s) => &s.common,
            State::Delay(s) => &s.common,
            State::Error(s) => &s.common,
            State::Validate(s) => &s.common,
            State::ConsumeEvent(s) => &s.common,
            State::EventsAnd(s) => &s.common,
            State::EventsXor(s) => &s.common,
            State::GenerateEvent(s) => &s.common,
            State::Getter(s) => &s.common,
            State::Setter(s) => &s.common,
            State::Action(s) => &s.common,
            State::Foreach(s) => &s.common,
            State::Parallel(s) => &s.common,
        }
    }

    /// State id.
    pub fn id(&self) -> &str {
        &self.common().id
    }

    /// State kind.
    pub fn state_type(&self) -> StateType {
        match self {
            State::Noop(_) => StateType::Noop,
            State::Switch(_) => StateType::Switch,
            State::Delay(_) => StateType::Delay,
            State::Error(_) => StateType::Error,
            State::Validate(_) => StateType::Validate,
            State::ConsumeEvent(_) => StateType::ConsumeEvent,
            State::EventsAnd(_) => StateType::EventsAnd,
            State::EventsXor(_) => StateType::EventsXor,
            State::GenerateEvent(_) => StateType::GenerateEvent,
            State::Getter(_) => StateType::Getter,
            State::Setter(_) => StateType::Setter,
            State::Action(_) => StateType::Action,
            State::Foreach(_) => StateType::Foreach,
            State::Parallel(_) => StateType::Parallel,
        }
    }

    /// Effective retry policy. Action states fall back to the action's policy.
    pub fn retries(&self) -> Option<&RetryPolicy> {
        if let Some(policy) = self.common().retries.as_ref() {
            return Some(policy);
        }
        match self {
            State::Action(s) => s.action.retries.as_ref(),
            State::Foreach(s) => s.action.retries.as_ref(),
            _ => None,
        }
    }

    /// Every state id this state can hand control to, paired with where the
    /// reference appears.
    pub fn transitions(&self) -> Vec<(String, &str)> {
        let mut out = Vec::new();
        match self {
            State::Noop(s) => push_target(&mut out, "transition".into(), &s.transition),
            State::Delay(s) => push_target(&mut out, "transition".into(), &s.transition),
            State::Validate(s) => push_target(&mut out, "transition".into(), &s.transition),
            State::ConsumeEvent(s) => push_target(&mut out, "transition".into(), &s.transition),
            State::EventsAnd(s) => push_target(&mut out, "transition".into(), &s.transition),
            State::GenerateEvent(s) => push_target(&mut out, "transition".into(), &s.transition),
            State::Getter(s) => push_target(&mut out, "transition".into(), &s.transition),
            State::Setter(s) => push_target(&mut out, "transition".into(), &s.transition),
            State::Action(s) => push_target(&mut out, "transition".into(), &s.transition),
            State::Foreach(s) => push_target(&mut out, "transition".into(), &s.transition),
            State::Parallel(s) => push_target(&mut out, "transition".into(), &s.transition),
            State::Error(_) => {}
            State::Switch(s) => {
                for (i, c) in s.conditions.iter().enumerate() {
                    push_target(&mut out, format!("conditions[{}].transition", i), &c.transition);
                }
                push_target(&mut out, "defaultTransition".into(), &s.default_transition);
            }
            State::EventsXor(s) => {
                for (i, b) in s.events.iter().enumerate() {
                    push_target(&mut out, format!("events[{}].transition", i), &b.transition);
                }
            }
        }
        for (i, c) in self.common().catch.iter().enumerate() {
            push_target(&mut out, format!("catch[{}].transition", i), &c.transition);
        }
        out
    }

    /// Actions invoked by this state.
    pub fn actions(&self) -> Vec<&ActionDefinition> {
        match self {
            State::Action(s) => vec![&s.action],
            State::Foreach(s) => vec![&s.action],
            State::Parallel(s) => s.actions.iter().collect(),
            _ => Vec::new(),
        }
    }
}

fn push_target<'a>(out: &mut Vec<(String, &'a str)>, place: String, target: &'a Option<String>) {
    if let Some(t) = target {
        out.push((place, t.as_str()));
    }
}
