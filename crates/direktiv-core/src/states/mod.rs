// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State logic catalog.
//!
//! Every state kind implements [`StateLogic`]. A step runs the state once
//! with the continuation saved by the previous run of the same step
//! (`savedata`) and whatever woke it (`wakedata`):
//!
//! ```text
//!  run(None, None)                      first entry, or a retry
//!    ├─ Ok(Some(transition))            done, engine transforms and moves on
//!    ├─ Ok(None) + save_memory(..)      suspended, waiting for a wakeup
//!    └─ Err(..)                         catchers, retries, failure
//!  run(Some(memory), Some(wake))        resumed by a timer, event or child result
//! ```
//!
//! States never hold anything in memory between runs; whatever they need
//! later goes through [`StepContext::save_memory`]. Side effects (timers,
//! listeners, child calls, events, variables) go through the context so the
//! engine can persist and clean them up.

mod action;
mod delay;
mod error;
mod events;
mod fanout;
mod generate_event;
mod noop;
mod switch;
mod validate;
mod variables;

pub use error::format_message;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktiv_dsl::{EventTemplate, FunctionDefinition, State, VariableScope, parse_duration};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::events::CloudEvent;
use crate::persistence::InstanceRecord;
use crate::vars::VariableRecord;

/// Where a finished step goes next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    /// Applied to the state data before moving on.
    pub transform: Option<Value>,
    /// Next state; `None` ends the instance successfully.
    pub next: Option<String>,
}

impl Transition {
    /// Transition with an optional transform.
    pub fn new(transform: Option<&Value>, next: Option<&String>) -> Self {
        Self {
            transform: transform.cloned(),
            next: next.cloned(),
        }
    }
}

/// Kind of a child started by a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildKind {
    /// Container call.
    Isolate,
    /// Subflow instance.
    Subflow,
}

/// A child started by a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildInfo {
    /// Action id, or the subflow's instance id.
    pub id: String,
    /// Child kind.
    pub kind: ChildKind,
}

/// Function call requested by a state.
#[derive(Debug, Clone)]
pub struct FunctionCall {
    /// Resolved function.
    pub function: FunctionDefinition,
    /// Call input.
    pub input: Value,
    /// Fire and forget; no result is delivered.
    pub is_async: bool,
}

/// Engine services available to a running state.
#[async_trait]
pub trait StepContext: Send {
    /// Instance being stepped.
    fn instance(&self) -> &InstanceRecord;

    /// Current state data.
    fn data(&self) -> &Value;

    /// Replace the state data.
    fn set_data(&mut self, data: Value);

    /// Look up a function of the running workflow revision.
    fn function(&self, id: &str) -> Option<&FunctionDefinition>;

    /// Maximum children one state may start.
    fn max_parallel_actions(&self) -> usize;

    /// Persist the continuation of this step.
    async fn save_memory(&mut self, memory: Vec<u8>) -> Result<(), EngineError>;

    /// Wake this step at `at`.
    async fn sleep_until(&mut self, at: DateTime<Utc>) -> Result<(), EngineError>;

    /// Wake this step with events matching `templates`. With `all` set every
    /// template must be matched, grouped by the `correlate` keys.
    async fn listen(
        &mut self,
        templates: Vec<EventTemplate>,
        correlate: Vec<String>,
        all: bool,
    ) -> Result<(), EngineError>;

    /// Start a function call. The result arrives as wake data.
    async fn call(&mut self, call: FunctionCall) -> Result<ChildInfo, EngineError>;

    /// Publish an event into the instance's namespace.
    async fn emit(&mut self, event: CloudEvent) -> Result<(), EngineError>;

    /// Read a variable.
    async fn get_variable(
        &mut self,
        scope: VariableScope,
        key: &str,
    ) -> Result<Option<VariableRecord>, EngineError>;

    /// Write a variable; `None` deletes it.
    async fn set_variable(
        &mut self,
        scope: VariableScope,
        key: &str,
        value: Option<VariableRecord>,
    ) -> Result<(), EngineError>;

    /// Read a namespace secret.
    async fn secret(&mut self, name: &str) -> Result<String, EngineError>;

    /// Write an instance log line.
    async fn log(&mut self, message: &str);
}

/// Behaviour of one state kind.
#[async_trait]
pub trait StateLogic: Send + Sync {
    /// Deadline of one execution, when the state declares one.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Children still running according to `savedata`.
    fn living_children(&self, _savedata: Option<&[u8]>) -> Vec<ChildInfo> {
        Vec::new()
    }

    /// Run or resume the state. `Ok(None)` suspends the step.
    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        savedata: Option<&[u8]>,
        wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError>;
}

/// Logic for a state.
pub fn logic(state: &State) -> &dyn StateLogic {
    match state {
        State::Noop(s) => s,
        State::Switch(s) => s,
        State::Delay(s) => s,
        State::Error(s) => s,
        State::Validate(s) => s,
        State::ConsumeEvent(s) => s,
        State::EventsAnd(s) => s,
        State::EventsXor(s) => s,
        State::GenerateEvent(s) => s,
        State::Getter(s) => s,
        State::Setter(s) => s,
        State::Action(s) => s,
        State::Foreach(s) => s,
        State::Parallel(s) => s,
    }
}

/// Deadline of one execution of `state`.
pub fn deadline(state: &State, default: Duration) -> Duration {
    logic(state).timeout().unwrap_or(default)
}

/// Parse an optional ISO-8601 timeout. Documents are validated on save, so
/// an unparsable value is treated as absent.
pub(crate) fn parse_timeout(timeout: Option<&String>) -> Option<Duration> {
    timeout.and_then(|t| parse_duration(t).ok())
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T, EngineError> {
    serde_json::from_slice(bytes)
        .map_err(|e| EngineError::internal(format!("corrupt {}: {}", what, e)))
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    serde_json::to_vec(value).map_err(EngineError::internal)
}

/// Insert `value` under `key` of the object `data`.
pub(crate) fn insert(data: &mut Value, key: &str, value: Value) {
    if let Value::Object(map) = data {
        map.insert(key.to_string(), value);
    }
}
