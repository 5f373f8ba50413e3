// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow Document Model
//!
//! This crate defines the YAML workflow format executed by the engine:
//! - Deserialization of `direktiv_api: workflow/v1` documents
//! - Typed access to states, functions, start definitions and timeouts
//! - ISO-8601 duration parsing shared by the validator and the engine
//! - JSON Schema of the document format, derived with schemars
//!
//! ```yaml
//! direktiv_api: workflow/v1
//! states:
//!   - id: hello
//!     type: noop
//!     transform: '. + {"greeting": "hi"}'
//! ```

mod schema_types;

pub mod duration;

pub use duration::{DurationError, is_valid_duration, parse_duration};
pub use schema_types::*;

use schemars::schema_for;

/// Errors produced while reading or writing documents.
#[derive(Debug, thiserror::Error)]
pub enum DslError {
    /// The document is not valid YAML or does not match the format.
    #[error("failed to parse workflow: {0}")]
    Parse(String),

    /// The document could not be serialized.
    #[error("failed to serialize workflow: {0}")]
    Serialize(String),
}

/// Parse a workflow document from YAML bytes.
pub fn parse_workflow(document: &[u8]) -> Result<Workflow, DslError> {
    serde_yaml::from_slice(document).map_err(|e| DslError::Parse(e.to_string()))
}

/// Parse a workflow document from a JSON value.
pub fn parse_workflow_value(value: &serde_json::Value) -> Result<Workflow, DslError> {
    serde_json::from_value(value.clone()).map_err(|e| DslError::Parse(e.to_string()))
}

/// Serialize a workflow back to YAML.
pub fn to_yaml(workflow: &Workflow) -> Result<String, DslError> {
    serde_yaml::to_string(workflow).map_err(|e| DslError::Serialize(e.to_string()))
}

/// JSON Schema describing the workflow document format.
pub fn workflow_json_schema() -> serde_json::Value {
    let schema = schema_for!(Workflow);
    serde_json::to_value(&schema).unwrap_or(serde_json::Value::Null)
}
