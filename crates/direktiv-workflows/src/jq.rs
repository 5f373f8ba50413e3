// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! jq evaluation over JSON state data.
//!
//! Filters are compiled per call; documents are small and compilation is
//! cheap compared with the database round trips around every step.

use jaq_core::load::{Arena, File, Loader};
use jaq_core::{Compiler, Ctx, FilterT as _, RcIter};
use jaq_json::Val;
use serde_json::Value;

/// Errors from compiling or running a jq filter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JqError {
    /// The expression does not parse or references unknown definitions.
    #[error("failed to compile jq expression '{expression}': {reason}")]
    Compile {
        /// The offending expression.
        expression: String,
        /// Short description of the failure.
        reason: String,
    },

    /// The filter raised an error while running.
    #[error("jq expression '{expression}' failed: {reason}")]
    Runtime {
        /// The offending expression.
        expression: String,
        /// Error raised by the filter.
        reason: String,
    },

    /// The filter produced a number of results other than one.
    #[error("jq expression '{expression}' produced {count} results, expected exactly one")]
    Cardinality {
        /// The offending expression.
        expression: String,
        /// Number of results produced.
        count: usize,
    },

    /// The result had to be an object but was not.
    #[error("expected a JSON object, got {found}")]
    NotObject {
        /// JSON type of the result.
        found: &'static str,
    },
}

/// Check that an expression compiles.
pub fn check(expression: &str) -> Result<(), JqError> {
    query(expression, &Value::Null).map(|_| ()).or_else(|e| match e {
        JqError::Compile { .. } => Err(e),
        _ => Ok(()),
    })
}

/// Run an expression and collect every result.
pub fn query(expression: &str, input: &Value) -> Result<Vec<Value>, JqError> {
    let compile_err = |reason: String| JqError::Compile {
        expression: expression.to_string(),
        reason,
    };

    let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
    let arena = Arena::default();
    let program = File {
        code: expression,
        path: (),
    };

    let modules = loader
        .load(&arena, program)
        .map_err(|errs| compile_err(format!("{} syntax error(s)", errs.len())))?;

    let filter = Compiler::default()
        .with_funs(jaq_std::funs().chain(jaq_json::funs()))
        .compile(modules)
        .map_err(|errs| compile_err(format!("{} undefined reference(s)", errs.len())))?;

    let inputs = RcIter::new(core::iter::empty());
    let mut results = Vec::new();
    for item in filter.run((Ctx::new([], &inputs), Val::from(input.clone()))) {
        match item {
            Ok(v) => results.push(Value::from(v)),
            Err(e) => {
                return Err(JqError::Runtime {
                    expression: expression.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(results)
}

/// Run an expression that must produce exactly one result.
pub fn query_one(expression: &str, input: &Value) -> Result<Value, JqError> {
    let mut results = query(expression, input)?;
    if results.len() != 1 {
        return Err(JqError::Cardinality {
            expression: expression.to_string(),
            count: results.len(),
        });
    }
    Ok(results.remove(0))
}

/// jq truthiness: everything except `false` and `null` is true.
pub fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Null | Value::Bool(false))
}

/// Evaluate a condition. Empty output counts as false.
pub fn condition(expression: &str, input: &Value) -> Result<bool, JqError> {
    let results = query(expression, input)?;
    Ok(results.first().is_some_and(is_truthy))
}

/// Apply a state transform.
///
/// String transforms are jq expressions; any other value replaces the data
/// literally. The result must be an object either way.
pub fn transform(transform: &Value, input: &Value) -> Result<Value, JqError> {
    let out = match transform {
        Value::String(expression) => query_one(expression, input)?,
        literal => literal.clone(),
    };
    require_object(out)
}

/// Evaluate a value that may be a jq expression.
///
/// Strings are run as jq; other values are returned unchanged.
pub fn evaluate(value: &Value, input: &Value) -> Result<Value, JqError> {
    match value {
        Value::String(expression) => query_one(expression, input),
        other => Ok(other.clone()),
    }
}

/// Reject non-object values.
pub fn require_object(value: Value) -> Result<Value, JqError> {
    match value {
        Value::Object(_) => Ok(value),
        other => Err(JqError::NotObject {
            found: type_name(&other),
        }),
    }
}

/// JSON type name as jq reports it.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
