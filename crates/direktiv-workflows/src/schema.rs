// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON Schema helpers used by validate states and document validation.

use serde_json::Value;

/// Compile a schema, reporting why it is invalid.
pub fn check_schema(schema: &Value) -> Result<(), String> {
    jsonschema::validator_for(schema)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Validate `instance` against `schema`.
///
/// Returns every violation message on failure.
pub fn validate(schema: &Value, instance: &Value) -> Result<(), Vec<String>> {
    let validator = jsonschema::validator_for(schema).map_err(|e| vec![e.to_string()])?;
    let errors: Vec<String> = validator
        .iter_errors(instance)
        .map(|e| format!("{} at '{}'", e, e.instance_path))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_reports_violations() {
        let schema = json!({
            "type": "object",
            "required": ["name"],
            "properties": {"age": {"type": "integer"}}
        });
        assert!(validate(&schema, &json!({"name": "x", "age": 3})).is_ok());
        let errors = validate(&schema, &json!({"age": "old"})).unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_invalid_schema() {
        assert!(check_schema(&json!({"type": "integer"})).is_ok());
        assert!(check_schema(&json!({"type": 12})).is_err());
    }
}
