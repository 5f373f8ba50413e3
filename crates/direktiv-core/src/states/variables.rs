// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `getter` and `setter`.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use direktiv_dsl::{GetterState, SetterState};
use direktiv_workflows::jq;
use serde_json::{Map, Value};

use super::{StateLogic, StepContext, Transition, insert};
use crate::error::EngineError;
use crate::vars::VariableRecord;

const JSON: &str = "application/json";

fn to_value(record: VariableRecord) -> Value {
    if let Ok(value) = serde_json::from_slice(&record.data) {
        return value;
    }
    match String::from_utf8(record.data) {
        Ok(text) if record.mime_type.starts_with("text/") => Value::String(text),
        Ok(text) => Value::String(BASE64.encode(text.as_bytes())),
        Err(e) => Value::String(BASE64.encode(e.as_bytes())),
    }
}

fn to_record(value: &Value, mime_type: &str) -> Result<VariableRecord, EngineError> {
    let data = if mime_type == JSON {
        serde_json::to_vec(value).map_err(EngineError::internal)?
    } else {
        match value {
            Value::String(text) => text.clone().into_bytes(),
            other => other.to_string().into_bytes(),
        }
    };
    Ok(VariableRecord {
        data,
        mime_type: mime_type.to_string(),
    })
}

#[async_trait]
impl StateLogic for GetterState {
    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        _savedata: Option<&[u8]>,
        _wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        let mut vars = match ctx.data().get("var") {
            Some(Value::Object(existing)) => existing.clone(),
            _ => Map::new(),
        };
        for variable in &self.variables {
            let value = ctx
                .get_variable(variable.scope, &variable.key)
                .await?
                .map(to_value)
                .unwrap_or(Value::Null);
            let name = variable.alias.as_ref().unwrap_or(&variable.key);
            vars.insert(name.clone(), value);
        }

        let mut data = ctx.data().clone();
        insert(&mut data, "var", Value::Object(vars));
        ctx.set_data(data);
        Ok(Some(Transition::new(
            self.transform.as_ref(),
            self.transition.as_ref(),
        )))
    }
}

#[async_trait]
impl StateLogic for SetterState {
    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        _savedata: Option<&[u8]>,
        _wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        // Evaluate everything first so a bad expression writes nothing.
        let mut writes = Vec::with_capacity(self.variables.len());
        for variable in &self.variables {
            let value = jq::query_one(&variable.value, ctx.data())?;
            let record = match value {
                Value::Null => None,
                value => Some(to_record(
                    &value,
                    variable.mime_type.as_deref().unwrap_or(JSON),
                )?),
            };
            writes.push((variable.scope, &variable.key, record));
        }
        for (scope, key, record) in writes {
            ctx.set_variable(scope, key, record).await?;
        }
        Ok(Some(Transition::new(
            self.transform.as_ref(),
            self.transition.as_ref(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::logic;
    use crate::states::testing::{FakeContext, state};
    use direktiv_dsl::VariableScope;
    use serde_json::json;

    #[tokio::test]
    async fn test_setter_then_getter() {
        let setter = state(
            r#"
id: set
type: setter
variables:
  - key: counter
    scope: workflow
    value: '.count + 1'
  - key: note
    scope: namespace
    value: '.note'
    mimeType: text/plain
"#,
        );
        let mut ctx = FakeContext::new(json!({"count": 1, "note": "hi"}));
        logic(&setter).run(&mut ctx, None, None).await.unwrap().unwrap();
        let stored = &ctx.variables[&(VariableScope::Namespace, "note".to_string())];
        assert_eq!(stored.data, b"hi");

        let getter = state(
            r#"
id: get
type: getter
variables:
  - key: counter
    scope: workflow
  - key: note
    scope: namespace
    as: memo
  - key: missing
    scope: instance
"#,
        );
        logic(&getter).run(&mut ctx, None, None).await.unwrap().unwrap();
        let vars = &ctx.instance.state_data["var"];
        assert_eq!(vars["counter"], 2);
        assert_eq!(vars["memo"], "hi");
        assert_eq!(vars["missing"], Value::Null);
    }

    #[tokio::test]
    async fn test_setting_null_deletes() {
        let mut ctx = FakeContext::new(json!({}));
        ctx.variables.insert(
            (VariableScope::Instance, "gone".to_string()),
            VariableRecord {
                data: b"1".to_vec(),
                mime_type: JSON.to_string(),
            },
        );
        let setter = state("id: s\ntype: setter\nvariables:\n  - key: gone\n    scope: instance\n    value: 'null'\n");
        logic(&setter).run(&mut ctx, None, None).await.unwrap().unwrap();
        assert!(ctx.variables.is_empty());
    }

    #[test]
    fn test_binary_variables_read_as_base64() {
        let value = to_value(VariableRecord {
            data: vec![0xff, 0x00],
            mime_type: "application/octet-stream".into(),
        });
        assert_eq!(value, json!("/wA="));
    }

    #[test]
    fn test_json_is_decoded_whatever_the_mime_type() {
        let value = to_value(VariableRecord {
            data: br#"{"sku": "a-1", "qty": 2}"#.to_vec(),
            mime_type: "text/plain".into(),
        });
        assert_eq!(value, json!({"sku": "a-1", "qty": 2}));

        let value = to_value(VariableRecord {
            data: b"[1, 2]".to_vec(),
            mime_type: "application/octet-stream".into(),
        });
        assert_eq!(value, json!([1, 2]));

        let value = to_value(VariableRecord {
            data: b"plain words".to_vec(),
            mime_type: "text/plain".into(),
        });
        assert_eq!(value, json!("plain words"));
    }
}
