// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
use async_trait::async_trait;
use direktiv_dsl::ErrorState;
use direktiv_workflows::jq;
use serde_json::Value;

use super::{StateLogic, StepContext, Transition};
use crate::error::EngineError;

/// Substitute `%v` and `%s` placeholders in order. Strings are inserted
/// as-is, other values as JSON.
pub fn format_message(template: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('v') | Some('s') => {
                    chars.next();
                    match args.next() {
                        Some(Value::String(s)) => out.push_str(s),
                        Some(other) => out.push_str(&other.to_string()),
                        None => out.push_str("%!v(MISSING)"),
                    }
                    continue;
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl StateLogic for ErrorState {
    async fn run(
        &self,
        ctx: &mut dyn StepContext,
        _savedata: Option<&[u8]>,
        _wakedata: Option<&[u8]>,
    ) -> Result<Option<Transition>, EngineError> {
        let args = self
            .args
            .iter()
            .map(|arg| jq::query_one(arg, ctx.data()))
            .collect::<Result<Vec<_>, _>>()?;
        Err(EngineError::catchable(
            &self.error,
            format_message(&self.message, &args),
        ))
    }
}
