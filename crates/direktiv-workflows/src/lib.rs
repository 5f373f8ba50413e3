// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow validation and expression evaluation.
//!
//! Documents are checked here before the engine stores them, and the engine
//! evaluates every transform, condition and input mapping through [`jq`].
//!
//! ```text
//!     ┌─────────────┐      ┌─────────────┐      ┌─────────────┐
//!     │    YAML     │      │  Workflow   │      │ Validation  │
//!     │  document   │─────▶│   (dsl)     │─────▶│   Result    │
//!     └─────────────┘      └─────────────┘      └─────────────┘
//!                                 │
//!                                 ▼
//!                          ┌─────────────┐
//!                          │ jq / schema │  at run time
//!                          └─────────────┘
//! ```

pub mod jq;
pub mod matching;
pub mod schema;
pub mod validation;

pub use validation::{
    ValidationError, ValidationResult, ValidationWarning, check_cron, validate_workflow,
    validate_workflow_errors,
};

use direktiv_dsl::{DslError, Workflow, parse_workflow};

/// Errors from [`load_workflow`].
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The bytes are not a workflow document.
    #[error(transparent)]
    Parse(#[from] DslError),
    /// The document parsed but failed validation.
    #[error("workflow is invalid: {0}")]
    Invalid(String),
}

/// Parse and validate a document in one go.
pub fn load_workflow(document: &[u8]) -> Result<(Workflow, ValidationResult), LoadError> {
    let workflow = parse_workflow(document)?;
    let result = validate_workflow(&workflow);
    if result.has_errors() {
        tracing::debug!(errors = %result.error_summary(), "workflow rejected");
        return Err(LoadError::Invalid(result.error_summary()));
    }
    Ok((workflow, result))
}
