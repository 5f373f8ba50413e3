// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action dispatcher - sandbox backends for function calls.
//!
//! The engine hands every container call to a [`Sandbox`] on a background
//! task and feeds the outcome back into the waiting step as an
//! [`ActionResultPayload`]. Subflow calls never reach a sandbox.

pub mod http;
pub mod mock;

pub use http::{HttpSandbox, HttpSandboxConfig};
pub use mock::{MockReply, MockSandbox};

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use direktiv_dsl::{FunctionSize, FunctionType};
use serde::{Deserialize, Serialize};

/// Instance context of an action request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionWorkflow {
    /// Calling instance.
    pub instance: String,
    /// Namespace of the instance.
    pub namespace: String,
    /// Calling state.
    pub state: String,
    /// Step the result must be reported against.
    pub step: i32,
    /// Workflow name.
    pub name: String,
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContainer {
    /// Function kind.
    #[serde(rename = "type")]
    pub function_type: FunctionType,
    /// Image (`knative-workflow`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Command (`knative-workflow`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    /// Size tier.
    #[serde(default)]
    pub size: FunctionSize,
    /// Existing service (`knative-namespace`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Request body.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Registry credentials keyed by registry host.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub registries: BTreeMap<String, String>,
}

/// A container call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    /// Unique id of this call.
    pub action_id: String,
    /// Calling instance.
    pub workflow: ActionWorkflow,
    /// Target.
    pub container: ActionContainer,
    /// When the calling state times out.
    pub deadline: DateTime<Utc>,
}

/// What a sandbox returned for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutput {
    /// Response body.
    pub output: Vec<u8>,
    /// Error code reported by the container.
    pub error_code: Option<String>,
    /// Error message reported by the container.
    pub error_message: Option<String>,
}

impl ActionOutput {
    /// Successful output.
    pub fn ok(output: impl Into<Vec<u8>>) -> Self {
        Self {
            output: output.into(),
            ..Default::default()
        }
    }

    /// Error reported by the function.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            output: Vec::new(),
            error_code: Some(code.into()),
            error_message: Some(message.into()),
        }
    }
}

/// Result of a child call delivered to the waiting step as wake data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResultPayload {
    /// Action id or subflow instance id.
    pub action_id: String,
    /// Error code; absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Output bytes.
    #[serde(default, with = "base64_bytes")]
    pub output: Vec<u8>,
}

impl ActionResultPayload {
    /// Attach the action id to a sandbox output.
    pub fn from_output(action_id: impl Into<String>, output: ActionOutput) -> Self {
        Self {
            action_id: action_id.into(),
            error_code: output.error_code,
            error_message: output.error_message,
            output: output.output,
        }
    }

    /// A failed call.
    pub fn failure(
        action_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            output: Vec::new(),
        }
    }
}

/// Sandbox errors.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The service host never resolved.
    #[error("service host '{host}' did not resolve")]
    Unresolved {
        /// Host name.
        host: String,
    },

    /// The request could not be sent.
    #[error("request failed: {0}")]
    Request(String),

    /// The service answered with an error status and no error code.
    #[error("service returned {status}: {body}")]
    Status {
        /// HTTP status.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The service could not be created.
    #[error("failed to create service '{name}': {reason}")]
    ServiceCreation {
        /// Service name.
        name: String,
        /// Failure detail.
        reason: String,
    },

    /// The request cannot be served by this sandbox.
    #[error("unsupported request: {0}")]
    Unsupported(String),

    /// The call was cancelled.
    #[error("action cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for SandboxError {
    fn from(err: reqwest::Error) -> Self {
        SandboxError::Request(err.to_string())
    }
}

/// Executes container calls.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run one call to completion.
    async fn dispatch(&self, request: ActionRequest) -> Result<ActionOutput, SandboxError>;

    /// Stop a running call. Unknown ids are ignored.
    async fn cancel(&self, action_id: &str);
}

pub(crate) mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, T: AsRef<[u8]>>(bytes: &T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}
