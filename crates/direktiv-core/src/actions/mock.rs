// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock sandbox for testing.
//!
//! Answers every request through a script instead of running containers,
//! and records what it was asked to do.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ActionOutput, ActionRequest, Sandbox, SandboxError};

/// Scripted answer to one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return the request body unchanged.
    Echo,
    /// Return this JSON value.
    Json(Value),
    /// Return raw bytes.
    Bytes(Vec<u8>),
    /// Report a function error.
    Error {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
    },
    /// Fail to deliver the request.
    Unreachable,
    /// Never answer until cancelled.
    Hang,
}

type Script = Arc<dyn Fn(&ActionRequest) -> MockReply + Send + Sync>;

/// Mock sandbox for tests and local development.
pub struct MockSandbox {
    script: Script,
    /// Delay before answering.
    pub delay: Duration,
    requests: Mutex<Vec<ActionRequest>>,
    cancelled: Mutex<Vec<String>>,
    running: DashMap<String, CancellationToken>,
}

impl Default for MockSandbox {
    fn default() -> Self {
        Self::echo()
    }
}

impl MockSandbox {
    /// Sandbox answering every request with `script`.
    pub fn new(script: impl Fn(&ActionRequest) -> MockReply + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            delay: Duration::from_millis(5),
            requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            running: DashMap::new(),
        }
    }

    /// Sandbox that echoes request bodies.
    pub fn echo() -> Self {
        Self::new(|_| MockReply::Echo)
    }

    /// Set the answer delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Requests received so far.
    pub async fn requests(&self) -> Vec<ActionRequest> {
        self.requests.lock().await.clone()
    }

    /// Action ids that were cancelled.
    pub async fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().await.clone()
    }

    async fn answer(&self, request: &ActionRequest) -> Result<ActionOutput, SandboxError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match (self.script)(request) {
            MockReply::Echo => Ok(ActionOutput::ok(request.container.data.clone())),
            MockReply::Json(value) => Ok(ActionOutput::ok(serde_json::to_vec(&value).unwrap_or_default())),
            MockReply::Bytes(bytes) => Ok(ActionOutput::ok(bytes)),
            MockReply::Error { code, message } => Ok(ActionOutput::error(code, message)),
            MockReply::Unreachable => Err(SandboxError::Unresolved {
                host: "mock".to_string(),
            }),
            MockReply::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn dispatch(&self, request: ActionRequest) -> Result<ActionOutput, SandboxError> {
        self.requests.lock().await.push(request.clone());
        let token = CancellationToken::new();
        self.running
            .insert(request.action_id.clone(), token.clone());

        let result = tokio::select! {
            _ = token.cancelled() => Err(SandboxError::Cancelled),
            result = self.answer(&request) => result,
        };

        self.running.remove(&request.action_id);
        result
    }

    async fn cancel(&self, action_id: &str) {
        self.cancelled.lock().await.push(action_id.to_string());
        if let Some((_, token)) = self.running.remove(action_id) {
            token.cancel();
        }
    }
}
