// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP sandbox: posts the request body to a per-function service.
//!
//! Workflow functions get a stable host derived from the namespace and a
//! hash of image, command and size. The service is created on first use
//! through an optional functions endpoint; until its host resolves the
//! request is retried.

use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use direktiv_dsl::FunctionType;
use reqwest::StatusCode;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{ActionOutput, ActionRequest, Sandbox, SandboxError};

/// Header carrying the action id.
pub const HEADER_ACTION_ID: &str = "Direktiv-ActionID";
/// Header carrying the instance id.
pub const HEADER_INSTANCE_ID: &str = "Direktiv-InstanceID";
/// Header carrying the step.
pub const HEADER_STEP: &str = "Direktiv-Step";
/// Header carrying the state deadline.
pub const HEADER_DEADLINE: &str = "Direktiv-Deadline";
/// Response header with the function's error code.
pub const HEADER_ERROR_CODE: &str = "Direktiv-ErrorCode";
/// Response header with the function's error message.
pub const HEADER_ERROR_MESSAGE: &str = "Direktiv-ErrorMessage";

/// HTTP sandbox settings.
#[derive(Debug, Clone)]
pub struct HttpSandboxConfig {
    /// Domain service hosts live under.
    pub domain: String,
    /// Endpoint that creates services; `None` when services are managed elsewhere.
    pub functions_url: Option<String>,
    /// Attempts while a host does not resolve.
    pub resolve_attempts: u32,
    /// Pause between those attempts.
    pub resolve_interval: Duration,
}

impl Default for HttpSandboxConfig {
    fn default() -> Self {
        Self {
            domain: "default.svc.cluster.local".to_string(),
            functions_url: None,
            resolve_attempts: 400,
            resolve_interval: Duration::from_millis(250),
        }
    }
}

/// Sandbox reaching functions over plain HTTP.
pub struct HttpSandbox {
    client: reqwest::Client,
    config: HttpSandboxConfig,
    created: DashSet<String>,
    create_lock: tokio::sync::Mutex<()>,
    running: DashMap<String, CancellationToken>,
}

impl HttpSandbox {
    /// Create a sandbox client.
    pub fn new(config: HttpSandboxConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            created: DashSet::new(),
            create_lock: tokio::sync::Mutex::new(()),
            running: DashMap::new(),
        }
    }

    /// Service name for a workflow function.
    pub fn service_name(request: &ActionRequest) -> String {
        let container = &request.container;
        let mut hasher = Sha256::new();
        hasher.update(container.image.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(container.cmd.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(container.size.to_string().as_bytes());
        let hash = hex::encode(&hasher.finalize()[..8]);
        format!("{}-{}", sanitize(&request.workflow.namespace), hash)
    }

    /// Host a request is sent to.
    pub fn host(&self, request: &ActionRequest) -> Result<String, SandboxError> {
        match request.container.function_type {
            FunctionType::KnativeWorkflow => Ok(format!(
                "{}.{}",
                Self::service_name(request),
                self.config.domain
            )),
            FunctionType::KnativeNamespace => {
                let service = request.container.service.as_deref().ok_or_else(|| {
                    SandboxError::Unsupported("namespace function without service".to_string())
                })?;
                Ok(format!("{}.{}", sanitize(service), self.config.domain))
            }
            FunctionType::Subflow => Err(SandboxError::Unsupported(
                "subflows are not run in a sandbox".to_string(),
            )),
        }
    }

    async fn ensure_service(&self, request: &ActionRequest) -> Result<(), SandboxError> {
        if request.container.function_type != FunctionType::KnativeWorkflow {
            return Ok(());
        }
        let Some(url) = self.config.functions_url.as_deref() else {
            return Ok(());
        };
        let name = Self::service_name(request);
        if self.created.contains(&name) {
            return Ok(());
        }

        let _guard = self.create_lock.lock().await;
        if self.created.contains(&name) {
            return Ok(());
        }

        let response = self
            .client
            .post(url)
            .json(&json!({
                "name": name,
                "namespace": request.workflow.namespace,
                "image": request.container.image,
                "cmd": request.container.cmd,
                "size": request.container.size,
                "registries": request.container.registries,
            }))
            .send()
            .await
            .map_err(|e| SandboxError::ServiceCreation {
                name: name.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() && status != StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::ServiceCreation {
                name,
                reason: format!("{}: {}", status, body),
            });
        }

        info!(service = %name, "sandbox service created");
        self.created.insert(name);
        Ok(())
    }

    async fn send(&self, request: &ActionRequest) -> Result<ActionOutput, SandboxError> {
        self.ensure_service(request).await?;
        let host = self.host(request)?;
        let url = format!("http://{}", host);

        for attempt in 0..self.config.resolve_attempts {
            let result = self
                .client
                .post(&url)
                .header(HEADER_ACTION_ID, &request.action_id)
                .header(HEADER_INSTANCE_ID, &request.workflow.instance)
                .header(HEADER_STEP, request.workflow.step.to_string())
                .header(HEADER_DEADLINE, request.deadline.to_rfc3339())
                .body(request.container.data.clone())
                .send()
                .await;

            match result {
                Ok(response) => return read_response(response).await,
                Err(e) if is_unresolved(&e) => {
                    debug!(%host, attempt, "service host not resolvable yet");
                    tokio::time::sleep(self.config.resolve_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SandboxError::Unresolved { host })
    }
}

#[async_trait]
impl Sandbox for HttpSandbox {
    #[instrument(skip(self, request), fields(action_id = %request.action_id, instance_id = %request.workflow.instance))]
    async fn dispatch(&self, request: ActionRequest) -> Result<ActionOutput, SandboxError> {
        let token = CancellationToken::new();
        self.running
            .insert(request.action_id.clone(), token.clone());

        let result = tokio::select! {
            _ = token.cancelled() => Err(SandboxError::Cancelled),
            result = self.send(&request) => result,
        };

        self.running.remove(&request.action_id);
        if let Err(e) = &result {
            warn!(error = %e, "action request failed");
        }
        result
    }

    async fn cancel(&self, action_id: &str) {
        if let Some((_, token)) = self.running.remove(action_id) {
            debug!(action_id, "cancelling action request");
            token.cancel();
        }
    }
}

async fn read_response(response: reqwest::Response) -> Result<ActionOutput, SandboxError> {
    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let error_code = header(HEADER_ERROR_CODE).filter(|c| !c.is_empty());
    let error_message = header(HEADER_ERROR_MESSAGE);
    let status = response.status();
    let body = response.bytes().await?;

    if let Some(code) = error_code {
        return Ok(ActionOutput::error(code, error_message.unwrap_or_default()));
    }
    if !status.is_success() {
        return Err(SandboxError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    Ok(ActionOutput::ok(body.to_vec()))
}

fn is_unresolved(err: &reqwest::Error) -> bool {
    if !err.is_connect() {
        return false;
    }
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = inner.source();
    }
    false
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionContainer, ActionWorkflow};
    use chrono::Utc;
    use direktiv_dsl::FunctionSize;
    use std::collections::BTreeMap;

    fn request(function_type: FunctionType, image: &str, size: FunctionSize) -> ActionRequest {
        ActionRequest {
            action_id: "a1".into(),
            workflow: ActionWorkflow {
                instance: "team.a/wf/abcdef".into(),
                namespace: "team.a".into(),
                state: "call".into(),
                step: 1,
                name: "wf".into(),
            },
            container: ActionContainer {
                function_type,
                image: Some(image.into()),
                cmd: None,
                size,
                service: Some("Billing".into()),
                data: Vec::new(),
                registries: BTreeMap::new(),
            },
            deadline: Utc::now(),
        }
    }

    #[test]
    fn test_host_is_stable_per_image_and_size() {
        let sandbox = HttpSandbox::new(HttpSandboxConfig::default());
        let a = request(FunctionType::KnativeWorkflow, "direktiv/echo", FunctionSize::Small);
        let b = request(FunctionType::KnativeWorkflow, "direktiv/echo", FunctionSize::Small);
        let c = request(FunctionType::KnativeWorkflow, "direktiv/echo", FunctionSize::Large);

        let host = sandbox.host(&a).unwrap();
        assert_eq!(host, sandbox.host(&b).unwrap());
        assert_ne!(host, sandbox.host(&c).unwrap());
        assert!(host.starts_with("team-a-"));
        assert!(host.ends_with(".default.svc.cluster.local"));
    }

    #[test]
    fn test_namespace_service_host() {
        let sandbox = HttpSandbox::new(HttpSandboxConfig {
            domain: "svc".into(),
            ..Default::default()
        });
        let req = request(FunctionType::KnativeNamespace, "ignored", FunctionSize::Small);
        assert_eq!(sandbox.host(&req).unwrap(), "billing.svc");

        let req = request(FunctionType::Subflow, "ignored", FunctionSize::Small);
        assert!(matches!(sandbox.host(&req), Err(SandboxError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_cancel_unknown_action_is_ignored() {
        let sandbox = HttpSandbox::new(HttpSandboxConfig::default());
        sandbox.cancel("missing").await;
    }
}
