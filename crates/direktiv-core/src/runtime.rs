// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for direktiv-core.
//!
//! [`EngineRuntime`] wires an [`Engine`] to its backends and runs it inside an
//! existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use direktiv_core::runtime::EngineRuntime;
//! use direktiv_core::actions::{HttpSandbox, HttpSandboxConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let lock_pool = sqlx::PgPool::connect("postgres://...").await?;
//!
//!     let runtime = EngineRuntime::builder()
//!         .postgres(pool, lock_pool)
//!         .sandbox(Arc::new(HttpSandbox::new(HttpSandboxConfig::default())))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     runtime.engine().invoke("team", "hello", serde_json::json!({})).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::actions::Sandbox;
use crate::config::EngineConfig;
use crate::engine::{Engine, EngineParts};
use crate::persistence::{
    LockManager, MemoryBus, MemoryLocks, MemoryPersistence, MessageBus, Persistence, PostgresBus,
    PostgresLocks, PostgresPersistence,
};
use crate::timers::TimerConfig;
use crate::vars::{
    MemorySecrets, MemoryVariables, PostgresSecrets, PostgresVariables, SecretStore, VariableStore,
};

/// Builder for creating an [`EngineRuntime`].
#[derive(Default)]
pub struct EngineRuntimeBuilder {
    store: Option<Arc<dyn Persistence>>,
    locks: Option<Arc<dyn LockManager>>,
    bus: Option<Arc<dyn MessageBus>>,
    sandbox: Option<Arc<dyn Sandbox>>,
    variables: Option<Arc<dyn VariableStore>>,
    secrets: Option<Arc<dyn SecretStore>>,
    config: EngineConfig,
    timers: TimerConfig,
    http_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for EngineRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("sandbox", &self.sandbox.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .field("http_addr", &self.http_addr)
            .finish()
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use PostgreSQL for storage, variables and the message bus. Advisory
    /// locks take connections from `lock_pool`.
    pub fn postgres(mut self, pool: PgPool, lock_pool: PgPool) -> Self {
        self.store = Some(Arc::new(PostgresPersistence::new(pool.clone())));
        self.locks = Some(Arc::new(PostgresLocks::new(lock_pool)));
        self.bus = Some(Arc::new(PostgresBus::new(pool.clone())));
        self.variables = Some(Arc::new(PostgresVariables::new(pool.clone())));
        self.secrets = Some(Arc::new(PostgresSecrets::new(pool)));
        self
    }

    /// Use process-local backends. Nodes built from clones of the same
    /// backends form a cluster within one process.
    pub fn in_memory(mut self) -> Self {
        self.store = Some(Arc::new(MemoryPersistence::new()));
        self.locks = Some(Arc::new(MemoryLocks::new()));
        self.bus = Some(Arc::new(MemoryBus::new()));
        self.variables = Some(Arc::new(MemoryVariables::new()));
        self.secrets = Some(Arc::new(MemorySecrets::new()));
        self
    }

    /// Set the storage backend.
    pub fn store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the advisory lock backend.
    pub fn locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Set the cluster message bus.
    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set the sandbox (required).
    pub fn sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Set the variable store.
    pub fn variables(mut self, variables: Arc<dyn VariableStore>) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Set the secret store.
    pub fn secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Set engine limits.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set timer manager settings.
    pub fn timers(mut self, timers: TimerConfig) -> Self {
        self.timers = timers;
        self
    }

    /// Serve the HTTP ingress on `addr`. Requires the `http` feature.
    pub fn http_addr(mut self, addr: SocketAddr) -> Self {
        self.http_addr = Some(addr);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if a backend is missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let parts = EngineParts {
            store: self.store.ok_or_else(|| anyhow!("store is required"))?,
            locks: self.locks.ok_or_else(|| anyhow!("locks are required"))?,
            bus: self.bus.ok_or_else(|| anyhow!("message bus is required"))?,
            sandbox: self.sandbox.ok_or_else(|| anyhow!("sandbox is required"))?,
            variables: self
                .variables
                .ok_or_else(|| anyhow!("variable store is required"))?,
            secrets: self
                .secrets
                .ok_or_else(|| anyhow!("secret store is required"))?,
            config: self.config,
            timers: self.timers,
        };
        if cfg!(not(feature = "http")) && self.http_addr.is_some() {
            return Err(anyhow!("http_addr requires the http feature"));
        }
        Ok(EngineRuntimeConfig {
            parts,
            http_addr: self.http_addr,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    parts: EngineParts,
    http_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for EngineRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntimeConfig")
            .field("hostname", &self.parts.config.hostname)
            .field("http_addr", &self.http_addr)
            .finish()
    }
}

impl EngineRuntimeConfig {
    /// Start the engine and, when configured, the HTTP ingress.
    pub async fn start(self) -> Result<EngineRuntime> {
        let engine = Engine::new(self.parts)?;
        engine.start().await?;

        let http_shutdown = Arc::new(Notify::new());
        let http_handle = match self.http_addr {
            #[cfg(feature = "http")]
            Some(addr) => {
                let engine = engine.clone();
                let shutdown = http_shutdown.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = crate::http::serve(addr, engine, shutdown).await {
                        error!(error = %e, "HTTP ingress stopped");
                    }
                }))
            }
            _ => None,
        };

        info!(node_id = %engine.node_id(), "EngineRuntime started");
        Ok(EngineRuntime {
            engine,
            http_handle,
            http_shutdown,
        })
    }
}

/// A running engine embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    engine: Arc<Engine>,
    http_handle: Option<JoinHandle<()>>,
    http_shutdown: Arc<Notify>,
}

impl std::fmt::Debug for EngineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntime")
            .field("engine", &self.engine)
            .field("http", &self.http_handle.is_some())
            .finish()
    }
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// The running engine.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Gracefully shut down the ingress and the engine's background tasks.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        if let Some(handle) = self.http_handle {
            self.http_shutdown.notify_one();
            if let Err(e) = handle.await {
                error!("HTTP ingress task panicked: {}", e);
                return Err(anyhow!("http task panicked: {}", e));
            }
        }
        self.engine.shutdown().await;

        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}
