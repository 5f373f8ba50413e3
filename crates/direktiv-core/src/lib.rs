// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Direktiv Core - Durable Workflow Engine
//!
//! This crate runs YAML workflow documents (see `direktiv-dsl`) as durable
//! instances. Every suspended instance lives in PostgreSQL; any node of a
//! cluster can resume any instance when its timer fires, its events arrive
//! or its child calls report back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │             API / HTTP ingress (invoke, events, cancel)              │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               Engine                                 │
//! │   step loop ── state logic ── catchers / retries ── termination      │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │               │                 │                  │
//!        ▼               ▼                 ▼                  ▼
//! ┌─────────────┐ ┌─────────────┐ ┌────────────────┐ ┌──────────────────┐
//! │   Timers    │ │ EventRouter │ │    Sandbox     │ │   ClusterSync    │
//! │ cron, once  │ │ listeners,  │ │ function calls │ │ LISTEN/NOTIFY    │
//! │             │ │ correlation │ │                │ │ fan-out          │
//! └─────────────┘ └─────────────┘ └────────────────┘ └──────────────────┘
//!        │               │                                    │
//!        ▼               ▼                                    ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │          PostgreSQL (rows, advisory locks, notifications)            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Instance Status
//!
//! ```text
//!   pending ◄──► running ──► complete
//!      │            ├──────► failed
//!      │            └──────► crashed
//!      └─────────────────────► cancelled
//! ```
//!
//! | Status | Description |
//! |--------|-------------|
//! | `pending` | Waiting for a step, a timer, events or a child |
//! | `running` | A node is executing the current step |
//! | `complete` | Reached the end of the flow |
//! | `failed` | Ended with an error no catcher handled |
//! | `crashed` | Ended with an internal engine error |
//! | `cancelled` | Cancelled by the API, a timeout or its parent |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `DIREKTIV_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `DIREKTIV_HOSTNAME` | No | `HOSTNAME` | Controller name of this node |
//! | `DIREKTIV_MAX_CONCURRENT_STEPS` | No | `32` | Step workers per node |
//! | `DIREKTIV_MAX_INSTANCES_PER_INTERVAL` | No | `100` | Namespace rate limit |
//! | `DIREKTIV_HTTP_PORT` | No | `8080` | HTTP ingress port |
//!
//! See [`config::Config::from_env`] for the full list.
//!
//! # Modules
//!
//! - [`engine`]: instance lifecycle and the step loop
//! - [`states`]: behaviour of each state kind
//! - [`timers`]: cluster-wide cron and one-shot timers
//! - [`events`]: CloudEvents, listeners and correlation
//! - [`actions`]: sandbox backends for function calls
//! - [`persistence`]: storage, advisory locks and the message bus

#![deny(missing_docs)]

/// Sandbox backends executing function calls.
pub mod actions;

/// Cross-node command fan-out.
pub mod cluster;

/// Configuration loaded from environment variables.
pub mod config;

/// The instance engine.
pub mod engine;

/// Error types and well-known error codes.
pub mod error;

/// CloudEvents, event listeners and routing.
pub mod events;

/// HTTP ingress.
#[cfg(feature = "http")]
pub mod http;

/// Per-instance log lines.
pub mod logging;

/// Metric names and recorders.
pub mod metrics;

/// Embedded database migrations.
pub mod migrations;

/// Storage, advisory locks and the message bus.
pub mod persistence;

/// Embeddable runtime wiring an engine to its backends.
pub mod runtime;

/// State kind implementations.
pub mod states;

/// Cron and one-shot timers.
pub mod timers;

/// Variables and secrets.
pub mod vars;

pub use engine::{Engine, EngineParts};
pub use error::{CoreError, EngineError};
pub use runtime::EngineRuntime;
