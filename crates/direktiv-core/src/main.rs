// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Direktiv Core - standalone engine node.
//!
//! Connects to PostgreSQL, applies migrations and runs one engine node until
//! interrupted. Several nodes pointed at the same database form a cluster.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use direktiv_core::actions::{HttpSandbox, HttpSandboxConfig};
use direktiv_core::config::Config;
use direktiv_core::runtime::EngineRuntime;
use direktiv_core::{metrics, migrations};

fn init_tracing(json: bool) {
    let mut filter = EnvFilter::from_default_env();
    match "direktiv_core=info".parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => eprintln!("invalid default log directive: {}", e),
    }
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(false);
            error!("Configuration error: {}", e);
            return Err(e.into());
        }
    };
    init_tracing(config.log_json);

    info!(
        hostname = %config.engine.hostname,
        max_steps = config.engine.max_concurrent_steps,
        lock_pool = config.lock_pool_size,
        http_addr = %config.http_addr,
        "Starting Direktiv Core"
    );

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let lock_pool = config
        .lock_pool_options()
        .connect(&config.database_url)
        .await?;
    info!("Database connection established");

    info!("Running database migrations...");
    migrations::run_postgres(&pool).await?;
    info!("Migrations completed");

    metrics::register_metrics();

    let sandbox = HttpSandbox::new(HttpSandboxConfig {
        domain: config.sandbox_domain.clone(),
        functions_url: config.functions_url.clone(),
        ..HttpSandboxConfig::default()
    });

    let builder = EngineRuntime::builder()
        .postgres(pool.clone(), lock_pool.clone())
        .sandbox(Arc::new(sandbox))
        .config(config.engine.clone());
    let builder = if cfg!(feature = "http") {
        builder.http_addr(config.http_addr)
    } else {
        warn!("Built without the http feature; ingress disabled");
        builder
    };
    let runtime = builder.build()?.start().await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    lock_pool.close().await;
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
