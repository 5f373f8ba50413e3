// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema for the PostgreSQL backends.
//!
//! Every node runs [`run_postgres`] before starting its engine; sqlx keeps
//! concurrent nodes from applying the same version twice.
//!
//! ```ignore
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//! direktiv_core::migrations::run_postgres(&pool).await?;
//! ```

use sqlx::migrate::{MigrateError, Migrator};
use tracing::debug;

/// Namespaces, workflows, instances, timers, listeners and variables.
pub static POSTGRES: Migrator = sqlx::migrate!("./migrations/postgresql");

/// Bring the schema up to date. Applied versions are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    debug!(
        latest = latest_version(),
        known = POSTGRES.iter().count(),
        "Applying schema migrations"
    );
    POSTGRES.run(pool).await
}

/// Highest embedded schema version.
pub fn latest_version() -> i64 {
    POSTGRES.iter().map(|m| m.version).max().unwrap_or(0)
}
