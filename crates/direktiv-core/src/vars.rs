// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Variable and secret stores used by getter, setter and action states.
//!
//! Variables are addressed by `(scope, scope id, key)`: the scope id is the
//! instance id, the workflow id or the namespace name. Instance variables are
//! dropped when their instance terminates.

use std::collections::HashMap;

use async_trait::async_trait;
use direktiv_dsl::VariableScope;
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::error::CoreError;

/// Stored variable value.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct VariableRecord {
    /// Raw bytes.
    pub data: Vec<u8>,
    /// Content type of `data`.
    pub mime_type: String,
}

/// Scoped key/value storage.
#[async_trait]
#[allow(missing_docs)]
pub trait VariableStore: Send + Sync {
    async fn get(
        &self,
        scope: VariableScope,
        scope_id: &str,
        key: &str,
    ) -> Result<Option<VariableRecord>, CoreError>;

    async fn set(
        &self,
        scope: VariableScope,
        scope_id: &str,
        key: &str,
        value: &VariableRecord,
    ) -> Result<(), CoreError>;

    /// Returns true if the variable existed.
    async fn delete(&self, scope: VariableScope, scope_id: &str, key: &str)
    -> Result<bool, CoreError>;

    /// Drop every variable of one scope owner.
    async fn delete_scope(&self, scope: VariableScope, scope_id: &str) -> Result<u64, CoreError>;
}

/// Namespace secrets.
#[async_trait]
#[allow(missing_docs)]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>, CoreError>;

    async fn set(&self, namespace: &str, name: &str, data: &[u8]) -> Result<(), CoreError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, CoreError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

/// Variables in the `variables` table.
#[derive(Clone)]
pub struct PostgresVariables {
    pool: PgPool,
}

impl PostgresVariables {
    /// Create a store backed by `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VariableStore for PostgresVariables {
    async fn get(
        &self,
        scope: VariableScope,
        scope_id: &str,
        key: &str,
    ) -> Result<Option<VariableRecord>, CoreError> {
        let record = sqlx::query_as::<_, VariableRecord>(
            r#"
            SELECT data, mime_type FROM variables
            WHERE scope = $1 AND scope_id = $2 AND key = $3
            "#,
        )
        .bind(scope.as_ref())
        .bind(scope_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn set(
        &self,
        scope: VariableScope,
        scope_id: &str,
        key: &str,
        value: &VariableRecord,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO variables (scope, scope_id, key, data, mime_type)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (scope, scope_id, key)
            DO UPDATE SET data = EXCLUDED.data, mime_type = EXCLUDED.mime_type, updated_at = NOW()
            "#,
        )
        .bind(scope.as_ref())
        .bind(scope_id)
        .bind(key)
        .bind(&value.data)
        .bind(&value.mime_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(
        &self,
        scope: VariableScope,
        scope_id: &str,
        key: &str,
    ) -> Result<bool, CoreError> {
        let result =
            sqlx::query("DELETE FROM variables WHERE scope = $1 AND scope_id = $2 AND key = $3")
                .bind(scope.as_ref())
                .bind(scope_id)
                .bind(key)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_scope(&self, scope: VariableScope, scope_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM variables WHERE scope = $1 AND scope_id = $2")
            .bind(scope.as_ref())
            .bind(scope_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Secrets in the `secrets` table.
#[derive(Clone)]
pub struct PostgresSecrets {
    pool: PgPool,
}

impl PostgresSecrets {
    /// Create a store backed by `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecretStore for PostgresSecrets {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT data FROM secrets WHERE namespace = $1 AND name = $2")
                .bind(namespace)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(data,)| data))
    }

    async fn set(&self, namespace: &str, name: &str, data: &[u8]) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO secrets (namespace, name, data) VALUES ($1, $2, $3)
            ON CONFLICT (namespace, name) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
            "#,
        )
        .bind(namespace)
        .bind(name)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM secrets WHERE namespace = $1 AND name = $2")
            .bind(namespace)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// In-memory
// ============================================================================

type VariableKey = (VariableScope, String, String);

/// Variables held in memory.
#[derive(Default)]
pub struct MemoryVariables {
    values: Mutex<HashMap<VariableKey, VariableRecord>>,
}

impl MemoryVariables {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VariableStore for MemoryVariables {
    async fn get(
        &self,
        scope: VariableScope,
        scope_id: &str,
        key: &str,
    ) -> Result<Option<VariableRecord>, CoreError> {
        let values = self.values.lock().await;
        Ok(values
            .get(&(scope, scope_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn set(
        &self,
        scope: VariableScope,
        scope_id: &str,
        key: &str,
        value: &VariableRecord,
    ) -> Result<(), CoreError> {
        self.values
            .lock()
            .await
            .insert((scope, scope_id.to_string(), key.to_string()), value.clone());
        Ok(())
    }

    async fn delete(
        &self,
        scope: VariableScope,
        scope_id: &str,
        key: &str,
    ) -> Result<bool, CoreError> {
        Ok(self
            .values
            .lock()
            .await
            .remove(&(scope, scope_id.to_string(), key.to_string()))
            .is_some())
    }

    async fn delete_scope(&self, scope: VariableScope, scope_id: &str) -> Result<u64, CoreError> {
        let mut values = self.values.lock().await;
        let before = values.len();
        values.retain(|(s, id, _), _| !(*s == scope && id == scope_id));
        Ok((before - values.len()) as u64)
    }
}

/// Secrets held in memory.
#[derive(Default)]
pub struct MemorySecrets {
    values: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemorySecrets {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecrets {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let values = self.values.lock().await;
        Ok(values
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn set(&self, namespace: &str, name: &str, data: &[u8]) -> Result<(), CoreError> {
        self.values
            .lock()
            .await
            .insert((namespace.to_string(), name.to_string()), data.to_vec());
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, CoreError> {
        Ok(self
            .values
            .lock()
            .await
            .remove(&(namespace.to_string(), name.to_string()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json(bytes: &[u8]) -> VariableRecord {
        VariableRecord {
            data: bytes.to_vec(),
            mime_type: "application/json".to_string(),
        }
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let vars = MemoryVariables::new();
        vars.set(VariableScope::Instance, "ns/wf/abcdef", "k", &json(b"1"))
            .await
            .unwrap();
        vars.set(VariableScope::Namespace, "ns", "k", &json(b"2"))
            .await
            .unwrap();

        let got = vars
            .get(VariableScope::Instance, "ns/wf/abcdef", "k")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.data, b"1");
        assert!(
            vars.get(VariableScope::Workflow, "ns", "k")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_delete_scope_only_drops_owner() {
        let vars = MemoryVariables::new();
        vars.set(VariableScope::Instance, "a", "x", &json(b"1"))
            .await
            .unwrap();
        vars.set(VariableScope::Instance, "a", "y", &json(b"1"))
            .await
            .unwrap();
        vars.set(VariableScope::Instance, "b", "x", &json(b"1"))
            .await
            .unwrap();

        assert_eq!(vars.delete_scope(VariableScope::Instance, "a").await.unwrap(), 2);
        assert!(
            vars.get(VariableScope::Instance, "b", "x")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_secrets_per_namespace() {
        let secrets = MemorySecrets::new();
        secrets.set("ns", "token", b"s3cr3t").await.unwrap();
        assert_eq!(
            secrets.get("ns", "token").await.unwrap().as_deref(),
            Some(&b"s3cr3t"[..])
        );
        assert!(secrets.get("other", "token").await.unwrap().is_none());
        assert!(secrets.delete("ns", "token").await.unwrap());
        assert!(!secrets.delete("ns", "token").await.unwrap());
    }
}
