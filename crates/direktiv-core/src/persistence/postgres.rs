// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence for direktiv-core.
//!
//! Every operation is a free function over a [`PgPool`]; [`PostgresPersistence`]
//! delegates to them so handlers and tests can call either form.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{
    CancelledInstance, EventListenerRecord, InstanceLogRecord, InstanceRecord, InstanceStatus,
    NamespaceRecord, NewInstance, NewTimer, NewWorkflow, Page, Persistence, TimerRecord,
    WorkflowRecord, WorkflowUpdate,
};
use crate::error::CoreError;

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Begin a transaction at SERIALIZABLE isolation.
pub async fn begin_serializable(pool: &PgPool) -> Result<Transaction<'static, Postgres>, CoreError> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

fn limit(page: Page) -> Option<i64> {
    (page.limit > 0).then_some(page.limit)
}

/// LIKE pattern matching every string that starts with `prefix`.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

// ============================================================================
// Namespace Operations
// ============================================================================

/// Create a namespace.
pub async fn create_namespace(pool: &PgPool, name: &str) -> Result<NamespaceRecord, CoreError> {
    let record = sqlx::query_as::<_, NamespaceRecord>(
        r#"
        INSERT INTO namespaces (name, created_at)
        VALUES ($1, NOW())
        RETURNING name, created_at
        "#,
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .map_err(|e| match CoreError::from(e) {
        CoreError::AlreadyExists { .. } => CoreError::AlreadyExists {
            kind: "namespace",
            id: name.to_string(),
        },
        other => other,
    })?;

    Ok(record)
}

/// Get a namespace by name.
pub async fn get_namespace(pool: &PgPool, name: &str) -> Result<Option<NamespaceRecord>, CoreError> {
    let record =
        sqlx::query_as::<_, NamespaceRecord>("SELECT name, created_at FROM namespaces WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await?;

    Ok(record)
}

/// List namespaces ordered by name.
pub async fn list_namespaces(pool: &PgPool, page: Page) -> Result<Vec<NamespaceRecord>, CoreError> {
    let records = sqlx::query_as::<_, NamespaceRecord>(
        r#"
        SELECT name, created_at FROM namespaces
        ORDER BY name
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit(page))
    .bind(page.offset)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Delete a namespace with its workflows, instances, listeners, timers and variables.
pub async fn delete_namespace(pool: &PgPool, name: &str) -> Result<(), CoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        DELETE FROM variables
        WHERE (scope = 'namespace' AND scope_id = $1)
           OR (scope = 'workflow' AND scope_id IN (SELECT id::text FROM workflows WHERE namespace = $1))
           OR (scope = 'instance' AND scope_id IN (SELECT id FROM instances WHERE namespace = $1))
        "#,
    )
    .bind(name)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        DELETE FROM timers
        WHERE name LIKE $1 ESCAPE '\'
           OR name IN (SELECT 'cron:' || id::text FROM workflows WHERE namespace = $2)
        "#,
    )
    .bind(like_prefix(&format!("{}/", name)))
    .bind(name)
    .execute(&mut *tx)
    .await?;

    let result = sqlx::query("DELETE FROM namespaces WHERE name = $1")
        .bind(name)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::not_found("namespace", name));
    }

    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Workflow Operations
// ============================================================================

const WORKFLOW_COLUMNS: &str = "id, namespace, name, revision, active, document, description, \
                                log_to_events, created_at, updated_at";

/// Create a workflow at revision 1.
pub async fn create_workflow(
    pool: &PgPool,
    workflow: &NewWorkflow,
) -> Result<WorkflowRecord, CoreError> {
    let mut tx = pool.begin().await?;

    let record = sqlx::query_as::<_, WorkflowRecord>(&format!(
        r#"
        INSERT INTO workflows (id, namespace, name, revision, active, document, description,
                               log_to_events, created_at, updated_at)
        VALUES ($1, $2, $3, 1, $4, $5, $6, $7, NOW(), NOW())
        RETURNING {WORKFLOW_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(&workflow.namespace)
    .bind(&workflow.name)
    .bind(workflow.active)
    .bind(&workflow.document)
    .bind(&workflow.description)
    .bind(workflow.log_to_events)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| match CoreError::from(e) {
        CoreError::AlreadyExists { .. } => CoreError::AlreadyExists {
            kind: "workflow",
            id: format!("{}/{}", workflow.namespace, workflow.name),
        },
        other => other,
    })?;

    insert_revision(&mut tx, record.id, record.revision, &record.document).await?;

    tx.commit().await?;
    Ok(record)
}

async fn insert_revision(
    tx: &mut Transaction<'static, Postgres>,
    workflow_id: Uuid,
    revision: i32,
    document: &[u8],
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_revisions (workflow_id, revision, document, created_at)
        VALUES ($1, $2, $3, NOW())
        "#,
    )
    .bind(workflow_id)
    .bind(revision)
    .bind(document)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Get a workflow by id.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<Option<WorkflowRecord>, CoreError> {
    let record = sqlx::query_as::<_, WorkflowRecord>(&format!(
        "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Get a workflow by namespace and name.
pub async fn get_workflow_by_name(
    pool: &PgPool,
    namespace: &str,
    name: &str,
) -> Result<Option<WorkflowRecord>, CoreError> {
    let record = sqlx::query_as::<_, WorkflowRecord>(&format!(
        "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE namespace = $1 AND name = $2"
    ))
    .bind(namespace)
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List the workflows of a namespace ordered by name.
pub async fn list_workflows(
    pool: &PgPool,
    namespace: &str,
    page: Page,
) -> Result<Vec<WorkflowRecord>, CoreError> {
    let records = sqlx::query_as::<_, WorkflowRecord>(&format!(
        r#"
        SELECT {WORKFLOW_COLUMNS} FROM workflows
        WHERE namespace = $1
        ORDER BY name
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(namespace)
    .bind(limit(page))
    .bind(page.offset)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Update a workflow, bumping its revision and storing a snapshot.
pub async fn update_workflow(
    pool: &PgPool,
    id: Uuid,
    expected_revision: Option<i32>,
    update: &WorkflowUpdate,
) -> Result<WorkflowRecord, CoreError> {
    let mut tx = pool.begin().await?;

    let current: Option<i32> =
        sqlx::query_scalar("SELECT revision FROM workflows WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

    let Some(current) = current else {
        return Err(CoreError::not_found("workflow", id.to_string()));
    };

    if let Some(expected) = expected_revision
        && expected != current
    {
        return Err(CoreError::AlreadyUpdated {
            workflow_id: id.to_string(),
            expected,
            actual: current,
        });
    }

    let record = sqlx::query_as::<_, WorkflowRecord>(&format!(
        r#"
        UPDATE workflows
        SET revision = revision + 1,
            document = COALESCE($2, document),
            description = COALESCE($3, description),
            active = COALESCE($4, active),
            log_to_events = COALESCE($5, log_to_events),
            updated_at = NOW()
        WHERE id = $1
        RETURNING {WORKFLOW_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(&update.document)
    .bind(&update.description)
    .bind(update.active)
    .bind(update.log_to_events)
    .fetch_one(&mut *tx)
    .await?;

    insert_revision(&mut tx, record.id, record.revision, &record.document).await?;

    tx.commit().await?;
    Ok(record)
}

/// Get the document stored for a workflow revision.
pub async fn get_workflow_revision(
    pool: &PgPool,
    id: Uuid,
    revision: i32,
) -> Result<Option<Vec<u8>>, CoreError> {
    let document = sqlx::query_scalar(
        "SELECT document FROM workflow_revisions WHERE workflow_id = $1 AND revision = $2",
    )
    .bind(id)
    .bind(revision)
    .fetch_optional(pool)
    .await?;

    Ok(document)
}

/// Delete a workflow and its cron timer and workflow variables.
pub async fn delete_workflow(pool: &PgPool, id: Uuid) -> Result<(), CoreError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM variables WHERE scope = 'workflow' AND scope_id = $1")
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

    sqlx::query("DELETE FROM timers WHERE name = $1")
        .bind(format!("cron:{}", id))
        .execute(&mut *tx)
        .await?;

    let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::not_found("workflow", id.to_string()));
    }

    tx.commit().await?;
    Ok(())
}

// ============================================================================
// Instance Operations
// ============================================================================

const INSTANCE_COLUMNS: &str = "id, namespace, workflow_id, workflow_name, revision, status, \
                                invoker, input, state_data, flow, memory, deadline, attempts, \
                                error_code, error_message, output, invoked_by, controller, \
                                begin_time, state_begin_time, end_time";

/// Create a pending instance.
pub async fn create_instance(
    pool: &PgPool,
    instance: &NewInstance,
) -> Result<InstanceRecord, CoreError> {
    let invoked_by = instance
        .invoked_by
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    let record = sqlx::query_as::<_, InstanceRecord>(&format!(
        r#"
        INSERT INTO instances (id, namespace, workflow_id, workflow_name, revision, status,
                               invoker, input, state_data, controller, invoked_by, begin_time)
        VALUES ($1, $2, $3, $4, $5, 'pending'::instance_status, $6, $7, $7, $8, $9, NOW())
        RETURNING {INSTANCE_COLUMNS}
        "#
    ))
    .bind(&instance.id)
    .bind(&instance.namespace)
    .bind(instance.workflow_id)
    .bind(&instance.workflow_name)
    .bind(instance.revision)
    .bind(&instance.invoker)
    .bind(&instance.input)
    .bind(&instance.controller)
    .bind(invoked_by)
    .fetch_one(pool)
    .await
    .map_err(|e| match CoreError::from(e) {
        CoreError::AlreadyExists { .. } => CoreError::AlreadyExists {
            kind: "instance",
            id: instance.id.clone(),
        },
        other => other,
    })?;

    Ok(record)
}

/// Get an instance by ID.
pub async fn get_instance(pool: &PgPool, id: &str) -> Result<Option<InstanceRecord>, CoreError> {
    let record = sqlx::query_as::<_, InstanceRecord>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List the instances of a namespace, newest first.
pub async fn list_instances(
    pool: &PgPool,
    namespace: &str,
    page: Page,
) -> Result<Vec<InstanceRecord>, CoreError> {
    let records = sqlx::query_as::<_, InstanceRecord>(&format!(
        r#"
        SELECT {INSTANCE_COLUMNS} FROM instances
        WHERE namespace = $1
        ORDER BY begin_time DESC, id
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(namespace)
    .bind(limit(page))
    .bind(page.offset)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Persist the mutable fields of an instance.
pub async fn save_instance(pool: &PgPool, instance: &InstanceRecord) -> Result<(), CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE instances
        SET status = $2,
            state_data = $3,
            flow = $4,
            memory = $5,
            deadline = $6,
            attempts = $7,
            error_code = $8,
            error_message = $9,
            output = $10,
            controller = $11,
            state_begin_time = $12,
            end_time = $13
        WHERE id = $1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(&instance.id)
    .bind(instance.status)
    .bind(&instance.state_data)
    .bind(&instance.flow)
    .bind(&instance.memory)
    .bind(instance.deadline)
    .bind(instance.attempts)
    .bind(&instance.error_code)
    .bind(&instance.error_message)
    .bind(&instance.output)
    .bind(&instance.controller)
    .bind(instance.state_begin_time)
    .bind(instance.end_time)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        let status: Option<InstanceStatus> =
            sqlx::query_scalar("SELECT status FROM instances WHERE id = $1")
                .bind(&instance.id)
                .fetch_optional(pool)
                .await?;
        return Err(match status {
            Some(status) => CoreError::InvalidInstanceState {
                instance_id: instance.id.clone(),
                expected: "active".to_string(),
                actual: status.to_string(),
            },
            None => CoreError::not_found("instance", &instance.id),
        });
    }

    Ok(())
}

/// Count instances created in a namespace since a point in time.
pub async fn count_instances_since(
    pool: &PgPool,
    namespace: &str,
    since: DateTime<Utc>,
) -> Result<i64, CoreError> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM instances WHERE namespace = $1 AND begin_time >= $2")
            .bind(namespace)
            .bind(since)
            .fetch_one(pool)
            .await?;

    Ok(count)
}

/// Cancel an active instance inside a transaction.
pub async fn cancel_instance(
    pool: &PgPool,
    id: &str,
    code: &str,
    message: &str,
) -> Result<Option<CancelledInstance>, CoreError> {
    let mut tx = begin_serializable(pool).await?;

    let status: Option<InstanceStatus> =
        sqlx::query_scalar("SELECT status FROM instances WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

    let Some(status) = status else {
        return Err(CoreError::not_found("instance", id));
    };

    if !status.is_active() {
        return Ok(None);
    }

    let record = sqlx::query_as::<_, InstanceRecord>(&format!(
        r#"
        UPDATE instances
        SET status = 'cancelled'::instance_status,
            error_code = $2,
            error_message = $3,
            deadline = NULL,
            end_time = NOW()
        WHERE id = $1
        RETURNING {INSTANCE_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(code)
    .bind(message)
    .fetch_one(&mut *tx)
    .await?;

    let timers: Vec<String> =
        sqlx::query_scalar("DELETE FROM timers WHERE name LIKE $1 ESCAPE '\\' RETURNING name")
            .bind(like_prefix(id))
            .fetch_all(&mut *tx)
            .await?;
    let listeners = sqlx::query("DELETE FROM event_listeners WHERE instance_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    Ok(Some(CancelledInstance {
        instance: record,
        timers,
        listeners,
    }))
}

/// Instances last stepped by `controller` that have the given status.
pub async fn list_instances_by_controller(
    pool: &PgPool,
    controller: &str,
    status: InstanceStatus,
) -> Result<Vec<InstanceRecord>, CoreError> {
    let records = sqlx::query_as::<_, InstanceRecord>(&format!(
        r#"
        SELECT {INSTANCE_COLUMNS} FROM instances
        WHERE controller = $1 AND status = $2
        ORDER BY begin_time
        "#
    ))
    .bind(controller)
    .bind(status)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Timer Operations
// ============================================================================

const TIMER_COLUMNS: &str =
    "id, name, handler, cron, one_shot, payload, last_fired, enabled, created_at";

/// Insert a timer, replacing any timer of the same name.
pub async fn upsert_timer(pool: &PgPool, timer: &NewTimer) -> Result<TimerRecord, CoreError> {
    let record = sqlx::query_as::<_, TimerRecord>(&format!(
        r#"
        INSERT INTO timers (id, name, handler, cron, one_shot, payload, enabled, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, TRUE, NOW())
        ON CONFLICT (name) DO UPDATE
        SET id = EXCLUDED.id,
            handler = EXCLUDED.handler,
            cron = EXCLUDED.cron,
            one_shot = EXCLUDED.one_shot,
            payload = EXCLUDED.payload,
            last_fired = NULL,
            enabled = TRUE,
            created_at = NOW()
        RETURNING {TIMER_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(&timer.name)
    .bind(&timer.handler)
    .bind(&timer.cron)
    .bind(timer.one_shot)
    .bind(&timer.payload)
    .fetch_one(pool)
    .await?;

    Ok(record)
}

/// Get a timer by name.
pub async fn get_timer(pool: &PgPool, name: &str) -> Result<Option<TimerRecord>, CoreError> {
    let record = sqlx::query_as::<_, TimerRecord>(&format!(
        "SELECT {TIMER_COLUMNS} FROM timers WHERE name = $1"
    ))
    .bind(name)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Get a timer by id.
pub async fn get_timer_by_id(pool: &PgPool, id: Uuid) -> Result<Option<TimerRecord>, CoreError> {
    let record = sqlx::query_as::<_, TimerRecord>(&format!(
        "SELECT {TIMER_COLUMNS} FROM timers WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// List all timers.
pub async fn list_timers(pool: &PgPool) -> Result<Vec<TimerRecord>, CoreError> {
    let records = sqlx::query_as::<_, TimerRecord>(&format!(
        "SELECT {TIMER_COLUMNS} FROM timers ORDER BY name"
    ))
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Delete a timer by name.
pub async fn delete_timer(pool: &PgPool, name: &str) -> Result<bool, CoreError> {
    let result = sqlx::query("DELETE FROM timers WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete all timers whose name starts with `prefix`.
pub async fn delete_timers_with_prefix(pool: &PgPool, prefix: &str) -> Result<Vec<String>, CoreError> {
    let names = sqlx::query_scalar("DELETE FROM timers WHERE name LIKE $1 ESCAPE '\\' RETURNING name")
        .bind(like_prefix(prefix))
        .fetch_all(pool)
        .await?;

    Ok(names)
}

/// Record the tick a timer last fired for.
pub async fn set_timer_last_fired(
    pool: &PgPool,
    name: &str,
    at: DateTime<Utc>,
) -> Result<(), CoreError> {
    sqlx::query("UPDATE timers SET last_fired = $2 WHERE name = $1")
        .bind(name)
        .bind(at)
        .execute(pool)
        .await?;

    Ok(())
}

/// Enable or disable a timer.
pub async fn set_timer_enabled(pool: &PgPool, name: &str, enabled: bool) -> Result<bool, CoreError> {
    let result = sqlx::query("UPDATE timers SET enabled = $2 WHERE name = $1")
        .bind(name)
        .bind(enabled)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Delete one-shot timers due before `before`.
pub async fn delete_overdue_one_shots(
    pool: &PgPool,
    before: DateTime<Utc>,
) -> Result<Vec<String>, CoreError> {
    let names = sqlx::query_scalar(
        "DELETE FROM timers WHERE one_shot IS NOT NULL AND one_shot < $1 RETURNING name",
    )
    .bind(before)
    .fetch_all(pool)
    .await?;

    Ok(names)
}

// ============================================================================
// Event Listener Operations
// ============================================================================

const LISTENER_COLUMNS: &str = "id, namespace, workflow_id, instance_id, events, correlation, \
                                event_count, signature, lifespan_secs, created_at";

/// Register an event listener.
pub async fn create_listener(pool: &PgPool, listener: &EventListenerRecord) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO event_listeners (id, namespace, workflow_id, instance_id, events,
                                     correlation, event_count, signature, lifespan_secs, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(listener.id)
    .bind(&listener.namespace)
    .bind(listener.workflow_id)
    .bind(&listener.instance_id)
    .bind(&listener.events)
    .bind(&listener.correlation)
    .bind(listener.event_count)
    .bind(&listener.signature)
    .bind(listener.lifespan_secs)
    .bind(listener.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a listener by id.
pub async fn get_listener(pool: &PgPool, id: Uuid) -> Result<Option<EventListenerRecord>, CoreError> {
    let record = sqlx::query_as::<_, EventListenerRecord>(&format!(
        "SELECT {LISTENER_COLUMNS} FROM event_listeners WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

/// Listeners of a namespace with a template for `event_type`.
pub async fn find_listeners(
    pool: &PgPool,
    namespace: &str,
    event_type: &str,
) -> Result<Vec<EventListenerRecord>, CoreError> {
    let records = sqlx::query_as::<_, EventListenerRecord>(&format!(
        r#"
        SELECT {LISTENER_COLUMNS} FROM event_listeners
        WHERE namespace = $1
          AND events @> jsonb_build_array(jsonb_build_object('type', $2::text))
        ORDER BY created_at, id
        "#
    ))
    .bind(namespace)
    .bind(event_type)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Delete a listener and its waits.
pub async fn delete_listener(pool: &PgPool, id: Uuid) -> Result<(), CoreError> {
    sqlx::query("DELETE FROM event_listeners WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Delete every listener owned by an instance.
pub async fn delete_instance_listeners(pool: &PgPool, instance_id: &str) -> Result<u64, CoreError> {
    let result = sqlx::query("DELETE FROM event_listeners WHERE instance_id = $1")
        .bind(instance_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Delete the start listeners of a workflow.
pub async fn delete_start_listeners(pool: &PgPool, workflow_id: Uuid) -> Result<u64, CoreError> {
    let result =
        sqlx::query("DELETE FROM event_listeners WHERE workflow_id = $1 AND instance_id IS NULL")
            .bind(workflow_id)
            .execute(pool)
            .await?;

    Ok(result.rows_affected())
}

/// Store an event in a correlation wait.
pub async fn store_event_wait(
    pool: &PgPool,
    listener_id: Uuid,
    slot: &str,
    slots: &[String],
    event: &str,
    expire_before: Option<DateTime<Utc>>,
) -> Result<Option<HashMap<String, String>>, CoreError> {
    let mut tx = pool.begin().await?;

    if let Some(before) = expire_before {
        sqlx::query("DELETE FROM event_waits WHERE listener_id = $1 AND created_at < $2")
            .bind(listener_id)
            .bind(before)
            .execute(&mut *tx)
            .await?;
    }

    let open: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM event_waits
        WHERE listener_id = $1
          AND (events ->> $2) IS NULL
          AND $3::text[] @> ARRAY(SELECT jsonb_object_keys(events))
        ORDER BY created_at, id
        LIMIT 1
        FOR UPDATE
        "#,
    )
    .bind(listener_id)
    .bind(slot)
    .bind(slots)
    .fetch_optional(&mut *tx)
    .await?;

    let (wait_id, events): (Uuid, Value) = match open {
        Some(id) => {
            sqlx::query_as(
                r#"
                UPDATE event_waits
                SET events = jsonb_set(events, ARRAY[$2], to_jsonb($3::text))
                WHERE id = $1
                RETURNING id, events
                "#,
            )
            .bind(id)
            .bind(slot)
            .bind(event)
            .fetch_one(&mut *tx)
            .await?
        }
        None => {
            sqlx::query_as(
                r#"
                INSERT INTO event_waits (id, listener_id, events, created_at)
                VALUES ($1, $2, jsonb_build_object($3::text, $4::text), NOW())
                RETURNING id, events
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(listener_id)
            .bind(slot)
            .bind(event)
            .fetch_one(&mut *tx)
            .await?
        }
    };

    let filled: HashMap<String, String> = serde_json::from_value(events)?;
    let complete = slots.iter().all(|s| filled.contains_key(s));

    if complete {
        sqlx::query("DELETE FROM event_waits WHERE id = $1")
            .bind(wait_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(complete.then_some(filled))
}

// ============================================================================
// Instance Log Operations
// ============================================================================

/// Append a log line to an instance.
pub async fn append_instance_log(
    pool: &PgPool,
    instance_id: &str,
    namespace: &str,
    level: &str,
    message: &str,
) -> Result<(), CoreError> {
    sqlx::query(
        r#"
        INSERT INTO instance_logs (instance_id, namespace, level, message, created_at)
        VALUES ($1, $2, $3, $4, NOW())
        "#,
    )
    .bind(instance_id)
    .bind(namespace)
    .bind(level)
    .bind(message)
    .execute(pool)
    .await?;

    Ok(())
}

/// List the log lines of an instance in write order.
pub async fn list_instance_logs(
    pool: &PgPool,
    instance_id: &str,
    page: Page,
) -> Result<Vec<InstanceLogRecord>, CoreError> {
    let records = sqlx::query_as::<_, InstanceLogRecord>(
        r#"
        SELECT id, instance_id, namespace, level, message, created_at
        FROM instance_logs
        WHERE instance_id = $1
        ORDER BY id
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(instance_id)
    .bind(limit(page))
    .bind(page.offset)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Check database connectivity.
pub async fn health_check_db(pool: &PgPool) -> Result<(), CoreError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn create_namespace(&self, name: &str) -> Result<NamespaceRecord, CoreError> {
        create_namespace(&self.pool, name).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>, CoreError> {
        get_namespace(&self.pool, name).await
    }

    async fn list_namespaces(&self, page: Page) -> Result<Vec<NamespaceRecord>, CoreError> {
        list_namespaces(&self.pool, page).await
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), CoreError> {
        delete_namespace(&self.pool, name).await
    }

    async fn create_workflow(&self, workflow: &NewWorkflow) -> Result<WorkflowRecord, CoreError> {
        create_workflow(&self.pool, workflow).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRecord>, CoreError> {
        get_workflow(&self.pool, id).await
    }

    async fn get_workflow_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<WorkflowRecord>, CoreError> {
        get_workflow_by_name(&self.pool, namespace, name).await
    }

    async fn list_workflows(
        &self,
        namespace: &str,
        page: Page,
    ) -> Result<Vec<WorkflowRecord>, CoreError> {
        list_workflows(&self.pool, namespace, page).await
    }

    async fn update_workflow(
        &self,
        id: Uuid,
        expected_revision: Option<i32>,
        update: &WorkflowUpdate,
    ) -> Result<WorkflowRecord, CoreError> {
        update_workflow(&self.pool, id, expected_revision, update).await
    }

    async fn get_workflow_revision(
        &self,
        id: Uuid,
        revision: i32,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        get_workflow_revision(&self.pool, id, revision).await
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), CoreError> {
        delete_workflow(&self.pool, id).await
    }

    async fn create_instance(&self, instance: &NewInstance) -> Result<InstanceRecord, CoreError> {
        create_instance(&self.pool, instance).await
    }

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        get_instance(&self.pool, id).await
    }

    async fn list_instances(
        &self,
        namespace: &str,
        page: Page,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        list_instances(&self.pool, namespace, page).await
    }

    async fn save_instance(&self, instance: &InstanceRecord) -> Result<(), CoreError> {
        save_instance(&self.pool, instance).await
    }

    async fn count_instances_since(
        &self,
        namespace: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        count_instances_since(&self.pool, namespace, since).await
    }

    async fn cancel_instance(
        &self,
        id: &str,
        code: &str,
        message: &str,
    ) -> Result<Option<CancelledInstance>, CoreError> {
        cancel_instance(&self.pool, id, code, message).await
    }

    async fn list_instances_by_controller(
        &self,
        controller: &str,
        status: InstanceStatus,
    ) -> Result<Vec<InstanceRecord>, CoreError> {
        list_instances_by_controller(&self.pool, controller, status).await
    }

    async fn upsert_timer(&self, timer: &NewTimer) -> Result<TimerRecord, CoreError> {
        upsert_timer(&self.pool, timer).await
    }

    async fn get_timer(&self, name: &str) -> Result<Option<TimerRecord>, CoreError> {
        get_timer(&self.pool, name).await
    }

    async fn get_timer_by_id(&self, id: Uuid) -> Result<Option<TimerRecord>, CoreError> {
        get_timer_by_id(&self.pool, id).await
    }

    async fn list_timers(&self) -> Result<Vec<TimerRecord>, CoreError> {
        list_timers(&self.pool).await
    }

    async fn delete_timer(&self, name: &str) -> Result<bool, CoreError> {
        delete_timer(&self.pool, name).await
    }

    async fn delete_timers_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CoreError> {
        delete_timers_with_prefix(&self.pool, prefix).await
    }

    async fn set_timer_last_fired(
        &self,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        set_timer_last_fired(&self.pool, name, at).await
    }

    async fn set_timer_enabled(&self, name: &str, enabled: bool) -> Result<bool, CoreError> {
        set_timer_enabled(&self.pool, name, enabled).await
    }

    async fn delete_overdue_one_shots(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>, CoreError> {
        delete_overdue_one_shots(&self.pool, before).await
    }

    async fn create_listener(&self, listener: &EventListenerRecord) -> Result<(), CoreError> {
        create_listener(&self.pool, listener).await
    }

    async fn get_listener(&self, id: Uuid) -> Result<Option<EventListenerRecord>, CoreError> {
        get_listener(&self.pool, id).await
    }

    async fn find_listeners(
        &self,
        namespace: &str,
        event_type: &str,
    ) -> Result<Vec<EventListenerRecord>, CoreError> {
        find_listeners(&self.pool, namespace, event_type).await
    }

    async fn delete_listener(&self, id: Uuid) -> Result<(), CoreError> {
        delete_listener(&self.pool, id).await
    }

    async fn delete_instance_listeners(&self, instance_id: &str) -> Result<u64, CoreError> {
        delete_instance_listeners(&self.pool, instance_id).await
    }

    async fn delete_start_listeners(&self, workflow_id: Uuid) -> Result<u64, CoreError> {
        delete_start_listeners(&self.pool, workflow_id).await
    }

    async fn store_event_wait(
        &self,
        listener_id: Uuid,
        slot: &str,
        slots: &[String],
        event: &str,
        expire_before: Option<DateTime<Utc>>,
    ) -> Result<Option<HashMap<String, String>>, CoreError> {
        store_event_wait(&self.pool, listener_id, slot, slots, event, expire_before).await
    }

    async fn append_instance_log(
        &self,
        instance_id: &str,
        namespace: &str,
        level: &str,
        message: &str,
    ) -> Result<(), CoreError> {
        append_instance_log(&self.pool, instance_id, namespace, level, message).await
    }

    async fn list_instance_logs(
        &self,
        instance_id: &str,
        page: Page,
    ) -> Result<Vec<InstanceLogRecord>, CoreError> {
        list_instance_logs(&self.pool, instance_id, page).await
    }

    async fn health_check(&self) -> Result<(), CoreError> {
        health_check_db(&self.pool).await
    }
}
