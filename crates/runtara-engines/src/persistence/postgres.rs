// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Storage access is written as free functions over a [`PgPool`];
//! [`PostgresStore`] delegates the [`StateStore`] contract to them.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use super::{
    Deployment, StateColumns, StateQuery, StateQueryResult, StateRow, StateStore, StorageError,
};
use crate::snapshot::{ExecutionState, ExecutionStatus};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new Postgres-backed store from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to a Postgres URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| StorageError::Database {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;

        crate::migrations::run_postgres(&pool)
            .await
            .map_err(|e| StorageError::Database {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// State Operations
// ============================================================================

const SELECT_STATUS: &str = r#"
    SELECT token, name, sequence_number, expire_at, business_key, caller,
           state, activity_status, postponed
    FROM execution_states
"#;

/// Insert or replace an execution state.
pub async fn upsert_state(pool: &PgPool, state: &ExecutionState) -> Result<(), StorageError> {
    let columns = StateColumns::from_state(state)?;
    let status = &state.status;

    sqlx::query(
        r#"
        INSERT INTO execution_states (
            token, name, sequence_number, expire_at, business_key, caller,
            caller_token, caller_activity_id, caller_execution_id,
            state, activity_status, postponed, engine
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        ON CONFLICT (token) DO UPDATE SET
            name = EXCLUDED.name,
            sequence_number = EXCLUDED.sequence_number,
            expire_at = EXCLUDED.expire_at,
            business_key = EXCLUDED.business_key,
            caller = EXCLUDED.caller,
            caller_token = EXCLUDED.caller_token,
            caller_activity_id = EXCLUDED.caller_activity_id,
            caller_execution_id = EXCLUDED.caller_execution_id,
            state = EXCLUDED.state,
            activity_status = EXCLUDED.activity_status,
            postponed = EXCLUDED.postponed,
            engine = EXCLUDED.engine,
            updated_at = NOW()
        "#,
    )
    .bind(&columns.token)
    .bind(&status.name)
    .bind(columns.sequence_number)
    .bind(status.expire_at)
    .bind(&status.business_key)
    .bind(&columns.caller)
    .bind(&columns.caller_token)
    .bind(&columns.caller_activity_id)
    .bind(&columns.caller_execution_id)
    .bind(status.state.as_str())
    .bind(status.activity_status.as_str())
    .bind(&columns.postponed)
    .bind(&columns.engine)
    .execute(pool)
    .await?;

    Ok(())
}

/// Replace an existing execution state. Fails with NotFound when absent.
pub async fn update_state(pool: &PgPool, state: &ExecutionState) -> Result<(), StorageError> {
    let columns = StateColumns::from_state(state)?;
    let status = &state.status;

    let result = sqlx::query(
        r#"
        UPDATE execution_states
        SET name = $2,
            sequence_number = $3,
            expire_at = $4,
            business_key = $5,
            caller = $6,
            caller_token = $7,
            caller_activity_id = $8,
            caller_execution_id = $9,
            state = $10,
            activity_status = $11,
            postponed = $12,
            engine = $13,
            updated_at = NOW()
        WHERE token = $1
        "#,
    )
    .bind(&columns.token)
    .bind(&status.name)
    .bind(columns.sequence_number)
    .bind(status.expire_at)
    .bind(&status.business_key)
    .bind(&columns.caller)
    .bind(&columns.caller_token)
    .bind(&columns.caller_activity_id)
    .bind(&columns.caller_execution_id)
    .bind(status.state.as_str())
    .bind(status.activity_status.as_str())
    .bind(&columns.postponed)
    .bind(&columns.engine)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound { key: columns.token });
    }

    Ok(())
}

/// Get the full state of an execution.
pub async fn fetch_state(
    pool: &PgPool,
    token: Uuid,
) -> Result<Option<ExecutionState>, StorageError> {
    let row = sqlx::query_as::<_, StateRow>(
        r#"
        SELECT token, name, sequence_number, expire_at, business_key, caller,
               state, activity_status, postponed, engine
        FROM execution_states
        WHERE token = $1
        "#,
    )
    .bind(token.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(StateRow::into_state).transpose()
}

/// Get the status of an execution without its recovery payload.
pub async fn fetch_status(
    pool: &PgPool,
    token: Uuid,
) -> Result<Option<ExecutionStatus>, StorageError> {
    let query = format!("{} WHERE token = $1", SELECT_STATUS);
    let row = sqlx::query_as::<_, StateRow>(&query)
        .bind(token.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(StateRow::into_status).transpose()
}

/// Delete an execution state.
pub async fn delete_state(pool: &PgPool, token: Uuid) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM execution_states WHERE token = $1")
        .bind(token.to_string())
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Query execution statuses with optional filters.
pub async fn query_states(
    pool: &PgPool,
    query: &StateQuery,
) -> Result<StateQueryResult, StorageError> {
    let state = query.state.map(|s| s.as_str());
    let caller_token = query.caller.as_ref().map(|c| c.token.to_string());
    let caller_activity_id = query.caller.as_ref().and_then(|c| c.activity_id.clone());
    let caller_execution_id = query.caller.as_ref().and_then(|c| c.execution_id.clone());

    let filter = r#"
        WHERE ($1::TEXT IS NULL OR state = $1)
          AND ($2::TEXT IS NULL OR name = $2)
          AND ($3::TEXT IS NULL OR caller_token = $3)
          AND ($4::TEXT IS NULL OR caller_activity_id = $4)
          AND ($5::TEXT IS NULL OR caller_execution_id = $5)
    "#;

    let select = format!(
        "{} {} ORDER BY created_at ASC, token ASC LIMIT $6 OFFSET $7",
        SELECT_STATUS, filter
    );
    let rows = sqlx::query_as::<_, StateRow>(&select)
        .bind(state)
        .bind(&query.name)
        .bind(&caller_token)
        .bind(&caller_activity_id)
        .bind(&caller_execution_id)
        .bind(query.page_size())
        .bind(query.offset)
        .fetch_all(pool)
        .await?;

    let count = format!("SELECT COUNT(*) FROM execution_states {}", filter);
    let total: (i64,) = sqlx::query_as(&count)
        .bind(state)
        .bind(&query.name)
        .bind(&caller_token)
        .bind(&caller_activity_id)
        .bind(&caller_execution_id)
        .fetch_one(pool)
        .await?;

    let records = rows
        .into_iter()
        .map(StateRow::into_status)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StateQueryResult {
        records,
        total: total.0,
    })
}

// ============================================================================
// Deployment Operations
// ============================================================================

/// Insert or replace a deployment.
pub async fn upsert_deployment(pool: &PgPool, deployment: &Deployment) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT INTO deployments (name, source)
        VALUES ($1, $2)
        ON CONFLICT (name) DO UPDATE SET
            source = EXCLUDED.source,
            updated_at = NOW()
        "#,
    )
    .bind(&deployment.name)
    .bind(&deployment.source)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a deployment by name.
pub async fn fetch_deployment(
    pool: &PgPool,
    name: &str,
) -> Result<Option<Deployment>, StorageError> {
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT name, source FROM deployments WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(|(name, source)| Deployment { name, source }))
}

#[async_trait::async_trait]
impl StateStore for PostgresStore {
    async fn upsert_state(&self, state: &ExecutionState) -> Result<(), StorageError> {
        upsert_state(&self.pool, state).await
    }

    async fn update_state(&self, state: &ExecutionState) -> Result<(), StorageError> {
        update_state(&self.pool, state).await
    }

    async fn fetch_state(&self, token: Uuid) -> Result<Option<ExecutionState>, StorageError> {
        fetch_state(&self.pool, token).await
    }

    async fn fetch_status(&self, token: Uuid) -> Result<Option<ExecutionStatus>, StorageError> {
        fetch_status(&self.pool, token).await
    }

    async fn delete_state(&self, token: Uuid) -> Result<bool, StorageError> {
        delete_state(&self.pool, token).await
    }

    async fn query_states(&self, query: &StateQuery) -> Result<StateQueryResult, StorageError> {
        query_states(&self.pool, query).await
    }

    async fn upsert_deployment(&self, deployment: &Deployment) -> Result<(), StorageError> {
        upsert_deployment(&self.pool, deployment).await
    }

    async fn fetch_deployment(&self, name: &str) -> Result<Option<Deployment>, StorageError> {
        fetch_deployment(&self.pool, name).await
    }

    async fn health_check(&self) -> Result<bool, StorageError> {
        let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
