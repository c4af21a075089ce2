//! SQLite-backed persistence implementation.

use std::path::Path;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use super::{
    Deployment, StateColumns, StateQuery, StateQueryResult, StateRow, StateStore, StorageError,
};
use crate::snapshot::{ExecutionState, ExecutionStatus};

const STATUS_COLUMNS: &str = "token, name, sequence_number, expire_at, business_key, caller, \
                              state, activity_status, postponed";

/// SQLite-backed storage adapter.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| StorageError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| StorageError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Create and initialize a SQLite store from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/engines.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl StateStore for SqliteStore {
    async fn upsert_state(&self, state: &ExecutionState) -> Result<(), StorageError> {
        let columns = StateColumns::from_state(state)?;
        let status = &state.status;

        sqlx::query(
            r#"
            INSERT INTO execution_states (
                token, name, sequence_number, expire_at, business_key, caller,
                caller_token, caller_activity_id, caller_execution_id,
                state, activity_status, postponed, engine
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT (token) DO UPDATE SET
                name = excluded.name,
                sequence_number = excluded.sequence_number,
                expire_at = excluded.expire_at,
                business_key = excluded.business_key,
                caller = excluded.caller,
                caller_token = excluded.caller_token,
                caller_activity_id = excluded.caller_activity_id,
                caller_execution_id = excluded.caller_execution_id,
                state = excluded.state,
                activity_status = excluded.activity_status,
                postponed = excluded.postponed,
                engine = excluded.engine,
                updated_at = CURRENT_TIMESTAMP
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
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_state(&self, state: &ExecutionState) -> Result<(), StorageError> {
        let columns = StateColumns::from_state(state)?;
        let status = &state.status;

        let result = sqlx::query(
            r#"
            UPDATE execution_states
            SET name = ?2,
                sequence_number = ?3,
                expire_at = ?4,
                business_key = ?5,
                caller = ?6,
                caller_token = ?7,
                caller_activity_id = ?8,
                caller_execution_id = ?9,
                state = ?10,
                activity_status = ?11,
                postponed = ?12,
                engine = ?13,
                updated_at = CURRENT_TIMESTAMP
            WHERE token = ?1
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
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound { key: columns.token });
        }

        Ok(())
    }

    async fn fetch_state(&self, token: Uuid) -> Result<Option<ExecutionState>, StorageError> {
        let query = format!(
            "SELECT {}, engine FROM execution_states WHERE token = ?",
            STATUS_COLUMNS
        );
        let row = sqlx::query_as::<_, StateRow>(&query)
            .bind(token.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(StateRow::into_state).transpose()
    }

    async fn fetch_status(&self, token: Uuid) -> Result<Option<ExecutionStatus>, StorageError> {
        let query = format!(
            "SELECT {} FROM execution_states WHERE token = ?",
            STATUS_COLUMNS
        );
        let row = sqlx::query_as::<_, StateRow>(&query)
            .bind(token.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(StateRow::into_status).transpose()
    }

    async fn delete_state(&self, token: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM execution_states WHERE token = ?")
            .bind(token.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn query_states(&self, query: &StateQuery) -> Result<StateQueryResult, StorageError> {
        let state = query.state.map(|s| s.as_str());
        let caller_token = query.caller.as_ref().map(|c| c.token.to_string());
        let caller_activity_id = query.caller.as_ref().and_then(|c| c.activity_id.clone());
        let caller_execution_id = query.caller.as_ref().and_then(|c| c.execution_id.clone());

        let filter = r#"
            WHERE (?1 IS NULL OR state = ?1)
              AND (?2 IS NULL OR name = ?2)
              AND (?3 IS NULL OR caller_token = ?3)
              AND (?4 IS NULL OR caller_activity_id = ?4)
              AND (?5 IS NULL OR caller_execution_id = ?5)
        "#;

        let select = format!(
            "SELECT {} FROM execution_states {} ORDER BY created_at ASC, token ASC LIMIT ?6 OFFSET ?7",
            STATUS_COLUMNS, filter
        );
        let rows = sqlx::query_as::<_, StateRow>(&select)
            .bind(state)
            .bind(&query.name)
            .bind(&caller_token)
            .bind(&caller_activity_id)
            .bind(&caller_execution_id)
            .bind(query.page_size())
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await?;

        let count = format!("SELECT COUNT(*) FROM execution_states {}", filter);
        let total: (i64,) = sqlx::query_as(&count)
            .bind(state)
            .bind(&query.name)
            .bind(&caller_token)
            .bind(&caller_activity_id)
            .bind(&caller_execution_id)
            .fetch_one(&self.pool)
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

    async fn upsert_deployment(&self, deployment: &Deployment) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO deployments (name, source)
            VALUES (?1, ?2)
            ON CONFLICT (name) DO UPDATE SET
                source = excluded.source,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&deployment.name)
        .bind(&deployment.source)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch_deployment(&self, name: &str) -> Result<Option<Deployment>, StorageError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT name, source FROM deployments WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(name, source)| Deployment { name, source }))
    }

    async fn health_check(&self) -> Result<bool, StorageError> {
        let result: Result<(i64,), _> = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}
