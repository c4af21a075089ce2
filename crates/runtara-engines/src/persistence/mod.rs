// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for runtara-engines.
//!
//! The [`StateStore`] trait is the storage adapter contract. It is the only
//! resource shared between processes; the SQL backends are meant to be
//! pointed at the same database by every process of a deployment.

/// Process-local in-memory backend.
pub mod memory;
/// PostgreSQL backend.
pub mod postgres;
/// SQLite backend.
pub mod sqlite;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::caller::{CallerFilter, CallerReference};
use crate::snapshot::{
    ActivityStatus, ExecutionState, ExecutionStatus, PostponedActivity, RunState,
};

/// Storage adapter failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// Conditional update found no existing record.
    #[error("Record '{key}' not found")]
    NotFound {
        /// Key of the missing record.
        key: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A stored value could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether this is the "record not found" class.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// A deployed process definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Deployment name.
    pub name: String,
    /// Definition source.
    pub source: String,
}

impl Deployment {
    /// Create a deployment.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Filter options for querying execution states.
#[derive(Debug, Clone, Default)]
pub struct StateQuery {
    /// Filter by run state.
    pub state: Option<RunState>,
    /// Filter by deployment name.
    pub name: Option<String>,
    /// Filter by caller.
    pub caller: Option<CallerFilter>,
    /// Maximum number of records (default 100).
    pub limit: Option<i64>,
    /// Records to skip.
    pub offset: i64,
}

impl StateQuery {
    /// Default page size.
    pub const DEFAULT_LIMIT: i64 = 100;

    /// Query for running executions.
    pub fn running() -> Self {
        Self {
            state: Some(RunState::Running),
            ..Default::default()
        }
    }

    /// Restrict to children of a caller.
    pub fn with_caller(mut self, caller: CallerFilter) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Effective page size.
    pub fn page_size(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }

    /// Whether a status satisfies this query, ignoring paging.
    pub fn matches(&self, status: &ExecutionStatus) -> bool {
        self.state.is_none_or(|state| state == status.state)
            && self.name.as_deref().is_none_or(|name| name == status.name)
            && self.caller.as_ref().is_none_or(|filter| {
                status
                    .caller
                    .as_ref()
                    .is_some_and(|caller| filter.matches(caller))
            })
    }
}

/// Result of a state query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateQueryResult {
    /// Matching records for the requested page.
    pub records: Vec<ExecutionStatus>,
    /// Total matching records.
    pub total: i64,
}

/// Row shape shared by the SQL backends.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct StateRow {
    pub token: String,
    pub name: String,
    pub sequence_number: i64,
    pub expire_at: Option<DateTime<Utc>>,
    pub business_key: Option<String>,
    pub caller: Option<String>,
    pub state: String,
    pub activity_status: String,
    pub postponed: String,
    #[sqlx(default)]
    pub engine: Option<String>,
}

impl StateRow {
    pub(crate) fn into_status(self) -> Result<ExecutionStatus, StorageError> {
        let token = Uuid::parse_str(&self.token)
            .map_err(|e| StorageError::Serialization(format!("invalid token: {}", e)))?;
        let caller: Option<CallerReference> = match self.caller {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        let postponed: Vec<PostponedActivity> = serde_json::from_str(&self.postponed)?;

        Ok(ExecutionStatus {
            token,
            name: self.name,
            sequence_number: self.sequence_number.max(0) as u64,
            expire_at: self.expire_at,
            business_key: self.business_key,
            caller,
            state: self.state.parse().map_err(StorageError::Serialization)?,
            activity_status: self
                .activity_status
                .parse::<ActivityStatus>()
                .map_err(StorageError::Serialization)?,
            postponed,
        })
    }

    pub(crate) fn into_state(mut self) -> Result<ExecutionState, StorageError> {
        let engine = match self.engine.take() {
            Some(raw) => serde_json::from_str(&raw)?,
            None => serde_json::Value::Null,
        };
        Ok(ExecutionState {
            status: self.into_status()?,
            engine,
        })
    }
}

/// Column values shared by the SQL backends when writing a state.
pub(crate) struct StateColumns {
    pub token: String,
    pub sequence_number: i64,
    pub caller: Option<String>,
    pub caller_token: Option<String>,
    pub caller_activity_id: Option<String>,
    pub caller_execution_id: Option<String>,
    pub postponed: String,
    pub engine: String,
}

impl StateColumns {
    pub(crate) fn from_state(state: &ExecutionState) -> Result<Self, StorageError> {
        let status = &state.status;
        Ok(Self {
            token: status.token.to_string(),
            sequence_number: i64::try_from(status.sequence_number).map_err(|_| {
                StorageError::Serialization("sequence number out of range".to_string())
            })?,
            caller: status
                .caller
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            caller_token: status.caller.as_ref().map(|c| c.token.to_string()),
            caller_activity_id: status.caller.as_ref().map(|c| c.activity_id.clone()),
            caller_execution_id: status.caller.as_ref().map(|c| c.execution_id.clone()),
            postponed: serde_json::to_string(&status.postponed)?,
            engine: serde_json::to_string(&state.engine)?,
        })
    }
}

/// Storage adapter used by the instance manager.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace the state of an execution.
    async fn upsert_state(&self, state: &ExecutionState) -> Result<(), StorageError>;

    /// Replace the state of an existing execution.
    ///
    /// Fails with [`StorageError::NotFound`] when no record exists.
    async fn update_state(&self, state: &ExecutionState) -> Result<(), StorageError>;

    /// Fetch the full state including the engine recovery payload.
    async fn fetch_state(&self, token: Uuid) -> Result<Option<ExecutionState>, StorageError>;

    /// Fetch the status without the engine recovery payload.
    async fn fetch_status(&self, token: Uuid) -> Result<Option<ExecutionStatus>, StorageError>;

    /// Delete the state of an execution. Returns whether a record existed.
    async fn delete_state(&self, token: Uuid) -> Result<bool, StorageError>;

    /// Query execution statuses.
    async fn query_states(&self, query: &StateQuery) -> Result<StateQueryResult, StorageError>;

    /// Insert or replace a deployment.
    async fn upsert_deployment(&self, deployment: &Deployment) -> Result<(), StorageError>;

    /// Fetch a deployment by name.
    async fn fetch_deployment(&self, name: &str) -> Result<Option<Deployment>, StorageError>;

    /// Check storage connectivity.
    async fn health_check(&self) -> Result<bool, StorageError> {
        Ok(true)
    }
}
