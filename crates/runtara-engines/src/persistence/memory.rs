//! In-memory persistence implementation.
//!
//! Process-local; useful for tests and single-process deployments. Clones
//! share the same underlying maps, so two managers built from clones of one
//! store behave like two processes sharing a database.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use super::{Deployment, StateQuery, StateQueryResult, StateStore, StorageError};
use crate::snapshot::{ExecutionState, ExecutionStatus};

#[derive(Default)]
struct Tables {
    states: HashMap<Uuid, ExecutionState>,
    deployments: HashMap<String, Deployment>,
}

/// In-memory storage adapter.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StorageError> {
        self.tables.read().map_err(|_| StorageError::Database {
            operation: "read".to_string(),
            details: "memory store lock poisoned".to_string(),
        })
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StorageError> {
        self.tables.write().map_err(|_| StorageError::Database {
            operation: "write".to_string(),
            details: "memory store lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn upsert_state(&self, state: &ExecutionState) -> Result<(), StorageError> {
        self.write()?.states.insert(state.token(), state.clone());
        Ok(())
    }

    async fn update_state(&self, state: &ExecutionState) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        match tables.states.get_mut(&state.token()) {
            Some(existing) => {
                *existing = state.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound {
                key: state.token().to_string(),
            }),
        }
    }

    async fn fetch_state(&self, token: Uuid) -> Result<Option<ExecutionState>, StorageError> {
        Ok(self.read()?.states.get(&token).cloned())
    }

    async fn fetch_status(&self, token: Uuid) -> Result<Option<ExecutionStatus>, StorageError> {
        Ok(self
            .read()?
            .states
            .get(&token)
            .map(|state| state.status.clone()))
    }

    async fn delete_state(&self, token: Uuid) -> Result<bool, StorageError> {
        Ok(self.write()?.states.remove(&token).is_some())
    }

    async fn query_states(&self, query: &StateQuery) -> Result<StateQueryResult, StorageError> {
        let tables = self.read()?;
        let mut matching: Vec<ExecutionStatus> = tables
            .states
            .values()
            .filter(|state| query.matches(&state.status))
            .map(|state| state.status.clone())
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name).then(a.token.cmp(&b.token)));

        let total = matching.len() as i64;
        let records = matching
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.page_size().max(0) as usize)
            .collect();

        Ok(StateQueryResult { records, total })
    }

    async fn upsert_deployment(&self, deployment: &Deployment) -> Result<(), StorageError> {
        self.write()?
            .deployments
            .insert(deployment.name.clone(), deployment.clone());
        Ok(())
    }

    async fn fetch_deployment(&self, name: &str) -> Result<Option<Deployment>, StorageError> {
        Ok(self.read()?.deployments.get(name).cloned())
    }
}
