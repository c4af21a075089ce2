// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::sync::Arc;
use std::time::Duration;

use crate::persistence::{MemoryStore, PostgresStore, SqliteStore, StateStore, StorageError};

/// Runtara Engines configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL. `None` means in-memory storage.
    pub database_url: Option<String>,
    /// Maximum number of live instances held in the cache
    pub cache_capacity: usize,
    /// Default idle timer delay
    pub idle_timeout: Duration,
    /// Default autosave flag for new instances
    pub autosave: bool,
    /// Default deadline for synchronous runs
    pub run_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            cache_capacity: 1000,
            idle_timeout: Duration::from_millis(120_000),
            autosave: true,
            run_timeout: Duration::from_millis(30_000),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `RUNTARA_ENGINES_DATABASE_URL`: PostgreSQL or SQLite connection string (default: in-memory)
    /// - `RUNTARA_ENGINES_CACHE_CAPACITY`: Instance cache capacity (default: 1000)
    /// - `RUNTARA_ENGINES_IDLE_TIMEOUT_MS`: Idle timer delay (default: 120000)
    /// - `RUNTARA_ENGINES_AUTOSAVE`: Autosave new instances (default: true)
    /// - `RUNTARA_ENGINES_RUN_TIMEOUT_MS`: Synchronous run deadline (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = std::env::var("RUNTARA_ENGINES_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let cache_capacity: usize = match std::env::var("RUNTARA_ENGINES_CACHE_CAPACITY") {
            Ok(raw) => raw.parse().ok().filter(|c| *c > 0).ok_or(ConfigError::Invalid(
                "RUNTARA_ENGINES_CACHE_CAPACITY",
                "must be a positive integer",
            ))?,
            Err(_) => defaults.cache_capacity,
        };

        let idle_timeout = duration_ms("RUNTARA_ENGINES_IDLE_TIMEOUT_MS", defaults.idle_timeout)?;
        let run_timeout = duration_ms("RUNTARA_ENGINES_RUN_TIMEOUT_MS", defaults.run_timeout)?;

        let autosave = match std::env::var("RUNTARA_ENGINES_AUTOSAVE") {
            Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "RUNTARA_ENGINES_AUTOSAVE",
                        "must be true or false",
                    ));
                }
            },
            Err(_) => defaults.autosave,
        };

        Ok(Self {
            database_url,
            cache_capacity,
            idle_timeout,
            autosave,
            run_timeout,
        })
    }

    /// Open the storage backend selected by `database_url`.
    ///
    /// `postgres://` and `postgresql://` URLs open a [`PostgresStore`],
    /// `sqlite:` URLs a [`SqliteStore`]; without a URL the store is in-memory.
    /// SQL stores run their migrations on connect.
    pub async fn open_store(&self) -> Result<Arc<dyn StateStore>, StorageError> {
        match self.database_url.as_deref() {
            None => Ok(Arc::new(MemoryStore::new())),
            Some(url) if url.starts_with("postgres://") || url.starts_with("postgresql://") => {
                Ok(Arc::new(PostgresStore::connect(url).await?))
            }
            Some(url) if url.starts_with("sqlite:") => Ok(Arc::new(SqliteStore::connect(url).await?)),
            Some(url) => Err(StorageError::Database {
                operation: "connect".to_string(),
                details: format!("unsupported database URL scheme: {}", url),
            }),
        }
    }
}

fn duration_ms(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::Invalid(var, "must be a number of milliseconds")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
