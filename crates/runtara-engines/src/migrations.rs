// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema for the SQL state stores.
//!
//! Two tables: `execution_states` (one snapshot per token) and
//! `deployments` (definitions addressable by call activities).
//! [`SqliteStore::connect`](crate::SqliteStore::connect) and
//! [`PostgresStore::connect`](crate::PostgresStore::connect) apply these
//! automatically; call them directly when handing in an existing pool.
//!
//! ```ignore
//! let pool = sqlx::PgPool::connect(&database_url).await?;
//! runtara_engines::migrations::run_postgres(&pool).await?;
//! let store = runtara_engines::PostgresStore::new(pool);
//! ```

use sqlx::migrate::MigrateError;

/// PostgreSQL migrator with all execution-state migrations embedded.
pub static POSTGRES: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgresql");

/// SQLite migrator with all execution-state migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Bring a PostgreSQL schema up to date. Applied versions are skipped.
pub async fn run_postgres(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}

/// Bring a SQLite schema up to date.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
