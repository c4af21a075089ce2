// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtara Engines - Lifecycle Manager for Long-Lived BPMN Executions
//!
//! This crate decides when a process execution is held in memory, when it is
//! persisted, when it is reloaded and when it is suspended as idle. It also
//! coordinates child executions started by call activities with their
//! parents, across processes that share one durable store.
//!
//! The workflow interpreter itself is not part of this crate. It is plugged
//! in through the [`ProcessEngine`] and [`ProcessExecution`] traits.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────────────────────────────────┐
//!                │        HTTP / CLI layer (embedder)        │
//!                └────────────────────┬─────────────────────┘
//!                                     │
//!                                     ▼
//! ┌──────────────┐   start/cancel  ┌─────────────┐   get/set   ┌────────────────┐
//! │ Coordinator  │◄───────────────►│   Engines   │────────────►│ InstanceCache  │
//! │ (call acts.) │  signal/fail    │  (manager)  │             │   (LRU, stop   │
//! └──────┬───────┘                 └──────┬──────┘             │   on evict)    │
//!        ▲                                │ load/recover       └────────────────┘
//!        │ child ended/failed             ▼
//!        │                        ┌───────────────┐  events   ┌────────────────┐
//!        └────────────────────────│    Router     │◄──────────│ ProcessEngine  │
//!                                 │ (per instance)│           │  (opaque BPMN) │
//!                                 └──────┬────────┘           └────────────────┘
//!                                        │ upsert/update            ▲ stop
//!                                        ▼                          │
//!                                 ┌───────────────┐          ┌──────┴────────┐
//!                                 │  StateStore   │          │  Idle timer   │
//!                                 │ (shared, SQL) │          │ (per instance)│
//!                                 └───────────────┘          └───────────────┘
//! ```
//!
//! # Execution Lifecycle
//!
//! | Step | What happens |
//! |------|--------------|
//! | `create` | Engine builds an execution; nothing is cached or started |
//! | `run` | Cached, router attached, executed; idle timer started if running |
//! | events | Router bumps the sequence number, tracks timers, persists snapshots |
//! | idle | Idle timer stops a quiet execution; the router persists it |
//! | `resume` | Cached copy returned, or reconstructed from the snapshot |
//! | end/stop/error | Router tears down, persists, notifies, relays to the parent |
//!
//! ## Run States
//!
//! | State | Terminal | Description |
//! |-------|----------|-------------|
//! | `running` | No | Execution is live or suspended while waiting |
//! | `stopped` | No | Execution was stopped (idle, evicted, shutdown) and can be resumed |
//! | `idle` | Yes | Execution completed |
//! | `error` | Yes | Execution failed |
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `RUNTARA_ENGINES_DATABASE_URL` | No | in-memory | PostgreSQL or SQLite connection string |
//! | `RUNTARA_ENGINES_CACHE_CAPACITY` | No | `1000` | Maximum live instances per process |
//! | `RUNTARA_ENGINES_IDLE_TIMEOUT_MS` | No | `120000` | Idle timer delay |
//! | `RUNTARA_ENGINES_AUTOSAVE` | No | `true` | Persist on every routed event |
//! | `RUNTARA_ENGINES_RUN_TIMEOUT_MS` | No | `30000` | Deadline for synchronous runs |
//!
//! # Modules
//!
//! - [`engines`]: Instance manager (create, run, resume, signal, query)
//! - [`persistence`]: Storage adapter trait and memory/SQLite/PostgreSQL backends
//! - [`coordinator`]: Call-activity relay between parents and children
//! - [`runtime`]: Embeddable runtime wiring everything together

#![deny(missing_docs)]

/// In-memory registry of live executions with LRU eviction.
pub mod cache;

/// Reference from a child execution to the parent activity that started it.
pub mod caller;

/// Configuration loaded from environment variables.
pub mod config;

/// Call-activity coordinator.
pub mod coordinator;

/// Execution Engine contract.
pub mod engine;

/// Instance manager.
pub mod engines;

/// Error types with stable error codes.
pub mod error;

/// Idle detection for live executions.
pub mod idle_timer;

/// Live execution with its bookkeeping.
pub mod instance;

/// Embedded database migrations.
pub mod migrations;

/// Outbound lifecycle notifications.
pub mod notification;

/// Storage adapter trait and backends.
pub mod persistence;

/// Embeddable runtime.
pub mod runtime;

/// Execution status and snapshot records.
pub mod snapshot;

mod router;

pub use caller::{CallerFilter, CallerReference};
pub use config::{Config, ConfigError};
pub use coordinator::{CallTarget, Coordinator, CoordinatorEvent};
pub use engine::{
    ActivityInfo, ActivityRef, ActivityTarget, EngineError, EngineEvent, EngineEventSender,
    EngineMessage, ExecutionSettings, PendingTimer, ProcessEngine, ProcessExecution,
    ProcessSource,
};
pub use engines::{ActivityRequest, DeploymentOptions, Engines, ResumeOptions};
pub use error::{EnginesError, Result};
pub use instance::{ExecutionInstance, Instance, InstanceOptions};
pub use notification::{Listener, Notification};
pub use persistence::{
    Deployment, MemoryStore, PostgresStore, SqliteStore, StateQuery, StateQueryResult,
    StateStore, StorageError,
};
pub use runtime::{EnginesRuntime, EnginesRuntimeBuilder};
pub use snapshot::{ActivityStatus, ExecutionState, ExecutionStatus, PostponedActivity, RunState};
