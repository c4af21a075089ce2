// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for runtara-engines.
//!
//! [`EnginesRuntime`] wires an Execution Engine, a storage adapter and the
//! call-activity coordinator together inside an existing tokio application.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use runtara_engines::persistence::SqliteStore;
//! use runtara_engines::runtime::EnginesRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteStore::from_path(".data/engines.db").await?);
//!
//!     let runtime = EnginesRuntime::builder()
//!         .engine(MyBpmnEngine::new())
//!         .persistence(store)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let engines = runtime.engines();
//!     // ... create, run, resume executions ...
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::engine::ProcessEngine;
use crate::engines::{Engines, millis};
use crate::persistence::StateStore;

/// Builder for creating an [`EnginesRuntime`].
pub struct EnginesRuntimeBuilder<E> {
    engine: Option<E>,
    persistence: Option<Arc<dyn StateStore>>,
    config: Config,
}

impl<E> std::fmt::Debug for EnginesRuntimeBuilder<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginesRuntimeBuilder")
            .field("engine", &self.engine.as_ref().map(|_| "..."))
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .finish()
    }
}

impl<E> Default for EnginesRuntimeBuilder<E> {
    fn default() -> Self {
        Self {
            engine: None,
            persistence: None,
            config: Config::default(),
        }
    }
}

impl<E: ProcessEngine> EnginesRuntimeBuilder<E> {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the Execution Engine (required).
    pub fn engine(mut self, engine: E) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the storage adapter.
    ///
    /// Default: opened from [`Config::database_url`] on start.
    pub fn persistence(mut self, persistence: Arc<dyn StateStore>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the configuration.
    ///
    /// Default: [`Config::default`]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EnginesRuntimeConfig<E>> {
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("engine is required"))?;

        if self.config.cache_capacity == 0 {
            anyhow::bail!("cache capacity must be positive");
        }

        Ok(EnginesRuntimeConfig {
            engine,
            persistence: self.persistence,
            config: self.config,
        })
    }
}

/// Configuration for an [`EnginesRuntime`].
pub struct EnginesRuntimeConfig<E> {
    engine: E,
    persistence: Option<Arc<dyn StateStore>>,
    config: Config,
}

impl<E> std::fmt::Debug for EnginesRuntimeConfig<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginesRuntimeConfig")
            .field("engine", &"...")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("config", &self.config)
            .finish()
    }
}

impl<E: ProcessEngine> EnginesRuntimeConfig<E> {
    /// Start the runtime, spawning the call-activity coordinator task.
    pub async fn start(self) -> Result<EnginesRuntime<E>> {
        let persistence = match self.persistence {
            Some(persistence) => persistence,
            None => self.config.open_store().await?,
        };

        let engines = Engines::new(self.engine, persistence, self.config);
        let coordinator = Coordinator::new(engines.clone());
        let shutdown = coordinator.shutdown_handle();
        let coordinator_handle = tokio::spawn(coordinator.run());

        info!(
            cache_capacity = engines.config().cache_capacity,
            idle_timeout_ms = millis(engines.config().idle_timeout),
            "EnginesRuntime started"
        );

        Ok(EnginesRuntime {
            engines,
            coordinator_handle,
            shutdown,
        })
    }
}

/// A running runtara-engines instance embedded in an application.
///
/// The runtime manages:
/// - the Instance Manager ([`Engines`])
/// - the call-activity coordinator task
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EnginesRuntime<E: ProcessEngine> {
    engines: Engines<E>,
    coordinator_handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl<E: ProcessEngine> EnginesRuntime<E> {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EnginesRuntimeBuilder<E> {
        EnginesRuntimeBuilder::new()
    }

    /// The Instance Manager.
    pub fn engines(&self) -> &Engines<E> {
        &self.engines
    }

    /// Check if the coordinator task is still running.
    pub fn is_running(&self) -> bool {
        !self.coordinator_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops every live execution, waits up to the configured run timeout
    /// for each to settle (and be persisted), then stops the coordinator.
    pub async fn shutdown(self) -> Result<()> {
        info!("EnginesRuntime shutting down...");

        let grace = self.engines.config().run_timeout;
        let instances = self.engines.live_instances();
        self.engines.stop_all();

        for instance in instances {
            let mut outcome = instance.outcome();
            let settled = tokio::time::timeout(grace, outcome.wait_for(Option::is_some))
                .await
                .is_ok();
            if !settled {
                warn!(token = %instance.token(), "Execution did not stop within grace period");
            }
        }

        self.shutdown.notify_one();

        match tokio::time::timeout(grace.max(Duration::from_secs(1)), self.coordinator_handle).await
        {
            Ok(Ok(())) => {
                info!("EnginesRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Coordinator task panicked: {}", e);
                Err(anyhow::anyhow!("coordinator task panicked: {}", e))
            }
            Err(_) => {
                error!("Coordinator did not stop within grace period");
                Err(anyhow::anyhow!("coordinator did not stop in time"))
            }
        }
    }
}
