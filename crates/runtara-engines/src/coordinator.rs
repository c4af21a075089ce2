// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call-Activity Coordinator.
//!
//! Relays between a parent execution and the child execution started by
//! one of its call activities. The parent and child may live in different
//! processes; everything the coordinator needs is reached through the
//! manager and storage.
//!
//! - A call-activity start launches the named child deployment with a
//!   caller reference pointing at the parent activity, or reuses a running
//!   child already started for that activity.
//! - A call-activity cancel discards the running child, if any.
//! - A child's completion signals the parent activity with the child's
//!   output; a child's failure fails the parent activity.
//!
//! A parent or child that no longer exists is an expected condition and
//! is reported as a `warn` notification.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::caller::CallerReference;
use crate::engine::{ProcessEngine, ProcessSource};
use crate::engines::{ActivityRequest, DeploymentOptions, Engines, ResumeOptions};
use crate::error::{EnginesError, Result};
use crate::notification::Notification;
use crate::persistence::StateQuery;

/// Requests relayed from routers to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// A parent activity requested a child execution.
    StartRequested {
        /// The requesting parent activity.
        parent: CallerReference,
        /// Called element of the call activity.
        called_element: String,
        /// Input variables for the child.
        input: serde_json::Map<String, serde_json::Value>,
    },
    /// A parent activity cancelled its child execution.
    CancelRequested {
        /// The cancelling parent activity.
        parent: CallerReference,
        /// Called element of the call activity.
        called_element: String,
    },
    /// A child execution completed.
    ChildEnded {
        /// The child's caller reference.
        caller: CallerReference,
        /// Child token.
        child: Uuid,
        /// Child output.
        output: serde_json::Value,
    },
    /// A child execution failed.
    ChildFailed {
        /// The child's caller reference.
        caller: CallerReference,
        /// Child token.
        child: Uuid,
        /// Error message.
        error: String,
    },
}

/// Parsed called element of a call activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// A separately deployed process, by deployment name.
    Deployment(String),
    /// A process defined in the same definition; run by the engine itself.
    Inline(String),
}

impl CallTarget {
    /// Parse `deployment:<name>`, `process:<id>` or a bare deployment name.
    pub fn parse(called_element: &str) -> Self {
        if let Some(name) = called_element.strip_prefix("deployment:") {
            Self::Deployment(name.to_string())
        } else if let Some(id) = called_element.strip_prefix("process:") {
            Self::Inline(id.to_string())
        } else {
            Self::Deployment(called_element.to_string())
        }
    }
}

/// Background worker relaying call-activity requests.
pub struct Coordinator<E: ProcessEngine> {
    engines: Engines<E>,
    events: Option<mpsc::UnboundedReceiver<CoordinatorEvent>>,
    shutdown: Arc<Notify>,
}

impl<E: ProcessEngine> Coordinator<E> {
    /// Create the coordinator for `engines`.
    ///
    /// Only one coordinator per manager receives events.
    pub fn new(engines: Engines<E>) -> Self {
        let events = engines.take_coordinator_events();
        Self {
            engines,
            events,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the coordinator loop until shutdown.
    pub async fn run(mut self) {
        let Some(mut events) = self.events.take() else {
            warn!("Call-activity coordinator already running for this manager");
            return;
        };

        info!("Call-activity coordinator started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Call-activity coordinator received shutdown signal");
                    break;
                }

                event = events.recv() => {
                    match event {
                        Some(event) => self.handle(event).await,
                        None => break,
                    }
                }
            }
        }

        info!("Call-activity coordinator stopped");
    }

    async fn handle(&self, event: CoordinatorEvent) {
        let (token, result) = match event {
            CoordinatorEvent::StartRequested {
                parent,
                called_element,
                input,
            } => (
                parent.token,
                self.start_child(parent, &called_element, input).await,
            ),
            CoordinatorEvent::CancelRequested {
                parent,
                called_element,
            } => (parent.token, self.cancel_child(parent, &called_element).await),
            CoordinatorEvent::ChildEnded {
                caller,
                child,
                output,
            } => (caller.token, self.child_ended(caller, child, output).await),
            CoordinatorEvent::ChildFailed {
                caller,
                child,
                error,
            } => (caller.token, self.child_failed(caller, child, error).await),
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_vanished() || matches!(e, EnginesError::BadRequest { .. }) => {
                warn!(token = %token, error = %e, "Call-activity relay target unavailable");
                self.engines
                    .publish(Notification::warn(Some(token), e.to_string()));
            }
            Err(e) => {
                error!(token = %token, error = %e, "Call-activity relay failed");
                self.engines
                    .publish(Notification::warn(Some(token), e.to_string()));
            }
        }
    }

    #[instrument(skip(self, parent, input), fields(parent = %parent.token, activity = %parent.activity_id))]
    async fn start_child(
        &self,
        parent: CallerReference,
        called_element: &str,
        input: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let name = match CallTarget::parse(called_element) {
            CallTarget::Deployment(name) => name,
            CallTarget::Inline(id) => {
                debug!(process = %id, "Inline call activity, left to the engine");
                return Ok(());
            }
        };

        let running = self
            .engines
            .get_running(StateQuery::running().with_caller(parent.as_filter()))
            .await?;
        if let Some(existing) = running.records.first() {
            info!(child = %existing.token, "Reusing running child execution");
            self.engines
                .resume(existing.token, ResumeOptions::default())
                .await?;
            return Ok(());
        }

        let Some(deployment) = self.engines.store().fetch_deployment(&name).await? else {
            warn!(deployment = %name, "Called deployment not found, failing parent activity");
            let request = ActivityRequest::new(parent.activity_id.clone())
                .with_execution_id(parent.execution_id.clone())
                .with_message(json!({
                    "message": format!("deployment '{}' not found", name),
                    "code": "DEPLOYMENT_NOT_FOUND",
                }));
            self.engines
                .fail_activity(parent.token, request, ResumeOptions::default())
                .await?;
            return Ok(());
        };

        let options = DeploymentOptions::new(ProcessSource {
            name: deployment.name,
            source: deployment.source,
        })
        .with_caller(parent)
        .with_variables(input);

        let child = self.engines.create(options)?;
        let child = self.engines.run(child).await?;
        info!(child = %child.token(), "Child execution started");
        Ok(())
    }

    #[instrument(skip(self, parent), fields(parent = %parent.token, activity = %parent.activity_id))]
    async fn cancel_child(&self, parent: CallerReference, called_element: &str) -> Result<()> {
        if let CallTarget::Inline(_) = CallTarget::parse(called_element) {
            return Ok(());
        }

        let running = self
            .engines
            .get_running(StateQuery::running().with_caller(parent.as_filter()))
            .await?;

        if running.records.is_empty() {
            debug!("No running child to cancel");
            return Ok(());
        }

        for child in running.records {
            match self
                .engines
                .discard_by_token(child.token, ResumeOptions::default())
                .await
            {
                Ok(_) => info!(child = %child.token, "Child execution discarded"),
                Err(e) if e.is_vanished() => {
                    debug!(child = %child.token, error = %e, "Child already gone");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    #[instrument(skip(self, caller, output), fields(parent = %caller.token, activity = %caller.activity_id))]
    async fn child_ended(
        &self,
        caller: CallerReference,
        child: Uuid,
        output: serde_json::Value,
    ) -> Result<()> {
        let request = ActivityRequest::new(caller.activity_id)
            .with_execution_id(caller.execution_id)
            .with_message(output);
        self.engines
            .signal_activity(caller.token, request, ResumeOptions::default())
            .await?;
        info!(child = %child, "Parent signalled with child output");
        Ok(())
    }

    #[instrument(skip(self, caller), fields(parent = %caller.token, activity = %caller.activity_id))]
    async fn child_failed(&self, caller: CallerReference, child: Uuid, error: String) -> Result<()> {
        let request = ActivityRequest::new(caller.activity_id)
            .with_execution_id(caller.execution_id)
            .with_message(json!({
                "message": error,
                "child": child,
            }));
        self.engines
            .fail_activity(caller.token, request, ResumeOptions::default())
            .await?;
        info!(child = %child, "Parent activity failed with child error");
        Ok(())
    }
}
