// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution Engine contract.
//!
//! The workflow interpreter itself is opaque to this crate. It is consumed
//! through [`ProcessEngine`], which builds executions, and
//! [`ProcessExecution`], the handle to one in-memory execution.
//!
//! Executions report progress on a per-instance channel of [`EngineMessage`]s
//! created by the manager and handed to the engine when the execution is
//! built. Messages for one execution are consumed in order by a single
//! router task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::snapshot::{ActivityStatus, PostponedActivity, RunState};

/// Sending half of an execution's event channel.
pub type EngineEventSender = mpsc::UnboundedSender<EngineMessage>;

/// Receiving half of an execution's event channel.
pub type EngineEventReceiver = mpsc::UnboundedReceiver<EngineMessage>;

/// Failure reported by the Execution Engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    /// Human-readable message.
    pub message: String,
    /// Optional engine error code.
    pub code: Option<String>,
}

impl EngineError {
    /// Create an engine error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Attach an engine error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Process definition source registered under a deployment name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSource {
    /// Deployment name.
    pub name: String,
    /// Definition source (BPMN XML or an engine-specific document).
    pub source: String,
}

/// Settings handed to the engine when an execution is built.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSettings {
    /// Execution token.
    pub token: Uuid,
    /// Deployment name.
    pub name: String,
    /// Business key.
    #[serde(default)]
    pub business_key: Option<String>,
    /// Initial process variables.
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

/// A timer registered by an activity, excluding the manager's idle timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTimer {
    /// Activity owning the timer.
    pub activity_id: String,
    /// When the timer is due.
    pub expire_at: DateTime<Utc>,
}

/// Activity that raised an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRef {
    /// Activity id.
    pub id: String,
    /// Activity type.
    #[serde(rename = "type")]
    pub activity_type: String,
    /// Execution id of this activity run.
    pub execution_id: String,
    /// Multi-instance loop index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

/// Lookup result for an activity in a live execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityInfo {
    /// Activity id.
    pub id: String,
    /// Activity type.
    pub activity_type: String,
    /// Whether the activity is currently running.
    pub is_running: bool,
    /// Execution ids of the running activity executions.
    pub execution_ids: Vec<String>,
}

/// Target of a signal, cancel or fail request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityTarget {
    /// Activity id.
    pub id: String,
    /// Specific execution, for parallel or multi-instance activities.
    pub execution_id: Option<String>,
}

/// Events an execution emits while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EngineEvent {
    /// Persist the current state now.
    SaveState,
    /// Turn autosave on or off for this execution.
    SetAutosave {
        /// New autosave flag.
        enabled: bool,
    },
    /// An activity entered a wait state.
    ActivityWait {
        /// Waiting activity.
        activity: ActivityRef,
    },
    /// An activity completed.
    ActivityEnd {
        /// Completed activity.
        activity: ActivityRef,
    },
    /// An activity registered a timer.
    ActivityTimer {
        /// Activity owning the timer.
        activity: ActivityRef,
        /// When the timer is due.
        expire_at: DateTime<Utc>,
    },
    /// An activity timer fired or was cancelled.
    ActivityTimerCleared {
        /// Activity owning the timer.
        activity: ActivityRef,
    },
    /// A call activity requests a child execution.
    CallActivityStart {
        /// Requesting call activity.
        activity: ActivityRef,
        /// Called element, e.g. `deployment:shipping`.
        called_element: String,
        /// Input handed to the child.
        #[serde(default)]
        input: serde_json::Map<String, serde_json::Value>,
    },
    /// A call activity was cancelled or discarded.
    CallActivityCancel {
        /// Cancelled call activity.
        activity: ActivityRef,
        /// Called element.
        called_element: String,
    },
    /// The run completed.
    RunEnd {
        /// Process output.
        output: serde_json::Value,
        /// Whether the run ended because it was discarded.
        #[serde(default)]
        discarded: bool,
    },
    /// The run was stopped.
    RunStop,
    /// The run failed.
    RunError {
        /// Failure.
        error: String,
    },
}

impl EngineEvent {
    /// End, stop and error close the execution's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunEnd { .. } | Self::RunStop | Self::RunError { .. })
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SaveState => "save_state",
            Self::SetAutosave { .. } => "set_autosave",
            Self::ActivityWait { .. } => "activity_wait",
            Self::ActivityEnd { .. } => "activity_end",
            Self::ActivityTimer { .. } => "activity_timer",
            Self::ActivityTimerCleared { .. } => "activity_timer_cleared",
            Self::CallActivityStart { .. } => "call_activity_start",
            Self::CallActivityCancel { .. } => "call_activity_cancel",
            Self::RunEnd { .. } => "run_end",
            Self::RunStop => "run_stop",
            Self::RunError { .. } => "run_error",
        }
    }
}

/// Event envelope with delivery flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMessage {
    /// The event.
    pub event: EngineEvent,
    /// Replayed while the execution was recovered from a snapshot.
    #[serde(default)]
    pub recovered: bool,
    /// Delivered again after a previous delivery was already handled.
    #[serde(default)]
    pub redelivered: bool,
}

impl EngineMessage {
    /// Fresh event.
    pub fn new(event: EngineEvent) -> Self {
        Self {
            event,
            recovered: false,
            redelivered: false,
        }
    }

    /// Event replayed during recovery.
    pub fn recovered(event: EngineEvent) -> Self {
        Self {
            event,
            recovered: true,
            redelivered: false,
        }
    }

    /// Event delivered again.
    pub fn redelivered(event: EngineEvent) -> Self {
        Self {
            event,
            recovered: false,
            redelivered: true,
        }
    }
}

impl From<EngineEvent> for EngineMessage {
    fn from(event: EngineEvent) -> Self {
        Self::new(event)
    }
}

/// Builds executions from process sources or recovery payloads.
pub trait ProcessEngine: Send + Sync + 'static {
    /// Handle type for one execution.
    type Execution: ProcessExecution;

    /// Build a fresh execution. Must not start it.
    fn load(
        &self,
        source: &ProcessSource,
        settings: &ExecutionSettings,
        events: EngineEventSender,
    ) -> Result<Self::Execution, EngineError>;

    /// Rebuild an execution from a recovery payload. Must not resume it.
    fn recover(
        &self,
        state: &serde_json::Value,
        settings: &ExecutionSettings,
        events: EngineEventSender,
    ) -> Result<Self::Execution, EngineError>;
}

/// Handle to one in-memory execution.
///
/// `stop` only requests a stop; the execution confirms it by emitting
/// [`EngineEvent::RunStop`].
#[async_trait]
pub trait ProcessExecution: Send + Sync + 'static {
    /// Start a freshly loaded execution.
    async fn execute(&self) -> Result<(), EngineError>;

    /// Continue a recovered execution.
    async fn resume(&self) -> Result<(), EngineError>;

    /// Request a clean stop.
    fn stop(&self);

    /// Current run state.
    fn state(&self) -> RunState;

    /// Current activity status.
    fn activity_status(&self) -> ActivityStatus;

    /// Started but not completed activities.
    fn postponed(&self) -> Vec<PostponedActivity>;

    /// Activity timers that have not fired yet.
    fn pending_timers(&self) -> Vec<PendingTimer>;

    /// Serialize the execution for later recovery.
    fn recovery_state(&self) -> Result<serde_json::Value, EngineError>;

    /// Process output collected so far.
    fn output(&self) -> serde_json::Value;

    /// Look up an activity by id.
    fn find_activity(&self, activity_id: &str) -> Option<ActivityInfo>;

    /// Deliver input to a waiting activity.
    fn signal_activity(
        &self,
        target: &ActivityTarget,
        message: serde_json::Value,
    ) -> Result<(), EngineError>;

    /// Cancel a running activity.
    fn cancel_activity(
        &self,
        target: &ActivityTarget,
        message: serde_json::Value,
    ) -> Result<(), EngineError>;

    /// Fail a running activity as if its work had failed.
    fn fail_activity(
        &self,
        target: &ActivityTarget,
        error: serde_json::Value,
    ) -> Result<(), EngineError>;

    /// Discard every running process of the top-level definition.
    fn discard_running(&self) -> Result<(), EngineError>;
}
