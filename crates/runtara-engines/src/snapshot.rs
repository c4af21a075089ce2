// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serializable execution snapshots.
//!
//! [`ExecutionStatus`] is the light-weight record returned by status queries;
//! [`ExecutionState`] adds the opaque engine recovery payload needed to
//! reconstruct an execution in another process.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::caller::CallerReference;

/// Run state of an execution.
///
/// `Idle` on a persisted record means the run completed; a record is never
/// written before the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Not running: completed (when persisted) or not yet started.
    Idle,
    /// Executing or waiting for input.
    Running,
    /// Stopped cleanly; can be resumed.
    Stopped,
    /// Failed.
    Error,
}

impl RunState {
    /// Completed or failed executions cannot be resumed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }

    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown run state '{}'", other)),
        }
    }
}

/// Aggregated status of the activities currently running in an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    /// Nothing is running.
    #[default]
    Idle,
    /// At least one activity is doing work with no natural wake-up event.
    Executing,
    /// Activities are waiting for timers.
    Timer,
    /// Activities are waiting for external input.
    Wait,
}

impl ActivityStatus {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Executing => "executing",
            Self::Timer => "timer",
            Self::Wait => "wait",
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "executing" => Ok(Self::Executing),
            "timer" => Ok(Self::Timer),
            "wait" => Ok(Self::Wait),
            other => Err(format!("unknown activity status '{}'", other)),
        }
    }
}

/// An activity that is started but not yet completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostponedActivity {
    /// Activity id in the process definition.
    pub id: String,
    /// Activity type, e.g. `bpmn:UserTask`.
    #[serde(rename = "type")]
    pub activity_type: String,
    /// Execution id of this activity run, when the engine exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl PostponedActivity {
    /// Create a postponed activity entry.
    pub fn new(id: impl Into<String>, activity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            activity_type: activity_type.into(),
            execution_id: None,
        }
    }
}

/// Status of one execution, without the engine recovery payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    /// Execution token.
    pub token: Uuid,
    /// Deployment name.
    pub name: String,
    /// Settled-event counter used for staleness detection.
    pub sequence_number: u64,
    /// Earliest due time of a pending engine timer.
    #[serde(default)]
    pub expire_at: Option<DateTime<Utc>>,
    /// Business key supplied when the execution was created.
    #[serde(default)]
    pub business_key: Option<String>,
    /// Parent activity that started this execution.
    #[serde(default)]
    pub caller: Option<CallerReference>,
    /// Run state.
    pub state: RunState,
    /// Activity status.
    pub activity_status: ActivityStatus,
    /// Started but not completed activities.
    #[serde(default)]
    pub postponed: Vec<PostponedActivity>,
}

impl ExecutionStatus {
    /// Whether the execution is running.
    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }
}

/// Full durable snapshot: status plus the engine recovery payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    /// Status fields.
    #[serde(flatten)]
    pub status: ExecutionStatus,
    /// Opaque engine recovery payload.
    pub engine: serde_json::Value,
}

impl ExecutionState {
    /// Execution token.
    pub fn token(&self) -> Uuid {
        self.status.token
    }

    /// Drop the recovery payload.
    pub fn into_status(self) -> ExecutionStatus {
        self.status
    }
}
