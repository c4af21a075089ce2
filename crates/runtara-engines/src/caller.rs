// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller references linking a child execution back to its parent activity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the activity in a parent execution that started a child execution.
///
/// Produced once when the parent's call activity requests a child, attached to
/// the child's options and persisted with every child snapshot. There are no
/// setters: a reference is replaced, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerReference {
    /// Token of the parent execution.
    pub token: Uuid,
    /// Deployment name of the parent execution.
    pub deployment_name: String,
    /// Id of the call activity in the parent definition.
    pub activity_id: String,
    /// Activity type, usually `bpmn:CallActivity`.
    pub activity_type: String,
    /// Execution id of the call activity run (distinguishes parallel runs).
    pub execution_id: String,
    /// Loop index when the call activity is multi-instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl CallerReference {
    /// Build a reference from the parent execution and the requesting activity.
    pub fn new(
        token: Uuid,
        deployment_name: impl Into<String>,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            token,
            deployment_name: deployment_name.into(),
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            execution_id: execution_id.into(),
            index: None,
        }
    }

    /// Set the multi-instance loop index.
    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// Filter matching children started by exactly this activity execution.
    pub fn as_filter(&self) -> CallerFilter {
        CallerFilter {
            token: self.token,
            activity_id: Some(self.activity_id.clone()),
            execution_id: Some(self.execution_id.clone()),
        }
    }
}

/// Query filter selecting executions by their caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerFilter {
    /// Parent token (required).
    pub token: Uuid,
    /// Restrict to children of this parent activity.
    #[serde(default)]
    pub activity_id: Option<String>,
    /// Restrict to children of this parent activity execution.
    #[serde(default)]
    pub execution_id: Option<String>,
}

impl CallerFilter {
    /// Filter matching every child of a parent execution.
    pub fn parent(token: Uuid) -> Self {
        Self {
            token,
            activity_id: None,
            execution_id: None,
        }
    }

    /// Whether `caller` satisfies this filter.
    pub fn matches(&self, caller: &CallerReference) -> bool {
        caller.token == self.token
            && self
                .activity_id
                .as_deref()
                .is_none_or(|id| id == caller.activity_id)
            && self
                .execution_id
                .as_deref()
                .is_none_or(|id| id == caller.execution_id)
    }
}
