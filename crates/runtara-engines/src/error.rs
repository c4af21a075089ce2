// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for runtara-engines.
//!
//! Every manager operation returns [`EnginesError`]; each variant maps to a
//! stable error code and an HTTP-equivalent status for the outer API layer.

use uuid::Uuid;

use crate::engine::EngineError;
use crate::persistence::StorageError;
use crate::snapshot::RunState;

/// Result type using EnginesError
pub type Result<T> = std::result::Result<T, EnginesError>;

/// Errors returned by the instance manager.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum EnginesError {
    /// No cached instance and no persisted state for the token.
    #[error("Execution '{token}' not found")]
    NotFound {
        /// The unknown token.
        token: Uuid,
    },

    /// The persisted state is terminal; the execution cannot continue.
    #[error("Execution '{token}' is already completed (state '{state}')")]
    AlreadyCompleted {
        /// The execution token.
        token: Uuid,
        /// The persisted terminal state.
        state: RunState,
    },

    /// Request refers to something that does not exist or cannot accept it.
    #[error("Bad request: {message}")]
    BadRequest {
        /// What was wrong with the request.
        message: String,
    },

    /// Storage adapter failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Synchronous run did not settle before the deadline.
    #[error("Execution '{token}' did not complete within {timeout_ms}ms")]
    RunTimeout {
        /// The execution token.
        token: Uuid,
        /// Deadline in milliseconds.
        timeout_ms: u64,
    },

    /// Execution Engine failure.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

impl EnginesError {
    /// Create a bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyCompleted { .. } => "ALREADY_COMPLETED",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::RunTimeout { .. } => "RUN_TIMEOUT",
            Self::Engine(_) => "ENGINE_ERROR",
        }
    }

    /// HTTP-equivalent status code.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::AlreadyCompleted { .. } | Self::BadRequest { .. } => 400,
            Self::Storage(_) => 502,
            Self::RunTimeout { .. } => 504,
            Self::Engine(_) => 500,
        }
    }

    /// The target execution no longer exists or can no longer continue.
    pub fn is_vanished(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::AlreadyCompleted { .. })
    }
}
