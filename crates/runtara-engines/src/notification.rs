// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound notifications.
//!
//! Every notification is published on the manager's broadcast channel and,
//! when one was supplied, on the instance's own listener.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::snapshot::ExecutionStatus;

/// Per-instance notification listener.
pub type Listener = mpsc::UnboundedSender<Notification>;

/// Lifecycle notification published by the manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", rename_all = "camelCase")]
pub enum Notification {
    /// A run was started and is running.
    #[serde(rename = "engine.start")]
    Start {
        /// Status after start.
        status: ExecutionStatus,
    },
    /// The idle timer rescheduled instead of stopping.
    #[serde(rename = "engine.idle.timer")]
    IdleTick {
        /// Current status.
        status: ExecutionStatus,
    },
    /// The run completed.
    #[serde(rename = "engine.end")]
    End {
        /// Final status.
        status: ExecutionStatus,
        /// Run output.
        output: serde_json::Value,
    },
    /// The run was stopped.
    #[serde(rename = "engine.stop")]
    Stop {
        /// Final status.
        status: ExecutionStatus,
    },
    /// The run failed, or its state could not be persisted.
    #[serde(rename = "engine.error")]
    Error {
        /// Status at the time of failure.
        status: ExecutionStatus,
        /// Error message.
        error: String,
    },
    /// Non-fatal failure, e.g. a vanished parent or child.
    #[serde(rename = "warn")]
    Warn {
        /// Execution the warning concerns, if any.
        token: Option<Uuid>,
        /// Warning message.
        message: String,
    },
}

impl Notification {
    /// Topic name of this notification.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Start { .. } => "engine.start",
            Self::IdleTick { .. } => "engine.idle.timer",
            Self::End { .. } => "engine.end",
            Self::Stop { .. } => "engine.stop",
            Self::Error { .. } => "engine.error",
            Self::Warn { .. } => "warn",
        }
    }

    /// Token of the execution this notification concerns.
    pub fn token(&self) -> Option<Uuid> {
        match self {
            Self::Start { status }
            | Self::IdleTick { status }
            | Self::End { status, .. }
            | Self::Stop { status }
            | Self::Error { status, .. } => Some(status.token),
            Self::Warn { token, .. } => *token,
        }
    }

    /// Build a warning.
    pub fn warn(token: Option<Uuid>, message: impl Into<String>) -> Self {
        Self::Warn {
            token,
            message: message.into(),
        }
    }
}

/// Publishes notifications to the manager's bus and an optional listener.
#[derive(Clone)]
pub struct Notifier {
    bus: broadcast::Sender<Notification>,
    listener: Arc<Mutex<Option<Listener>>>,
}

impl Notifier {
    /// Create a notifier publishing on `bus`.
    pub fn new(bus: broadcast::Sender<Notification>, listener: Option<Listener>) -> Self {
        Self {
            bus,
            listener: Arc::new(Mutex::new(listener)),
        }
    }

    /// Replace the per-instance listener.
    pub fn set_listener(&self, listener: Listener) {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener);
        }
    }

    /// Publish a notification. Missing subscribers are not an error.
    pub fn emit(&self, notification: Notification) {
        if let Ok(mut slot) = self.listener.lock()
            && let Some(listener) = slot.as_ref()
            && listener.send(notification.clone()).is_err()
        {
            *slot = None;
        }
        let _ = self.bus.send(notification);
    }
}
