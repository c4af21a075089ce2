// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Idle Timer Controller.
//!
//! Suspends an instance that has gone quiet. Each instance has at most one
//! idle timer task; starting a new one supersedes the previous schedule.
//! On every tick the timer either reschedules (and publishes an idle-tick
//! notification) or cleanly stops the execution, which triggers the
//! router's normal teardown and persistence path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::engine::ProcessExecution;
use crate::engines::millis;
use crate::instance::ExecutionInstance;
use crate::notification::Notification;
use crate::snapshot::{ActivityStatus, RunState};

/// What the idle timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    /// Keep the instance alive and check again after another delay.
    Reschedule,
    /// The instance is idle: stop it.
    Stop,
}

/// Decide whether an instance is idle.
///
/// Executing activities are never idle. An engine timer due before
/// `now + 2 × delay` is left to fire natively.
pub fn idle_decision(
    activity_status: ActivityStatus,
    expire_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    delay: Duration,
) -> IdleDecision {
    if activity_status == ActivityStatus::Executing {
        return IdleDecision::Reschedule;
    }

    if let Some(expire_at) = expire_at {
        let horizon = chrono::Duration::from_std(delay.saturating_mul(2))
            .ok()
            .and_then(|window| now.checked_add_signed(window));
        if horizon.is_none_or(|horizon| expire_at < horizon) {
            return IdleDecision::Reschedule;
        }
    }

    IdleDecision::Stop
}

/// Start (or restart) the idle timer of `instance` with its configured delay.
///
/// Does nothing beyond cancelling the previous timer unless the execution
/// is running.
pub(crate) fn start<X: ProcessExecution>(instance: &Arc<ExecutionInstance<X>>) {
    instance.cancel_idle_timer();

    if instance.execution().state() != RunState::Running {
        return;
    }

    let delay = instance.idle_timeout();
    let weak = Arc::downgrade(instance);
    let token = instance.token();

    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(delay).await;

            let Some(instance) = weak.upgrade() else {
                break;
            };
            let execution = instance.execution();
            if execution.state() != RunState::Running {
                debug!(token = %token, "Idle timer fired for non-running instance");
                instance.release_idle_timer();
                break;
            }

            match idle_decision(
                execution.activity_status(),
                instance.expire_at(),
                Utc::now(),
                delay,
            ) {
                IdleDecision::Reschedule => {
                    debug!(
                        token = %token,
                        activity_status = %execution.activity_status(),
                        "Idle timer rescheduled"
                    );
                    instance.notify(Notification::IdleTick {
                        status: instance.status(),
                    });
                }
                IdleDecision::Stop => {
                    info!(token = %token, delay_ms = millis(delay), "Instance idle, stopping");
                    instance.release_idle_timer();
                    execution.stop();
                    break;
                }
            }
        }
    });

    instance.set_idle_timer(handle);
}
