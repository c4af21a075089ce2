// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution Instance: one live, in-memory execution.
//!
//! The instance owns the engine's execution handle and the typed
//! bookkeeping the manager keeps next to it (sequence number, earliest
//! pending timer, autosave flag, idle timeout). The router and idle timer
//! receive the instance by reference and mutate only that bookkeeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::caller::CallerReference;
use crate::engine::{EngineError, EngineEventReceiver, ProcessEngine, ProcessExecution};
use crate::notification::{Listener, Notification, Notifier};
use crate::snapshot::{ExecutionState, ExecutionStatus};

/// Shared handle to a live instance of engine `E`.
pub type Instance<E> = Arc<ExecutionInstance<<E as ProcessEngine>::Execution>>;

/// Mutable per-instance bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceOptions {
    /// Settled state changes observed so far.
    pub sequence_number: u64,
    /// Earliest pending engine timer.
    pub expire_at: Option<DateTime<Utc>>,
    /// Business key.
    pub business_key: Option<String>,
    /// Persist on every routed event.
    pub autosave: bool,
    /// Idle timer delay.
    pub idle_timeout: Duration,
}

/// One live execution and its bookkeeping.
pub struct ExecutionInstance<X> {
    token: Uuid,
    name: String,
    caller: Option<CallerReference>,
    execution: X,
    options: Mutex<InstanceOptions>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    router: Mutex<Option<JoinHandle<()>>>,
    events: Mutex<Option<EngineEventReceiver>>,
    notifier: Notifier,
    started: AtomicBool,
    outcome: watch::Sender<Option<ExecutionStatus>>,
}

// Guards below protect plain data; recover the value from a poisoned lock.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<X: ProcessExecution> ExecutionInstance<X> {
    /// Wrap an execution built by the engine.
    pub fn new(
        token: Uuid,
        name: impl Into<String>,
        caller: Option<CallerReference>,
        execution: X,
        events: EngineEventReceiver,
        options: InstanceOptions,
        notifier: Notifier,
    ) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            token,
            name: name.into(),
            caller,
            execution,
            options: Mutex::new(options),
            idle_timer: Mutex::new(None),
            router: Mutex::new(None),
            events: Mutex::new(Some(events)),
            notifier,
            started: AtomicBool::new(false),
            outcome,
        }
    }

    /// Execution token.
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Deployment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Caller reference, fixed for the instance's lifetime.
    pub fn caller(&self) -> Option<&CallerReference> {
        self.caller.as_ref()
    }

    /// The engine's execution handle.
    pub fn execution(&self) -> &X {
        &self.execution
    }

    /// Copy of the current bookkeeping.
    pub fn options(&self) -> InstanceOptions {
        lock(&self.options).clone()
    }

    /// Settled state changes observed so far.
    pub fn sequence_number(&self) -> u64 {
        lock(&self.options).sequence_number
    }

    /// Earliest pending engine timer.
    pub fn expire_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.options).expire_at
    }

    /// Whether every routed event is persisted.
    pub fn autosave(&self) -> bool {
        lock(&self.options).autosave
    }

    /// Idle timer delay.
    pub fn idle_timeout(&self) -> Duration {
        lock(&self.options).idle_timeout
    }

    pub(crate) fn set_autosave(&self, autosave: bool) {
        lock(&self.options).autosave = autosave;
    }

    pub(crate) fn set_idle_timeout(&self, idle_timeout: Duration) {
        lock(&self.options).idle_timeout = idle_timeout;
    }

    /// Count one settled state change.
    pub(crate) fn bump_sequence(&self) -> u64 {
        let mut options = lock(&self.options);
        options.sequence_number += 1;
        options.sequence_number
    }

    /// Fold a newly scheduled timer into `expire_at`.
    pub(crate) fn track_timer(&self, expire_at: DateTime<Utc>) {
        let mut options = lock(&self.options);
        options.expire_at = Some(options.expire_at.map_or(expire_at, |t| t.min(expire_at)));
    }

    /// Recompute `expire_at` from the engine's remaining timers.
    pub(crate) fn refresh_expire_at(&self) {
        let earliest = self
            .execution
            .pending_timers()
            .into_iter()
            .map(|timer| timer.expire_at)
            .min();
        lock(&self.options).expire_at = earliest;
    }

    /// Live status built from the engine and the bookkeeping.
    pub fn status(&self) -> ExecutionStatus {
        let options = self.options();
        ExecutionStatus {
            token: self.token,
            name: self.name.clone(),
            sequence_number: options.sequence_number,
            expire_at: options.expire_at,
            business_key: options.business_key,
            caller: self.caller.clone(),
            state: self.execution.state(),
            activity_status: self.execution.activity_status(),
            postponed: self.execution.postponed(),
        }
    }

    /// Snapshot including the engine's recovery payload.
    pub fn snapshot(&self) -> Result<ExecutionState, EngineError> {
        Ok(ExecutionState {
            status: self.status(),
            engine: self.execution.recovery_state()?,
        })
    }

    pub(crate) fn notify(&self, notification: Notification) {
        self.notifier.emit(notification);
    }

    pub(crate) fn set_listener(&self, listener: Listener) {
        self.notifier.set_listener(listener);
    }

    pub(crate) fn take_events(&self) -> Option<EngineEventReceiver> {
        lock(&self.events).take()
    }

    pub(crate) fn set_router(&self, handle: JoinHandle<()>) {
        if let Some(previous) = lock(&self.router).replace(handle) {
            previous.abort();
        }
    }

    pub(crate) fn set_idle_timer(&self, handle: JoinHandle<()>) {
        if let Some(previous) = lock(&self.idle_timer).replace(handle) {
            previous.abort();
        }
    }

    /// Detach the idle timer slot without aborting the task.
    pub(crate) fn release_idle_timer(&self) {
        lock(&self.idle_timer).take();
    }

    /// Cancel the pending idle timer, if any.
    pub fn cancel_idle_timer(&self) {
        if let Some(handle) = lock(&self.idle_timer).take() {
            handle.abort();
        }
    }

    /// Whether an idle timer is scheduled.
    pub fn has_idle_timer(&self) -> bool {
        lock(&self.idle_timer)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Whether the engine has been started or resumed.
    ///
    /// A started instance whose engine is no longer running has a terminal
    /// event in flight and is about to leave the cache.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Request a clean stop. The router persists and tears down on `RunStop`.
    pub fn stop(&self) {
        self.cancel_idle_timer();
        self.execution.stop();
    }

    /// Force-stop without routing any further events.
    pub(crate) fn terminate(&self) {
        self.cancel_idle_timer();
        if let Some(router) = lock(&self.router).take() {
            router.abort();
        }
        self.execution.stop();
        self.settle(self.status());
    }

    /// Record the final status of the run.
    pub(crate) fn settle(&self, status: ExecutionStatus) {
        self.outcome.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status);
            true
        });
    }

    /// Receiver resolving to the final status once the run settles.
    pub fn outcome(&self) -> watch::Receiver<Option<ExecutionStatus>> {
        self.outcome.subscribe()
    }

    /// Final status, once settled.
    pub fn settled(&self) -> Option<ExecutionStatus> {
        self.outcome.borrow().clone()
    }
}

impl<X> std::fmt::Debug for ExecutionInstance<X> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionInstance")
            .field("token", &self.token)
            .field("name", &self.name)
            .field("caller", &self.caller)
            .field("execution", &"...")
            .finish()
    }
}
