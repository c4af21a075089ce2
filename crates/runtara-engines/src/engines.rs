// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance Manager.
//!
//! [`Engines`] is the façade over the cache, the storage adapter and the
//! Execution Engine. It decides when an execution is held in memory,
//! persisted, reloaded or torn down.
//!
//! # Conflict detection
//!
//! There is no distributed lock. When storage reports a higher sequence
//! number than a cached copy, the cached copy is stale: it is terminated
//! and the execution is reconstructed from storage. Two processes may
//! still resume the same token concurrently and write forward from the
//! same base; detection is advisory only.
//!
//! Within one process, a resume never builds a second copy next to an
//! instance that is still shutting down. A cached or just-evicted instance
//! whose engine has stopped is awaited until its router settles it, bounded
//! by the run timeout, and the execution is then reloaded from storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::InstanceCache;
use crate::caller::CallerReference;
use crate::config::Config;
use crate::coordinator::CoordinatorEvent;
use crate::engine::{
    ActivityTarget, ExecutionSettings, ProcessEngine, ProcessExecution, ProcessSource,
};
use crate::error::{EnginesError, Result};
use crate::idle_timer;
use crate::instance::{ExecutionInstance, Instance, InstanceOptions};
use crate::notification::{Listener, Notification, Notifier};
use crate::persistence::{Deployment, StateQuery, StateQueryResult, StateStore};
use crate::router::{self, RouterContext};
use crate::snapshot::{ExecutionState, ExecutionStatus, RunState};

const NOTIFICATION_CAPACITY: usize = 1024;

/// Options for [`Engines::create`].
#[derive(Debug, Clone)]
pub struct DeploymentOptions {
    /// Process definition to execute.
    pub source: ProcessSource,
    /// Token to use; generated when absent.
    pub token: Option<Uuid>,
    /// Business key.
    pub business_key: Option<String>,
    /// Input variables.
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Parent activity, for child executions.
    pub caller: Option<CallerReference>,
    /// Autosave override.
    pub autosave: Option<bool>,
    /// Idle timeout override.
    pub idle_timeout: Option<Duration>,
    /// Per-instance notification listener.
    pub listener: Option<Listener>,
}

impl DeploymentOptions {
    /// Options for running `source` with defaults.
    pub fn new(source: ProcessSource) -> Self {
        Self {
            source,
            token: None,
            business_key: None,
            variables: serde_json::Map::new(),
            caller: None,
            autosave: None,
            idle_timeout: None,
            listener: None,
        }
    }

    /// Use a caller-supplied token.
    pub fn with_token(mut self, token: Uuid) -> Self {
        self.token = Some(token);
        self
    }

    /// Set the business key.
    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    /// Set the input variables.
    pub fn with_variables(mut self, variables: serde_json::Map<String, serde_json::Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Attach a caller reference.
    pub fn with_caller(mut self, caller: CallerReference) -> Self {
        self.caller = Some(caller);
        self
    }

    /// Override the autosave flag.
    pub fn with_autosave(mut self, autosave: bool) -> Self {
        self.autosave = Some(autosave);
        self
    }

    /// Override the idle timeout.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }

    /// Attach a notification listener.
    pub fn with_listener(mut self, listener: Listener) -> Self {
        self.listener = Some(listener);
        self
    }
}

/// Options for [`Engines::resume`] and the operations built on it.
///
/// On an already-live instance the overrides are applied in place.
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    /// Autosave override.
    pub autosave: Option<bool>,
    /// Idle timeout override; restarts the idle timer.
    pub idle_timeout: Option<Duration>,
    /// Replace the per-instance listener.
    pub listener: Option<Listener>,
}

/// Addresses an activity of a live execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRequest {
    /// Activity id.
    pub id: String,
    /// Execution id for parallel or multi-instance activities.
    pub execution_id: Option<String>,
    /// Input, cancellation message or error, depending on the operation.
    pub message: serde_json::Value,
}

impl ActivityRequest {
    /// Address activity `id` with an empty message.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            execution_id: None,
            message: serde_json::Value::Null,
        }
    }

    /// Narrow to one execution of the activity.
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    /// Set the message.
    pub fn with_message(mut self, message: serde_json::Value) -> Self {
        self.message = message;
        self
    }
}

type Cache<E> = InstanceCache<ExecutionInstance<<E as ProcessEngine>::Execution>>;

struct EnginesInner<E: ProcessEngine> {
    engine: E,
    store: Arc<dyn StateStore>,
    cache: Arc<Cache<E>>,
    config: Config,
    bus: broadcast::Sender<Notification>,
    coordinator_tx: mpsc::UnboundedSender<CoordinatorEvent>,
    coordinator_rx: Mutex<Option<mpsc::UnboundedReceiver<CoordinatorEvent>>>,
    resume_gates: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// The Instance Manager.
///
/// Cheap to clone; clones share the cache and storage.
pub struct Engines<E: ProcessEngine> {
    inner: Arc<EnginesInner<E>>,
}

impl<E: ProcessEngine> Clone for Engines<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: ProcessEngine> std::fmt::Debug for Engines<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engines")
            .field("store", &"...")
            .field("cached", &self.inner.cache.size())
            .field("config", &self.inner.config)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Settled, or started and no longer running: a terminal event is in flight.
fn is_winding_down<X: ProcessExecution>(instance: &ExecutionInstance<X>) -> bool {
    instance.settled().is_some()
        || (instance.is_started() && instance.execution().state() != RunState::Running)
}

impl<E: ProcessEngine> Engines<E> {
    /// Create a manager over `engine` and `store`.
    pub fn new(engine: E, store: Arc<dyn StateStore>, config: Config) -> Self {
        let cache = Arc::new(InstanceCache::new(
            config.cache_capacity,
            Box::new(|token: Uuid, instance: Arc<ExecutionInstance<E::Execution>>| {
                info!(token = %token, "Cache full, stopping evicted instance");
                instance.stop();
            }),
        ));
        let (bus, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let (coordinator_tx, coordinator_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(EnginesInner {
                engine,
                store,
                cache,
                config,
                bus,
                coordinator_tx,
                coordinator_rx: Mutex::new(Some(coordinator_rx)),
                resume_gates: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Storage adapter.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Subscribe to every notification published by this manager.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.bus.subscribe()
    }

    /// Live instance for `token`, if cached in this process.
    pub fn cached(&self, token: Uuid) -> Option<Instance<E>> {
        self.inner.cache.get(&token)
    }

    /// Number of live instances in this process.
    pub fn cached_count(&self) -> usize {
        self.inner.cache.size()
    }

    /// All live instances in this process.
    pub fn live_instances(&self) -> Vec<Instance<E>> {
        self.inner.cache.values()
    }

    /// Store a process definition under `name` for call activities.
    pub async fn deploy(&self, name: impl Into<String>, source: impl Into<String>) -> Result<()> {
        let deployment = Deployment::new(name, source);
        self.inner.store.upsert_deployment(&deployment).await?;
        info!(name = %deployment.name, "Deployment stored");
        Ok(())
    }

    pub(crate) fn take_coordinator_events(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<CoordinatorEvent>> {
        lock(&self.inner.coordinator_rx).take()
    }

    pub(crate) fn publish(&self, notification: Notification) {
        let _ = self.inner.bus.send(notification);
    }

    fn notifier(&self, listener: Option<Listener>) -> Notifier {
        Notifier::new(self.inner.bus.clone(), listener)
    }

    fn router_context(&self) -> RouterContext<E::Execution> {
        RouterContext {
            store: self.inner.store.clone(),
            cache: self.inner.cache.clone(),
            coordinator: self.inner.coordinator_tx.clone(),
        }
    }

    /// Register in the cache and attach the router.
    fn register(&self, instance: &Instance<E>) {
        self.inner.cache.set(instance.token(), instance.clone());
        router::attach(instance, self.router_context());
    }

    /// Force-stop and drop from the cache.
    fn teardown(&self, instance: &Instance<E>) {
        instance.terminate();
        self.inner.cache.remove_if_same(&instance.token(), instance);
    }

    /// Build a fresh execution. It is neither cached nor started.
    #[instrument(skip_all, fields(name = %options.source.name))]
    pub fn create(&self, options: DeploymentOptions) -> Result<Instance<E>> {
        let token = options.token.unwrap_or_else(Uuid::new_v4);
        let settings = ExecutionSettings {
            token,
            name: options.source.name.clone(),
            business_key: options.business_key.clone(),
            variables: options.variables,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let execution = self
            .inner
            .engine
            .load(&options.source, &settings, events_tx)?;

        let instance = ExecutionInstance::new(
            token,
            options.source.name,
            options.caller,
            execution,
            events_rx,
            InstanceOptions {
                sequence_number: 0,
                expire_at: None,
                business_key: options.business_key,
                autosave: options.autosave.unwrap_or(self.inner.config.autosave),
                idle_timeout: options
                    .idle_timeout
                    .unwrap_or(self.inner.config.idle_timeout),
            },
            self.notifier(options.listener),
        );

        debug!(token = %token, "Execution created");
        Ok(Arc::new(instance))
    }

    /// Register and start a created execution.
    ///
    /// Starts the idle timer and publishes `engine.start` when the execution
    /// is still running afterwards. On failure the instance is torn down.
    #[instrument(skip_all, fields(token = %instance.token(), name = %instance.name()))]
    pub async fn run(&self, instance: Instance<E>) -> Result<Instance<E>> {
        let token = instance.token();
        if self.inner.cache.contains(&token) {
            return Err(EnginesError::bad_request(format!(
                "Execution '{}' is already running",
                token
            )));
        }
        if instance.settled().is_some() {
            return Err(EnginesError::bad_request(format!(
                "Execution '{}' has already run",
                token
            )));
        }

        self.register(&instance);

        if let Err(e) = instance.execution().execute().await {
            error!(error = %e, "Execution failed to start");
            self.teardown(&instance);
            return Err(e.into());
        }
        instance.mark_started();

        if instance.execution().state() == RunState::Running {
            idle_timer::start(&instance);
            instance.notify(Notification::Start {
                status: instance.status(),
            });
        }

        info!(state = %instance.execution().state(), "Execution started");
        Ok(instance)
    }

    /// Run and wait until the execution ends, stops or fails.
    ///
    /// On deadline the instance is stopped and [`EnginesError::RunTimeout`]
    /// is returned. `None` uses the configured run timeout.
    pub async fn run_sync(
        &self,
        instance: Instance<E>,
        timeout: Option<Duration>,
    ) -> Result<ExecutionStatus> {
        let timeout = timeout.unwrap_or(self.inner.config.run_timeout);
        let mut outcome = instance.outcome();
        let instance = self.run(instance).await?;

        let settled = tokio::time::timeout(timeout, outcome.wait_for(Option::is_some))
            .await
            .map(|result| result.ok().and_then(|status| (*status).clone()));

        match settled {
            Ok(status) => Ok(status.unwrap_or_else(|| instance.status())),
            Err(_) => {
                warn!(
                    token = %instance.token(),
                    timeout_ms = millis(timeout),
                    "Synchronous run timed out, stopping"
                );
                instance.stop();
                Err(EnginesError::RunTimeout {
                    token: instance.token(),
                    timeout_ms: millis(timeout),
                })
            }
        }
    }

    /// Return the live instance for `token`, reconstructing it from storage
    /// when needed.
    ///
    /// Fails with [`EnginesError::NotFound`] when neither a cached instance
    /// nor a snapshot exists, and with [`EnginesError::AlreadyCompleted`]
    /// when the snapshot is terminal. A cached copy older than the snapshot
    /// is terminated and replaced.
    #[instrument(skip(self, options))]
    pub async fn resume(&self, token: Uuid, options: ResumeOptions) -> Result<Instance<E>> {
        let gate = self.resume_gate(token);
        let result = {
            let _guard = gate.lock().await;
            self.resume_unguarded(token, options).await
        };
        drop(gate);
        self.release_resume_gate(token);
        result
    }

    fn resume_gate(&self, token: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.inner.resume_gates)
            .entry(token)
            .or_default()
            .clone()
    }

    fn release_resume_gate(&self, token: Uuid) {
        let mut gates = lock(&self.inner.resume_gates);
        if gates
            .get(&token)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(&token);
        }
    }

    async fn resume_unguarded(&self, token: Uuid, options: ResumeOptions) -> Result<Instance<E>> {
        loop {
            let cached = self.inner.cache.get(&token);
            if cached.is_none()
                && let Some(evicted) = self.inner.cache.evicted(&token)
                && evicted.is_started()
                && evicted.settled().is_none()
            {
                debug!("Evicted instance is still stopping, waiting");
                self.await_settled(&evicted).await;
                continue;
            }
            let stored = self.inner.store.fetch_state(token).await?;

            match (cached, stored) {
                (None, None) => return Err(EnginesError::NotFound { token }),
                (cached, Some(state)) if state.status.state.is_terminal() => {
                    if let Some(cached) = cached {
                        warn!(state = %state.status.state, "Cached instance completed elsewhere, terminating");
                        self.teardown(&cached);
                    }
                    return Err(EnginesError::AlreadyCompleted {
                        token,
                        state: state.status.state,
                    });
                }
                (Some(cached), Some(state))
                    if state.status.sequence_number > cached.sequence_number() =>
                {
                    warn!(
                        cached = cached.sequence_number(),
                        stored = state.status.sequence_number,
                        "Cached instance is stale, reloading from storage"
                    );
                    self.teardown(&cached);
                }
                (Some(cached), _) if is_winding_down(&cached) => {
                    debug!("Cached instance is stopping, waiting");
                    self.await_settled(&cached).await;
                }
                (Some(cached), _) => {
                    self.apply_options(&cached, options);
                    return Ok(cached);
                }
                (None, Some(state)) => return self.recover(state, options).await,
            }
        }
    }

    /// Wait for the router to settle `instance`; force it down on timeout.
    async fn await_settled(&self, instance: &Instance<E>) {
        let limit = self.inner.config.run_timeout;
        let mut outcome = instance.outcome();
        let settled = tokio::time::timeout(limit, outcome.wait_for(Option::is_some))
            .await
            .is_ok();
        if !settled {
            warn!(
                token = %instance.token(),
                timeout_ms = millis(limit),
                "Instance did not settle in time, terminating"
            );
            self.teardown(instance);
        }
    }

    fn apply_options(&self, instance: &Instance<E>, options: ResumeOptions) {
        if let Some(autosave) = options.autosave {
            instance.set_autosave(autosave);
        }
        if let Some(listener) = options.listener {
            instance.set_listener(listener);
        }
        if let Some(idle_timeout) = options.idle_timeout {
            instance.set_idle_timeout(idle_timeout);
            idle_timer::start(instance);
        }
    }

    async fn recover(&self, state: ExecutionState, options: ResumeOptions) -> Result<Instance<E>> {
        let ExecutionState { status, engine } = state;
        let token = status.token;
        let settings = ExecutionSettings {
            token,
            name: status.name.clone(),
            business_key: status.business_key.clone(),
            variables: serde_json::Map::new(),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let execution = self
            .inner
            .engine
            .recover(&engine, &settings, events_tx)?;

        let instance = Arc::new(ExecutionInstance::new(
            token,
            status.name,
            status.caller,
            execution,
            events_rx,
            InstanceOptions {
                sequence_number: status.sequence_number,
                expire_at: status.expire_at,
                business_key: status.business_key,
                autosave: options.autosave.unwrap_or(self.inner.config.autosave),
                idle_timeout: options
                    .idle_timeout
                    .unwrap_or(self.inner.config.idle_timeout),
            },
            self.notifier(options.listener),
        ));

        self.register(&instance);

        if let Err(e) = instance.execution().resume().await {
            error!(error = %e, "Failed to resume recovered execution");
            self.teardown(&instance);
            return Err(e.into());
        }
        instance.mark_started();

        idle_timer::start(&instance);
        info!(
            sequence_number = instance.sequence_number(),
            state = %instance.execution().state(),
            "Execution recovered from storage"
        );
        Ok(instance)
    }

    /// Resume, let pending engine work run, then locate the activity.
    async fn locate(
        &self,
        token: Uuid,
        request: &ActivityRequest,
        options: ResumeOptions,
        require_running: bool,
    ) -> Result<(Instance<E>, ActivityTarget)> {
        let instance = self.resume(token, options).await?;
        tokio::task::yield_now().await;

        let activity = instance
            .execution()
            .find_activity(&request.id)
            .ok_or_else(|| {
                EnginesError::bad_request(format!("Activity '{}' not found", request.id))
            })?;

        if let Some(execution_id) = &request.execution_id
            && !activity.execution_ids.contains(execution_id)
        {
            return Err(EnginesError::bad_request(format!(
                "Activity '{}' has no execution '{}'",
                request.id, execution_id
            )));
        }

        if require_running && !activity.is_running {
            return Err(EnginesError::bad_request(format!(
                "Activity '{}' is not running",
                request.id
            )));
        }

        let target = ActivityTarget {
            id: activity.id,
            execution_id: request.execution_id.clone(),
        };
        Ok((instance, target))
    }

    /// Deliver input to a running activity.
    #[instrument(skip(self, request, options), fields(activity = %request.id))]
    pub async fn signal_activity(
        &self,
        token: Uuid,
        request: ActivityRequest,
        options: ResumeOptions,
    ) -> Result<Instance<E>> {
        let (instance, target) = self.locate(token, &request, options, true).await?;
        instance
            .execution()
            .signal_activity(&target, request.message)?;
        debug!("Activity signalled");
        Ok(instance)
    }

    /// Cancel an activity.
    #[instrument(skip(self, request, options), fields(activity = %request.id))]
    pub async fn cancel_activity(
        &self,
        token: Uuid,
        request: ActivityRequest,
        options: ResumeOptions,
    ) -> Result<Instance<E>> {
        let (instance, target) = self.locate(token, &request, options, false).await?;
        instance
            .execution()
            .cancel_activity(&target, request.message)?;
        debug!("Activity cancelled");
        Ok(instance)
    }

    /// Fail an activity as if its underlying work had failed.
    #[instrument(skip(self, request, options), fields(activity = %request.id))]
    pub async fn fail_activity(
        &self,
        token: Uuid,
        request: ActivityRequest,
        options: ResumeOptions,
    ) -> Result<Instance<E>> {
        let (instance, target) = self.locate(token, &request, options, false).await?;
        instance
            .execution()
            .fail_activity(&target, request.message)?;
        debug!("Activity failed");
        Ok(instance)
    }

    /// Persisted status, without the recovery payload.
    pub async fn get_status_by_token(&self, token: Uuid) -> Result<ExecutionStatus> {
        self.inner
            .store
            .fetch_status(token)
            .await?
            .ok_or(EnginesError::NotFound { token })
    }

    /// Persisted state, including the recovery payload.
    pub async fn get_state_by_token(&self, token: Uuid) -> Result<ExecutionState> {
        self.inner
            .store
            .fetch_state(token)
            .await?
            .ok_or(EnginesError::NotFound { token })
    }

    /// Persisted executions flagged as running, with the query's other filters.
    pub async fn get_running(&self, query: StateQuery) -> Result<StateQueryResult> {
        let query = StateQuery {
            state: Some(RunState::Running),
            ..query
        };
        Ok(self.inner.store.query_states(&query).await?)
    }

    /// Resume and discard every running sub-process of the execution.
    #[instrument(skip(self, options))]
    pub async fn discard_by_token(&self, token: Uuid, options: ResumeOptions) -> Result<Instance<E>> {
        let instance = self.resume(token, options).await?;
        tokio::task::yield_now().await;
        instance.execution().discard_running()?;
        info!("Execution discarded");
        Ok(instance)
    }

    /// Force-stop the local copy of `token`. Returns whether one existed.
    ///
    /// Termination is process-local; nothing is persisted.
    #[instrument(skip(self))]
    pub fn terminate_by_token(&self, token: Uuid) -> bool {
        match self.inner.cache.get(&token) {
            Some(instance) => {
                self.teardown(&instance);
                info!("Execution terminated");
                true
            }
            None => false,
        }
    }

    /// Cleanly stop the local copy of `token`. Returns whether one existed.
    pub fn stop_by_token(&self, token: Uuid) -> bool {
        match self.inner.cache.get(&token) {
            Some(instance) => {
                instance.stop();
                true
            }
            None => false,
        }
    }

    /// Cleanly stop every local instance. Returns how many were stopped.
    pub fn stop_all(&self) -> usize {
        let instances = self.inner.cache.values();
        for instance in &instances {
            instance.stop();
        }
        info!(count = instances.len(), "Stopped all executions");
        instances.len()
    }

    /// Terminate any local copy and delete the snapshot.
    #[instrument(skip(self))]
    pub async fn delete_by_token(&self, token: Uuid) -> Result<bool> {
        let terminated = self.terminate_by_token(token);
        let deleted = self.inner.store.delete_state(token).await?;
        info!(terminated, deleted, "Execution deleted");
        Ok(terminated || deleted)
    }

    /// Live status of an in-memory instance.
    pub fn status_of(&self, instance: &Instance<E>) -> ExecutionStatus {
        instance.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::from_micros(999)), 0);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
