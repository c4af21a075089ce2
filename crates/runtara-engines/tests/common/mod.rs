// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for runtara-engines integration tests.
//!
//! Provides a scripted Execution Engine that walks a linear list of steps,
//! plus helpers for building managers and waiting on asynchronous effects.

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use runtara_engines::{
    ActivityInfo, ActivityRef, ActivityStatus, ActivityTarget, Config, Deployment, EngineError,
    EngineEvent, EngineEventSender, EngineMessage, Engines, ExecutionSettings, ExecutionState,
    ExecutionStatus, MemoryStore, Notification, PendingTimer, PostponedActivity, ProcessEngine,
    ProcessExecution, ProcessSource, RunState, StateQuery, StateQueryResult, StateStore,
    StorageError,
};

/// Helper macro to skip tests if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

// ============================================================================
// Scripted Engine
// ============================================================================

/// Kind of a scripted step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    /// Completes immediately.
    Task,
    /// Waits for a signal.
    UserTask,
    /// Waits for a signal while reporting `executing`.
    ServiceTask,
    /// Waits `delayMs`, then completes.
    Timer,
    /// Requests a child execution and waits for a signal.
    CallActivity,
    /// Fails the run.
    Error,
    /// Asks for a snapshot, then completes.
    Save,
    /// Switches autosave to `enabled`, then completes.
    Autosave,
}

impl StepKind {
    fn bpmn_type(self) -> &'static str {
        match self {
            Self::Task => "bpmn:Task",
            Self::UserTask => "bpmn:UserTask",
            Self::ServiceTask => "bpmn:ServiceTask",
            Self::Timer => "bpmn:IntermediateCatchEvent",
            Self::CallActivity => "bpmn:CallActivity",
            Self::Error => "bpmn:EndEvent",
            Self::Save | Self::Autosave => "bpmn:ScriptTask",
        }
    }
}

/// One scripted step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub called_element: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Autosave value for `autosave` steps.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Deliver the task's completion twice, the second time flagged as a redelivery.
    #[serde(default)]
    pub redeliver: bool,
    /// Request the child again when the call activity is replayed.
    #[serde(default)]
    pub reissue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Script {
    steps: Vec<Step>,
    #[serde(default)]
    fail_on_execute: bool,
}

/// Recovery payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Progress {
    script: Script,
    position: usize,
    variables: serde_json::Map<String, Value>,
    execution_id: Option<String>,
    timer_expire_at: Option<DateTime<Utc>>,
    counter: u64,
}

struct Machine {
    progress: Progress,
    state: RunState,
    waiting: bool,
}

impl Machine {
    fn current(&self) -> Option<&Step> {
        self.progress.script.steps.get(self.progress.position)
    }

    fn current_ref(&self) -> Option<ActivityRef> {
        let step = self.current()?;
        Some(ActivityRef {
            id: step.id.clone(),
            activity_type: step.kind.bpmn_type().to_string(),
            execution_id: self.progress.execution_id.clone().unwrap_or_default(),
            index: None,
        })
    }

    fn waiting_on(&self, target: &ActivityTarget) -> Option<(Step, ActivityRef)> {
        if self.state != RunState::Running || !self.waiting {
            return None;
        }
        let step = self.current()?.clone();
        if step.id != target.id {
            return None;
        }
        if let Some(execution_id) = &target.execution_id
            && self.progress.execution_id.as_ref() != Some(execution_id)
        {
            return None;
        }
        let activity = self.current_ref()?;
        Some((step, activity))
    }

    fn leave_current(&mut self) {
        self.waiting = false;
        self.progress.position += 1;
        self.progress.execution_id = None;
        self.progress.timer_expire_at = None;
    }
}

struct Shared {
    machine: Mutex<Machine>,
    events: EngineEventSender,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn machine(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap()
    }

    fn send(&self, event: EngineEvent, replay: bool) {
        let message = if replay {
            EngineMessage::recovered(event)
        } else {
            EngineMessage::new(event)
        };
        let _ = self.events.send(message);
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Walk steps until the script waits, fails or ends.
fn advance(shared: &Arc<Shared>, mut replay: bool) {
    let mut m = shared.machine();
    loop {
        if m.state != RunState::Running {
            return;
        }

        let Some(step) = m.current().cloned() else {
            m.state = RunState::Idle;
            m.waiting = false;
            let output = Value::Object(m.progress.variables.clone());
            shared.send(
                EngineEvent::RunEnd {
                    output,
                    discarded: false,
                },
                false,
            );
            return;
        };

        let replayed = if replay {
            m.progress.execution_id.clone()
        } else {
            None
        };
        let execution_id = match replayed {
            Some(id) => id,
            None => {
                m.progress.counter += 1;
                let id = format!("{}_{}", step.id, m.progress.counter);
                m.progress.execution_id = Some(id.clone());
                id
            }
        };
        let activity = ActivityRef {
            id: step.id.clone(),
            activity_type: step.kind.bpmn_type().to_string(),
            execution_id,
            index: None,
        };

        match step.kind {
            StepKind::Task => {
                if step.redeliver {
                    shared.send(
                        EngineEvent::ActivityEnd {
                            activity: activity.clone(),
                        },
                        false,
                    );
                    let _ = shared
                        .events
                        .send(EngineMessage::redelivered(EngineEvent::ActivityEnd { activity }));
                } else {
                    shared.send(EngineEvent::ActivityEnd { activity }, false);
                }
                m.leave_current();
                replay = false;
            }
            StepKind::Save => {
                shared.send(EngineEvent::SaveState, false);
                m.leave_current();
                replay = false;
            }
            StepKind::Autosave => {
                shared.send(
                    EngineEvent::SetAutosave {
                        enabled: step.enabled.unwrap_or(true),
                    },
                    false,
                );
                m.leave_current();
                replay = false;
            }
            StepKind::UserTask | StepKind::ServiceTask => {
                m.waiting = true;
                shared.send(EngineEvent::ActivityWait { activity }, replay);
                return;
            }
            StepKind::CallActivity => {
                m.waiting = true;
                shared.send(
                    EngineEvent::CallActivityStart {
                        activity: activity.clone(),
                        called_element: step.called_element.clone().unwrap_or_default(),
                        input: m.progress.variables.clone(),
                    },
                    replay && !step.reissue,
                );
                shared.send(EngineEvent::ActivityWait { activity }, replay);
                return;
            }
            StepKind::Timer => {
                let expire_at = match (replay, m.progress.timer_expire_at) {
                    (true, Some(expire_at)) => expire_at,
                    _ => {
                        Utc::now()
                            + chrono::Duration::milliseconds(step.delay_ms.unwrap_or(0) as i64)
                    }
                };
                m.progress.timer_expire_at = Some(expire_at);
                m.waiting = true;
                shared.send(
                    EngineEvent::ActivityTimer {
                        activity,
                        expire_at,
                    },
                    replay,
                );
                arm_timer(shared, expire_at);
                return;
            }
            StepKind::Error => {
                m.state = RunState::Error;
                m.waiting = false;
                shared.send(
                    EngineEvent::RunError {
                        error: step.message.clone().unwrap_or_else(|| "scripted error".into()),
                    },
                    false,
                );
                return;
            }
        }
    }
}

fn arm_timer(shared: &Arc<Shared>, expire_at: DateTime<Utc>) {
    let delay = (expire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    let weak = Arc::downgrade(shared);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(shared) = weak.upgrade() {
            fire_timer(&shared);
        }
    });
    if let Some(previous) = shared.timer.lock().unwrap().replace(handle) {
        previous.abort();
    }
}

fn fire_timer(shared: &Arc<Shared>) {
    {
        let mut m = shared.machine();
        let on_timer = m
            .current()
            .is_some_and(|step| step.kind == StepKind::Timer);
        if m.state != RunState::Running || !m.waiting || !on_timer {
            return;
        }
        let Some(activity) = m.current_ref() else {
            return;
        };
        m.leave_current();
        shared.send(
            EngineEvent::ActivityTimerCleared {
                activity: activity.clone(),
            },
            false,
        );
        shared.send(EngineEvent::ActivityEnd { activity }, false);
    }
    advance(shared, false);
}

/// Execution handle of the scripted engine.
pub struct ScriptedExecution {
    shared: Arc<Shared>,
}

impl ScriptedExecution {
    fn new(progress: Progress, state: RunState, events: EngineEventSender) -> Self {
        Self {
            shared: Arc::new(Shared {
                machine: Mutex::new(Machine {
                    progress,
                    state,
                    waiting: false,
                }),
                events,
                timer: Mutex::new(None),
            }),
        }
    }

    /// Current step position.
    pub fn position(&self) -> usize {
        self.shared.machine().progress.position
    }
}

#[async_trait]
impl ProcessExecution for ScriptedExecution {
    async fn execute(&self) -> Result<(), EngineError> {
        {
            let mut m = self.shared.machine();
            if m.progress.script.fail_on_execute {
                return Err(EngineError::new("scripted execute failure"));
            }
            if m.state == RunState::Running {
                return Err(EngineError::new("already running"));
            }
            m.state = RunState::Running;
        }
        advance(&self.shared, false);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        {
            let mut m = self.shared.machine();
            if m.state == RunState::Running {
                return Ok(());
            }
            m.state = RunState::Running;
        }
        advance(&self.shared, true);
        Ok(())
    }

    fn stop(&self) {
        {
            let mut m = self.shared.machine();
            if m.state != RunState::Running {
                return;
            }
            m.state = RunState::Stopped;
            self.shared.send(EngineEvent::RunStop, false);
        }
        self.shared.cancel_timer();
    }

    fn state(&self) -> RunState {
        self.shared.machine().state
    }

    fn activity_status(&self) -> ActivityStatus {
        let m = self.shared.machine();
        if m.state != RunState::Running || !m.waiting {
            return ActivityStatus::Idle;
        }
        match m.current().map(|step| step.kind) {
            Some(StepKind::UserTask) | Some(StepKind::CallActivity) => ActivityStatus::Wait,
            Some(StepKind::ServiceTask) => ActivityStatus::Executing,
            Some(StepKind::Timer) => ActivityStatus::Timer,
            _ => ActivityStatus::Idle,
        }
    }

    fn postponed(&self) -> Vec<PostponedActivity> {
        let m = self.shared.machine();
        if !m.waiting {
            return Vec::new();
        }
        m.current()
            .map(|step| {
                let mut postponed = PostponedActivity::new(&step.id, step.kind.bpmn_type());
                postponed.execution_id = m.progress.execution_id.clone();
                vec![postponed]
            })
            .unwrap_or_default()
    }

    fn pending_timers(&self) -> Vec<PendingTimer> {
        let m = self.shared.machine();
        match (m.current(), m.progress.timer_expire_at) {
            (Some(step), Some(expire_at)) if m.waiting && step.kind == StepKind::Timer => {
                vec![PendingTimer {
                    activity_id: step.id.clone(),
                    expire_at,
                }]
            }
            _ => Vec::new(),
        }
    }

    fn recovery_state(&self) -> Result<Value, EngineError> {
        serde_json::to_value(&self.shared.machine().progress)
            .map_err(|e| EngineError::new(e.to_string()))
    }

    fn output(&self) -> Value {
        Value::Object(self.shared.machine().progress.variables.clone())
    }

    fn find_activity(&self, activity_id: &str) -> Option<ActivityInfo> {
        let m = self.shared.machine();
        let running = m.state == RunState::Running
            && m.waiting
            && m.current().is_some_and(|step| step.id == activity_id);
        let step = m
            .progress
            .script
            .steps
            .iter()
            .find(|step| step.id == activity_id)?;
        Some(ActivityInfo {
            id: step.id.clone(),
            activity_type: step.kind.bpmn_type().to_string(),
            is_running: running,
            execution_ids: if running {
                m.progress.execution_id.clone().into_iter().collect()
            } else {
                Vec::new()
            },
        })
    }

    fn signal_activity(&self, target: &ActivityTarget, message: Value) -> Result<(), EngineError> {
        {
            let mut m = self.shared.machine();
            let (_, activity) = m
                .waiting_on(target)
                .ok_or_else(|| EngineError::new(format!("activity '{}' is not waiting", target.id)))?;
            if let Value::Object(input) = message {
                m.progress.variables.extend(input);
            }
            m.leave_current();
            self.shared.send(EngineEvent::ActivityEnd { activity }, false);
        }
        self.shared.cancel_timer();
        advance(&self.shared, false);
        Ok(())
    }

    fn cancel_activity(&self, target: &ActivityTarget, _message: Value) -> Result<(), EngineError> {
        {
            let mut m = self.shared.machine();
            let (step, activity) = m
                .waiting_on(target)
                .ok_or_else(|| EngineError::new(format!("activity '{}' is not waiting", target.id)))?;
            if step.kind == StepKind::CallActivity {
                self.shared.send(
                    EngineEvent::CallActivityCancel {
                        activity: activity.clone(),
                        called_element: step.called_element.clone().unwrap_or_default(),
                    },
                    false,
                );
            }
            m.leave_current();
            self.shared.send(EngineEvent::ActivityEnd { activity }, false);
        }
        self.shared.cancel_timer();
        advance(&self.shared, false);
        Ok(())
    }

    fn fail_activity(&self, target: &ActivityTarget, error: Value) -> Result<(), EngineError> {
        {
            let mut m = self.shared.machine();
            m.waiting_on(target)
                .ok_or_else(|| EngineError::new(format!("activity '{}' is not waiting", target.id)))?;
            m.state = RunState::Error;
            m.waiting = false;
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            self.shared
                .send(EngineEvent::RunError { error: message }, false);
        }
        self.shared.cancel_timer();
        Ok(())
    }

    fn discard_running(&self) -> Result<(), EngineError> {
        {
            let mut m = self.shared.machine();
            if m.state != RunState::Running {
                return Err(EngineError::new("not running"));
            }
            m.state = RunState::Idle;
            m.waiting = false;
            let output = Value::Object(m.progress.variables.clone());
            self.shared.send(
                EngineEvent::RunEnd {
                    output,
                    discarded: true,
                },
                false,
            );
        }
        self.shared.cancel_timer();
        Ok(())
    }
}

/// Execution Engine that runs scripted step lists.
#[derive(Clone, Default)]
pub struct ScriptedEngine {
    loads: Arc<AtomicUsize>,
    recoveries: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    /// Number of executions built from a definition.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of executions reconstructed from a snapshot.
    pub fn recoveries(&self) -> usize {
        self.recoveries.load(Ordering::SeqCst)
    }
}

impl ProcessEngine for ScriptedEngine {
    type Execution = ScriptedExecution;

    fn load(
        &self,
        source: &ProcessSource,
        settings: &ExecutionSettings,
        events: EngineEventSender,
    ) -> Result<ScriptedExecution, EngineError> {
        let script: Script = serde_json::from_str(&source.source)
            .map_err(|e| EngineError::new(format!("invalid definition: {}", e)).with_code("EPARSE"))?;
        self.loads.fetch_add(1, Ordering::SeqCst);

        let progress = Progress {
            script,
            position: 0,
            variables: settings.variables.clone(),
            execution_id: None,
            timer_expire_at: None,
            counter: 0,
        };
        Ok(ScriptedExecution::new(progress, RunState::Idle, events))
    }

    fn recover(
        &self,
        state: &Value,
        _settings: &ExecutionSettings,
        events: EngineEventSender,
    ) -> Result<ScriptedExecution, EngineError> {
        let progress: Progress = serde_json::from_value(state.clone())
            .map_err(|e| EngineError::new(format!("invalid recovery state: {}", e)))?;
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedExecution::new(progress, RunState::Stopped, events))
    }
}

// ============================================================================
// Failing Store
// ============================================================================

/// In-memory store whose state writes can be made to fail.
#[derive(Clone, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: Arc<AtomicBool>,
}

impl FailingStore {
    /// Store whose state writes fail from the start.
    pub fn failing() -> Self {
        let store = Self::default();
        store.set_failing(true);
        store
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self, operation: &str) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Database {
                operation: operation.to_string(),
                details: "disk full".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FailingStore {
    async fn upsert_state(&self, state: &ExecutionState) -> Result<(), StorageError> {
        self.check("upsert_state")?;
        self.inner.upsert_state(state).await
    }

    async fn update_state(&self, state: &ExecutionState) -> Result<(), StorageError> {
        self.check("update_state")?;
        self.inner.update_state(state).await
    }

    async fn fetch_state(&self, token: Uuid) -> Result<Option<ExecutionState>, StorageError> {
        self.inner.fetch_state(token).await
    }

    async fn fetch_status(&self, token: Uuid) -> Result<Option<ExecutionStatus>, StorageError> {
        self.inner.fetch_status(token).await
    }

    async fn delete_state(&self, token: Uuid) -> Result<bool, StorageError> {
        self.inner.delete_state(token).await
    }

    async fn query_states(&self, query: &StateQuery) -> Result<StateQueryResult, StorageError> {
        self.inner.query_states(query).await
    }

    async fn upsert_deployment(&self, deployment: &Deployment) -> Result<(), StorageError> {
        self.inner.upsert_deployment(deployment).await
    }

    async fn fetch_deployment(&self, name: &str) -> Result<Option<Deployment>, StorageError> {
        self.inner.fetch_deployment(name).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Install a test subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Build a process source from a list of steps.
pub fn process(name: &str, steps: Value) -> ProcessSource {
    ProcessSource {
        name: name.to_string(),
        source: json!({ "steps": steps }).to_string(),
    }
}

/// Definition source string for deployments.
pub fn definition(steps: Value) -> String {
    json!({ "steps": steps }).to_string()
}

/// Configuration with a long idle timeout so nothing is suspended by accident.
pub fn test_config() -> Config {
    Config {
        idle_timeout: Duration::from_secs(600),
        run_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

/// Build a manager over a scripted engine.
pub fn manager(
    store: Arc<dyn StateStore>,
    config: Config,
) -> (ScriptedEngine, Engines<ScriptedEngine>) {
    let engine = ScriptedEngine::default();
    let engines = Engines::new(engine.clone(), store, config);
    (engine, engines)
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a notification with `topic`, optionally for one token.
pub async fn wait_for_topic(
    rx: &mut broadcast::Receiver<Notification>,
    topic: &str,
    token: Option<Uuid>,
) -> Option<Notification> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(notification)
                    if notification.topic() == topic
                        && token.is_none_or(|t| notification.token() == Some(t)) =>
                {
                    return Some(notification);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Whether the persisted state of `token` is `state`.
pub async fn persisted_state_is(
    engines: &Engines<ScriptedEngine>,
    token: Uuid,
    state: RunState,
) -> bool {
    engines
        .get_status_by_token(token)
        .await
        .is_ok_and(|status| status.state == state)
}
