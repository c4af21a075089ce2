// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State Message Router.
//!
//! One router task per live instance consumes the execution's event
//! channel in order. It keeps the instance bookkeeping current, persists
//! snapshots, forwards call-activity requests to the coordinator and tears
//! the instance down on terminal events.
//!
//! Per message:
//! 1. Recovery replays are skipped without side effects.
//! 2. Bookkeeping is updated and the need to persist decided.
//! 3. Terminal events tear down the idle timer and cache entry first.
//! 4. The snapshot is written. A conditional write that finds no record is
//!    ignored; any other failure stops the instance and is reported as an
//!    `engine.error` notification.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::InstanceCache;
use crate::caller::CallerReference;
use crate::coordinator::CoordinatorEvent;
use crate::engine::{ActivityRef, EngineEvent, EngineEventReceiver, EngineMessage, ProcessExecution};
use crate::instance::ExecutionInstance;
use crate::notification::Notification;
use crate::persistence::{StateStore, StorageError};

/// Shared resources a router needs.
pub(crate) struct RouterContext<X> {
    pub store: Arc<dyn StateStore>,
    pub cache: Arc<InstanceCache<ExecutionInstance<X>>>,
    pub coordinator: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl<X> Clone for RouterContext<X> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cache: self.cache.clone(),
            coordinator: self.coordinator.clone(),
        }
    }
}

/// How a snapshot write is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Insert or replace.
    Upsert,
    /// Replace only if a record already exists.
    UpdateExisting,
}

enum Flow {
    Continue,
    Done,
}

/// Attach a router task to `instance`. No-op if one was already attached.
pub(crate) fn attach<X: ProcessExecution>(
    instance: &Arc<ExecutionInstance<X>>,
    context: RouterContext<X>,
) {
    let Some(events) = instance.take_events() else {
        return;
    };
    let handle = tokio::spawn(route(instance.clone(), events, context));
    instance.set_router(handle);
}

#[instrument(skip_all, fields(token = %instance.token()))]
async fn route<X: ProcessExecution>(
    instance: Arc<ExecutionInstance<X>>,
    mut events: EngineEventReceiver,
    context: RouterContext<X>,
) {
    while let Some(message) = events.recv().await {
        if message.recovered {
            debug!(event = message.event.kind(), "Skipping recovered event");
            continue;
        }

        if let Flow::Done = handle_message(&instance, &context, message).await {
            break;
        }
    }

    debug!("Router stopped");
}

async fn handle_message<X: ProcessExecution>(
    instance: &Arc<ExecutionInstance<X>>,
    context: &RouterContext<X>,
    message: EngineMessage,
) -> Flow {
    let EngineMessage {
        event, redelivered, ..
    } = message;
    debug!(event = event.kind(), redelivered, "Routing event");

    let autosave = instance.autosave();
    let write = match &event {
        EngineEvent::SaveState => Some(WriteMode::Upsert),
        EngineEvent::SetAutosave { enabled } => {
            instance.set_autosave(*enabled);
            enabled.then_some(WriteMode::Upsert)
        }
        EngineEvent::ActivityWait { .. } => autosave.then_some(WriteMode::Upsert),
        EngineEvent::ActivityEnd { .. } => {
            if !redelivered {
                instance.bump_sequence();
            }
            autosave.then_some(WriteMode::Upsert)
        }
        EngineEvent::ActivityTimer { expire_at, .. } => {
            instance.track_timer(*expire_at);
            autosave.then_some(WriteMode::Upsert)
        }
        EngineEvent::ActivityTimerCleared { .. } => {
            instance.refresh_expire_at();
            autosave.then_some(WriteMode::Upsert)
        }
        EngineEvent::CallActivityStart {
            activity,
            called_element,
            input,
        } => {
            forward(
                context,
                CoordinatorEvent::StartRequested {
                    parent: caller_of(instance, activity),
                    called_element: called_element.clone(),
                    input: input.clone(),
                },
            );
            None
        }
        EngineEvent::CallActivityCancel {
            activity,
            called_element,
        } => {
            forward(
                context,
                CoordinatorEvent::CancelRequested {
                    parent: caller_of(instance, activity),
                    called_element: called_element.clone(),
                },
            );
            None
        }
        EngineEvent::RunStop => autosave.then_some(WriteMode::Upsert),
        // A record left by an earlier save must not stay resumable.
        EngineEvent::RunEnd { .. } | EngineEvent::RunError { .. } => Some(if autosave {
            WriteMode::Upsert
        } else {
            WriteMode::UpdateExisting
        }),
    };

    let terminal = event.is_terminal();
    if terminal {
        teardown(instance, context);
    }

    if let Some(mode) = write
        && let Err(e) = persist(instance, context.store.as_ref(), mode).await
    {
        if mode == WriteMode::UpdateExisting && e.is_not_found() {
            debug!("No existing record to update, skipping");
        } else {
            error!(error = %e, event = event.kind(), "Failed to persist execution state");
            instance.cancel_idle_timer();
            instance.execution().stop();
            context.cache.remove_if_same(&instance.token(), instance);
            let status = instance.status();
            instance.notify(Notification::Error {
                status: status.clone(),
                error: format!("failed to persist state: {}", e),
            });
            instance.settle(status);
            return Flow::Done;
        }
    }

    if terminal {
        finish(instance, context, event);
        return Flow::Done;
    }

    Flow::Continue
}

/// Cancel the idle timer and drop the instance from the cache.
fn teardown<X: ProcessExecution>(
    instance: &Arc<ExecutionInstance<X>>,
    context: &RouterContext<X>,
) {
    instance.cancel_idle_timer();
    context.cache.remove_if_same(&instance.token(), instance);
}

async fn persist<X: ProcessExecution>(
    instance: &ExecutionInstance<X>,
    store: &dyn StateStore,
    mode: WriteMode,
) -> Result<(), StorageError> {
    let state = instance
        .snapshot()
        .map_err(|e| StorageError::Serialization(format!("engine state unavailable: {}", e)))?;

    match mode {
        WriteMode::Upsert => store.upsert_state(&state).await,
        WriteMode::UpdateExisting => store.update_state(&state).await,
    }?;

    debug!(
        sequence_number = state.status.sequence_number,
        state = %state.status.state,
        "Persisted execution state"
    );
    Ok(())
}

/// Publish the terminal notification and relay the outcome to a parent.
fn finish<X: ProcessExecution>(
    instance: &ExecutionInstance<X>,
    context: &RouterContext<X>,
    event: EngineEvent,
) {
    let status = instance.status();
    let child = instance.token();

    match event {
        EngineEvent::RunEnd { output, discarded } => {
            info!(sequence_number = status.sequence_number, discarded, "Execution ended");
            instance.notify(Notification::End {
                status: status.clone(),
                output: output.clone(),
            });
            if let Some(caller) = instance.caller() {
                if discarded {
                    debug!(parent = %caller.token, "Discarded child does not signal its parent");
                } else {
                    forward(
                        context,
                        CoordinatorEvent::ChildEnded {
                            caller: caller.clone(),
                            child,
                            output,
                        },
                    );
                }
            }
        }
        EngineEvent::RunStop => {
            info!(sequence_number = status.sequence_number, "Execution stopped");
            instance.notify(Notification::Stop {
                status: status.clone(),
            });
        }
        EngineEvent::RunError { error } => {
            warn!(error = %error, "Execution failed");
            instance.notify(Notification::Error {
                status: status.clone(),
                error: error.clone(),
            });
            if let Some(caller) = instance.caller() {
                forward(
                    context,
                    CoordinatorEvent::ChildFailed {
                        caller: caller.clone(),
                        child,
                        error,
                    },
                );
            }
        }
        _ => {}
    }

    instance.settle(status);
}

fn caller_of<X: ProcessExecution>(
    instance: &ExecutionInstance<X>,
    activity: &ActivityRef,
) -> CallerReference {
    let caller = CallerReference::new(
        instance.token(),
        instance.name(),
        &activity.id,
        &activity.activity_type,
        &activity.execution_id,
    );
    match activity.index {
        Some(index) => caller.with_index(index),
        None => caller,
    }
}

fn forward<X>(context: &RouterContext<X>, event: CoordinatorEvent) {
    if context.coordinator.send(event).is_err() {
        warn!("Call-activity coordinator is not running, dropping request");
    }
}
