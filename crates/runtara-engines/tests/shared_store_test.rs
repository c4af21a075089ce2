// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for several managers sharing one durable store.

mod common;

use std::sync::Arc;

use common::*;
use serde_json::json;

use runtara_engines::{
    ActivityRequest, Config, DeploymentOptions, EnginesError, MemoryStore, ResumeOptions,
    RunState, SqliteStore, StateStore,
};

#[tokio::test]
async fn test_execution_moves_between_processes() {
    let store = MemoryStore::new();
    let (_, first) = manager(Arc::new(store.clone()), test_config());
    let (second_engine, second) = manager(Arc::new(store), test_config());

    let instance = first
        .create(DeploymentOptions::new(process(
            "approval",
            json!([{ "id": "approve", "type": "userTask" }]),
        )))
        .unwrap();
    let token = instance.token();
    first.run(instance).await.unwrap();
    assert!(eventually(|| persisted_state_is(&first, token, RunState::Running)).await);

    assert!(first.stop_by_token(token));
    assert!(eventually(|| persisted_state_is(&first, token, RunState::Stopped)).await);

    second
        .signal_activity(
            token,
            ActivityRequest::new("approve"),
            ResumeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(second_engine.recoveries(), 1);
    assert!(eventually(|| persisted_state_is(&second, token, RunState::Idle)).await);

    let err = first
        .resume(token, ResumeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EnginesError::AlreadyCompleted { .. }));
}

#[tokio::test]
async fn test_stale_cached_copy_is_reloaded() {
    let store = MemoryStore::new();
    let (first_engine, first) = manager(Arc::new(store.clone()), test_config());
    let (_, second) = manager(Arc::new(store), test_config());

    let instance = first
        .create(DeploymentOptions::new(process(
            "two-step",
            json!([
                { "id": "draft", "type": "userTask" },
                { "id": "publish", "type": "userTask" }
            ]),
        )))
        .unwrap();
    let token = instance.token();
    let stale = first.run(instance).await.unwrap();
    assert!(eventually(|| persisted_state_is(&first, token, RunState::Running)).await);

    second
        .signal_activity(token, ActivityRequest::new("draft"), ResumeOptions::default())
        .await
        .unwrap();
    let observer = &first;
    assert!(
        eventually(|| async move {
            observer
                .get_status_by_token(token)
                .await
                .is_ok_and(|status| status.sequence_number == 1)
        })
        .await
    );

    assert_eq!(stale.sequence_number(), 0);
    let fresh = first.resume(token, ResumeOptions::default()).await.unwrap();

    assert!(!Arc::ptr_eq(&stale, &fresh));
    assert_eq!(fresh.sequence_number(), 1);
    assert_eq!(fresh.execution().position(), 1);
    assert_eq!(first_engine.recoveries(), 1);
    assert!(stale.settled().is_some());
}

#[tokio::test]
async fn test_cached_copy_completed_elsewhere_is_terminated() {
    let store = MemoryStore::new();
    let (_, first) = manager(Arc::new(store.clone()), test_config());
    let (_, second) = manager(Arc::new(store), test_config());

    let instance = first
        .create(DeploymentOptions::new(process(
            "approval",
            json!([{ "id": "approve", "type": "userTask" }]),
        )))
        .unwrap();
    let token = instance.token();
    first.run(instance).await.unwrap();
    assert!(eventually(|| persisted_state_is(&first, token, RunState::Running)).await);

    second
        .signal_activity(
            token,
            ActivityRequest::new("approve"),
            ResumeOptions::default(),
        )
        .await
        .unwrap();
    assert!(eventually(|| persisted_state_is(&second, token, RunState::Idle)).await);

    assert!(first.cached(token).is_some());
    let err = first
        .resume(token, ResumeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EnginesError::AlreadyCompleted { .. }));
    assert!(first.cached(token).is_none());
}

#[tokio::test]
async fn test_sqlite_file_shared_by_two_managers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engines.db");

    let first_store: Arc<dyn StateStore> = Arc::new(SqliteStore::from_path(&path).await.unwrap());
    let second_store: Arc<dyn StateStore> =
        Arc::new(SqliteStore::from_path(&path).await.unwrap());
    let (_, first) = manager(first_store, test_config());
    let (_, second) = manager(second_store, test_config());

    let mut variables = serde_json::Map::new();
    variables.insert("customer".to_string(), json!("acme"));
    let instance = first
        .create(
            DeploymentOptions::new(process(
                "approval",
                json!([{ "id": "approve", "type": "userTask" }]),
            ))
            .with_variables(variables),
        )
        .unwrap();
    let token = instance.token();
    first.run(instance).await.unwrap();
    assert!(eventually(|| persisted_state_is(&first, token, RunState::Running)).await);
    first.stop_by_token(token);
    assert!(eventually(|| persisted_state_is(&second, token, RunState::Stopped)).await);

    second
        .signal_activity(
            token,
            ActivityRequest::new("approve").with_message(json!({ "ok": true })),
            ResumeOptions::default(),
        )
        .await
        .unwrap();
    assert!(eventually(|| persisted_state_is(&first, token, RunState::Idle)).await);

    let state = first.get_state_by_token(token).await.unwrap();
    assert_eq!(state.engine["variables"]["customer"], json!("acme"));
    assert_eq!(state.engine["variables"]["ok"], json!(true));
}

#[tokio::test]
async fn test_eviction_stops_and_persists() {
    let config = Config {
        cache_capacity: 1,
        ..test_config()
    };
    let (_, engines) = manager(Arc::new(MemoryStore::new()), config);
    let steps = json!([{ "id": "wait", "type": "userTask" }]);

    let first = engines
        .create(DeploymentOptions::new(process("a", steps.clone())))
        .unwrap();
    let first_token = first.token();
    engines.run(first).await.unwrap();

    let second = engines
        .create(DeploymentOptions::new(process("b", steps)))
        .unwrap();
    let second_token = second.token();
    engines.run(second).await.unwrap();

    assert_eq!(engines.cached_count(), 1);
    assert!(engines.cached(first_token).is_none());
    assert!(engines.cached(second_token).is_some());
    assert!(eventually(|| persisted_state_is(&engines, first_token, RunState::Stopped)).await);

    let resumed = engines
        .resume(first_token, ResumeOptions::default())
        .await
        .unwrap();
    assert_eq!(resumed.token(), first_token);
    assert!(engines.cached(second_token).is_none());
}

#[tokio::test]
async fn test_query_running_by_name() {
    let (_, engines) = manager(Arc::new(MemoryStore::new()), test_config());
    let steps = json!([{ "id": "wait", "type": "userTask" }]);

    let mut tokens = Vec::new();
    for _ in 0..3 {
        let instance = engines
            .create(DeploymentOptions::new(process("batch", steps.clone())))
            .unwrap();
        tokens.push(instance.token());
        engines.run(instance).await.unwrap();
    }
    let other = engines
        .create(DeploymentOptions::new(process("other", steps)))
        .unwrap();
    engines.run(other).await.unwrap();

    for token in &tokens {
        assert!(eventually(|| persisted_state_is(&engines, *token, RunState::Running)).await);
    }

    let query = runtara_engines::StateQuery {
        name: Some("batch".to_string()),
        ..runtara_engines::StateQuery::default()
    };
    let result = engines.get_running(query).await.unwrap();
    assert_eq!(result.total, 3);
    assert!(result.records.iter().all(|status| status.name == "batch"));
}

#[tokio::test]
async fn test_concurrent_resume_reconstructs_once() {
    let (engine, engines) = manager(Arc::new(MemoryStore::new()), test_config());

    let instance = engines
        .create(DeploymentOptions::new(process(
            "approval",
            json!([{ "id": "approve", "type": "userTask" }]),
        )))
        .unwrap();
    let token = instance.token();
    engines.run(instance).await.unwrap();
    assert!(eventually(|| persisted_state_is(&engines, token, RunState::Running)).await);
    assert!(engines.stop_by_token(token));
    assert!(eventually(|| persisted_state_is(&engines, token, RunState::Stopped)).await);

    let resumes = (0..8).map(|_| engines.resume(token, ResumeOptions::default()));
    let resumed = futures::future::join_all(resumes).await;

    let first = resumed[0].as_ref().unwrap();
    for instance in &resumed {
        assert!(Arc::ptr_eq(first, instance.as_ref().unwrap()));
    }
    assert_eq!(engine.recoveries(), 1);
    assert_eq!(engines.cached_count(), 1);
}

#[tokio::test]
async fn test_resume_waits_for_evicted_copy_to_stop() {
    let config = Config {
        cache_capacity: 1,
        ..test_config()
    };
    let (engine, engines) = manager(Arc::new(MemoryStore::new()), config);
    let steps = json!([{ "id": "wait", "type": "userTask" }]);

    let first = engines
        .create(DeploymentOptions::new(process("a", steps.clone())))
        .unwrap();
    let first_token = first.token();
    let first = engines.run(first).await.unwrap();

    let second = engines
        .create(DeploymentOptions::new(process("b", steps)))
        .unwrap();
    engines.run(second).await.unwrap();
    assert!(engines.cached(first_token).is_none());

    let resumed = engines
        .resume(first_token, ResumeOptions::default())
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&first, &resumed));
    assert_eq!(
        first.settled().map(|status| status.state),
        Some(RunState::Stopped)
    );
    assert_eq!(engine.recoveries(), 1);
    assert!(Arc::ptr_eq(&engines.cached(first_token).unwrap(), &resumed));
}
