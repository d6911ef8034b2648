// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E test of a split stage running against the SQLite execution and state stores.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;

use stagehand_core::dispatch::ChannelDispatcher;
use stagehand_core::engine::WORKFLOW_TOPIC;
use stagehand_core::migrations;
use stagehand_core::model::{
    ConfigHolder, ModuleConfig, ModuleExecution, ProjectConfig, ResultMessage, StageConfig,
    StageExecution, TriggerBody,
};
use stagehand_core::persistence::{ExecutionStore, SqliteExecutionStore};
use stagehand_core::state_store::{SqliteStateStore, StateStore};
use stagehand_core::{SplitKeys, StageEngine, StatusUid, WorkerRegistry};

async fn stores() -> (Arc<SqliteExecutionStore>, Arc<SqliteStateStore>) {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory SQLite");
    migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    (
        Arc::new(SqliteExecutionStore::new(pool.clone())),
        Arc::new(SqliteStateStore::new(pool)),
    )
}

#[tokio::test]
async fn test_split_round_trip_on_sqlite() {
    let (store, state) = stores().await;

    store
        .insert_project_config(&ProjectConfig {
            id: 0,
            project_uid: "p1".to_string(),
            holder: ConfigHolder::with_config(
                json!({"bulkLimit": 5}).as_object().cloned().unwrap(),
            ),
        })
        .await
        .unwrap();
    let module_config_id = store
        .insert_module_config(&ModuleConfig {
            id: 0,
            module_uid: "m1".to_string(),
            project_uid: Some("p1".to_string()),
            holder: ConfigHolder::default(),
        })
        .await
        .unwrap();
    store
        .insert_module_execution(&ModuleExecution {
            id: 0,
            module_uid: "m1".to_string(),
            transaction_uid: "t-9".to_string(),
            project_uid: Some("p1".to_string()),
            date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            parent_id: None,
        })
        .await
        .unwrap();
    for (stage_uid, config) in [
        ("m1/split", json!({"childStage": "m1/load", "count": 12})),
        ("m1/load", json!({})),
    ] {
        store
            .insert_stage_config(&StageConfig {
                id: 0,
                module_config_id,
                stage_uid: stage_uid.to_string(),
                holder: ConfigHolder::with_config(config.as_object().cloned().unwrap()),
            })
            .await
            .unwrap();
    }

    let parent = store
        .create_execution(&StageExecution {
            transaction_uid: "t-9".to_string(),
            stage_uid: "m1/split".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let (dispatcher, mut outbox) = ChannelDispatcher::channel();
    let engine = StageEngine::builder()
        .executions(store.clone())
        .state(state.clone())
        .dispatcher(Arc::new(dispatcher))
        .registry(WorkerRegistry::new())
        .build()
        .unwrap();

    // Pump the queue until it drains, like the worker binary does
    let mut queue = VecDeque::from([TriggerBody {
        stage_uid: "m1/split".to_string(),
        transaction_uid: "t-9".to_string(),
        project_uid: Some("p1".to_string()),
        ..Default::default()
    }]);
    let mut results: Vec<ResultMessage> = Vec::new();
    while let Some(body) = queue.pop_front() {
        engine.initialize(body).await;
        while let Ok(message) = outbox.try_recv() {
            if message.topic == WORKFLOW_TOPIC {
                results.push(serde_json::from_value(message.body).unwrap());
            } else {
                queue.push_back(serde_json::from_value(message.body).unwrap());
            }
        }
    }

    // bulkLimit=5 comes from the project layer: 12 items => 3 children
    let children: Vec<_> = results.iter().filter(|m| m.stage_uid == "m1/load").collect();
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|m| m.result.status_uid == StatusUid::Done));

    let parent_results: Vec<_> = results
        .iter()
        .filter(|m| m.stage_uid == "m1/split")
        .map(|m| m.result.status_uid)
        .collect();
    assert_eq!(parent_results.first(), Some(&StatusUid::Waiting));
    assert_eq!(parent_results.last(), Some(&StatusUid::Done));

    let stored = store
        .find_latest_execution("t-9", "m1/split", "", 0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.id, parent.id);
    assert_eq!(stored.status_uid, StatusUid::Done);
    assert!(stored.system.finished_at.is_some());

    let keys = SplitKeys::new(parent.id, "m1/load");
    assert_eq!(
        state.get_value(&keys.status()).await.unwrap().as_deref(),
        Some("DONE")
    );
    assert!(state.get_value(&keys.length()).await.unwrap().is_none());
    assert!(state.get_array(&keys.process()).await.unwrap().is_empty());
}
