// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for stagehand-core integration tests.
//!
//! Provides TestContext wiring an engine to in-memory backends, plus helpers to seed
//! config rows and to pump queued triggers back through the engine.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use serde_json::Value;

use stagehand_core::dispatch::{DispatchedMessage, MemoryDispatcher};
use stagehand_core::engine::{EngineConfig, WORKFLOW_TOPIC};
use stagehand_core::model::{
    ConfigHolder, ModuleConfig, ModuleExecution, ResultMessage, StageConfig, StageExecution,
    TriggerBody,
};
use stagehand_core::persistence::{ExecutionStore, MemoryExecutionStore};
use stagehand_core::state_store::MemoryStateStore;
use stagehand_core::storage::StreamStorage;
use stagehand_core::{StageEngine, StageResult, StatusUid, WorkerRegistry};

pub const TRANSACTION: &str = "t-1";

/// Engine plus handles on every in-memory backend it uses.
pub struct TestContext {
    pub store: Arc<MemoryExecutionStore>,
    pub state: Arc<MemoryStateStore>,
    pub dispatcher: Arc<MemoryDispatcher>,
    pub engine: Arc<StageEngine>,
    cursor: Mutex<usize>,
}

impl TestContext {
    pub fn new(registry: WorkerRegistry) -> Self {
        Self::build(registry, EngineConfig::default(), None)
    }

    pub fn with_config(registry: WorkerRegistry, config: EngineConfig) -> Self {
        Self::build(registry, config, None)
    }

    pub fn with_storage(registry: WorkerRegistry, storage: Arc<dyn StreamStorage>) -> Self {
        Self::build(registry, EngineConfig::default(), Some(storage))
    }

    fn build(
        registry: WorkerRegistry,
        config: EngineConfig,
        storage: Option<Arc<dyn StreamStorage>>,
    ) -> Self {
        let store = Arc::new(MemoryExecutionStore::new());
        let state = Arc::new(MemoryStateStore::new());
        let dispatcher = Arc::new(MemoryDispatcher::new());

        let mut builder = StageEngine::builder()
            .executions(store.clone())
            .state(state.clone())
            .dispatcher(dispatcher.clone())
            .registry(registry)
            .config(config);
        if let Some(storage) = storage {
            builder = builder.storage(storage);
        }

        Self {
            store,
            state,
            dispatcher,
            engine: Arc::new(builder.build().expect("engine should build")),
            cursor: Mutex::new(0),
        }
    }

    /// Seed a module execution and module config for `module_uid`, returning the config id.
    pub fn seed_module(&self, module_uid: &str) -> i64 {
        self.store
            .insert_module_execution(ModuleExecution {
                id: 0,
                module_uid: module_uid.to_string(),
                transaction_uid: TRANSACTION.to_string(),
                project_uid: None,
                date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                parent_id: None,
            })
            .unwrap();
        self.store
            .insert_module_config(ModuleConfig {
                module_uid: module_uid.to_string(),
                ..Default::default()
            })
            .unwrap()
    }

    /// Seed a stage config row with the given config object.
    pub fn seed_stage(&self, module_config_id: i64, stage_uid: &str, config: Value) -> i64 {
        self.store
            .insert_stage_config(StageConfig {
                module_config_id,
                stage_uid: stage_uid.to_string(),
                holder: ConfigHolder::with_config(config.as_object().cloned().unwrap_or_default()),
                ..Default::default()
            })
            .unwrap()
    }

    /// Create the initial row the caller layer would have created before triggering.
    pub async fn seed_row(&self, stage_uid: &str) -> StageExecution {
        self.store
            .create_execution(&StageExecution {
                transaction_uid: TRANSACTION.to_string(),
                stage_uid: stage_uid.to_string(),
                status_uid: StatusUid::Initial,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    /// Rows of `stage_uid`, in creation order.
    pub fn rows(&self, stage_uid: &str) -> Vec<StageExecution> {
        self.store
            .executions()
            .into_iter()
            .filter(|row| row.stage_uid == stage_uid)
            .collect()
    }

    /// Stage triggers sent since the last call (everything not on the control topic).
    pub fn take_triggers(&self) -> Vec<(String, TriggerBody)> {
        let messages = self.dispatcher.messages();
        let mut cursor = self.cursor.lock().unwrap();
        let fresh = messages[*cursor..].to_vec();
        *cursor = messages.len();
        fresh
            .into_iter()
            .filter(|m| m.topic != WORKFLOW_TOPIC)
            .map(|m| (m.topic, serde_json::from_value(m.body).unwrap()))
            .collect()
    }

    /// Control-topic results sent so far, parsed.
    pub fn results(&self) -> Vec<ResultMessage> {
        self.dispatcher
            .to_topic(WORKFLOW_TOPIC)
            .into_iter()
            .map(|m: DispatchedMessage| serde_json::from_value(m.body).unwrap())
            .collect()
    }

    /// Control-topic results of one stage.
    pub fn results_of(&self, stage_uid: &str) -> Vec<StageResult> {
        self.results()
            .into_iter()
            .filter(|m| m.stage_uid == stage_uid)
            .map(|m| m.result)
            .collect()
    }
}

/// Minimal trigger body for `stage_uid` in the test transaction.
pub fn trigger(stage_uid: &str) -> TriggerBody {
    TriggerBody {
        stage_uid: stage_uid.to_string(),
        transaction_uid: TRANSACTION.to_string(),
        ..Default::default()
    }
}
