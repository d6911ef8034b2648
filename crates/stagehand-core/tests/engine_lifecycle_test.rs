// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the stage execution lifecycle: loading, hooks, errors and propagation.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::*;
use serde_json::{Value, json};

use stagehand_core::dispatch::{Dispatcher, MemoryDispatcher, SendOptions};
use stagehand_core::engine::{EngineConfig, WORKFLOW_TOPIC};
use stagehand_core::model::{ExecutionErrorEntry, ParentRef, ResultMessage, StageExecution};
use stagehand_core::persistence::{ExecutionStore, MemoryExecutionStore};
use stagehand_core::state_store::{MemoryStateStore, StateStore};
use stagehand_core::{
    CoreError, Result, SplitKeys, StageEngine, StageExecutionContext, StageResult, StageWorker,
    StatusUid, WorkerRegistry,
};

/// Records the hooks it sees, in order.
#[derive(Clone, Default)]
struct Recorder {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl Recorder {
    fn push(&self, hook: &'static str) {
        self.calls.lock().unwrap().push(hook);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StageWorker for Recorder {
    async fn on_initialize(&self, _ctx: &mut StageExecutionContext) -> Result<()> {
        self.push("on_initialize");
        Ok(())
    }

    async fn on_before_execute(&self, _ctx: &mut StageExecutionContext) -> Result<()> {
        self.push("on_before_execute");
        Ok(())
    }

    async fn execute(&self, ctx: &mut StageExecutionContext) -> Result<StageResult> {
        self.push("execute");
        assert_eq!(ctx.execution().status_uid, StatusUid::Process);
        ctx.stack_trigger("m2/next", json!({"from": ctx.stage_uid()}));
        Ok(StageResult::done())
    }

    async fn on_before_result(
        &self,
        _ctx: &mut StageExecutionContext,
        result: &mut StageResult,
    ) -> Result<()> {
        self.push("on_before_result");
        result.info = Some(json!({"touched": true}));
        Ok(())
    }

    async fn on_after_result(
        &self,
        _ctx: &mut StageExecutionContext,
        _result: &StageResult,
    ) -> Result<()> {
        self.push("on_after_result");
        Ok(())
    }

    async fn on_destroy(&self, _ctx: &mut StageExecutionContext) -> Result<()> {
        self.push("on_destroy");
        Ok(())
    }
}

/// Always fails with ERROR.
#[derive(Default)]
struct Flaky;

#[async_trait]
impl StageWorker for Flaky {
    async fn execute(&self, _ctx: &mut StageExecutionContext) -> Result<StageResult> {
        Err(CoreError::worker(StatusUid::Error, "UPSTREAM_TIMEOUT", "upstream timed out"))
    }
}

/// Accepts control-topic messages only; every stage topic is down.
#[derive(Default)]
struct StageTopicsDown {
    inner: MemoryDispatcher,
}

#[async_trait]
impl Dispatcher for StageTopicsDown {
    async fn send_to_queue(
        &self,
        topic: &str,
        body: &Value,
        options: &SendOptions,
    ) -> std::result::Result<(), CoreError> {
        if topic != WORKFLOW_TOPIC {
            return Err(CoreError::DispatchFailed {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        self.inner.send_to_queue(topic, body, options).await
    }
}

#[tokio::test]
async fn test_hooks_run_in_order_and_triggers_flush_after_result() {
    let recorder = Recorder::default();
    let mut registry = WorkerRegistry::new();
    let factory = recorder.clone();
    registry.register("m1", "extract", move || Box::new(factory.clone()));
    let ctx = TestContext::new(registry);
    ctx.seed_row("m1/extract").await;

    let mut body = trigger("m1/extract");
    body.prefix = Some("tenant-a".to_string());
    let result = ctx.engine.initialize(body).await.unwrap();

    assert_eq!(result.status_uid, StatusUid::Done);
    assert_eq!(result.info, Some(json!({"touched": true})));
    assert_eq!(
        recorder.calls(),
        vec![
            "on_initialize",
            "on_before_execute",
            "execute",
            "on_before_result",
            "on_after_result",
            "on_destroy"
        ]
    );

    let messages = ctx.dispatcher.messages();
    assert_eq!(messages.len(), 2);
    // Result first, with no prefix on the control topic
    assert_eq!(messages[0].topic, WORKFLOW_TOPIC);
    assert_eq!(messages[0].options.prefix, None);
    assert_eq!(messages[0].body["result"]["info"]["touched"], true);
    // Then the stacked trigger, carrying the caller's prefix
    assert_eq!(messages[1].topic, "m2/next");
    assert_eq!(messages[1].options.prefix.as_deref(), Some("tenant-a"));
    assert_eq!(messages[1].body["from"], "m1/extract");
}

#[tokio::test]
async fn test_post_result_callback_sees_every_result() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();

    let store = Arc::new(MemoryExecutionStore::new());
    let engine = StageEngine::builder()
        .executions(store.clone())
        .state(Arc::new(MemoryStateStore::new()))
        .dispatcher(Arc::new(MemoryDispatcher::new()))
        .on_result(move |body, result| {
            sink.lock()
                .unwrap()
                .push((body.stage_uid.clone(), result.status_uid));
        })
        .build()
        .unwrap();

    store
        .create_execution(&StageExecution {
            transaction_uid: TRANSACTION.to_string(),
            stage_uid: "m1/a".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    engine.initialize(trigger("m1/a")).await.unwrap();
    engine.initialize(trigger("m1/missing")).await.unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            ("m1/a".to_string(), StatusUid::Done),
            ("m1/missing".to_string(), StatusUid::Unknown)
        ]
    );
}

#[tokio::test]
async fn test_error_records_attempt_and_reports_parent_only_on_last_attempt() {
    let mut registry = WorkerRegistry::new();
    registry.register_default::<Flaky>("m1/load");
    let ctx = TestContext::new(registry);
    let module = ctx.seed_module("m1");
    ctx.seed_stage(module, "m1/load", json!({"retryLimit": 2}));
    let row = ctx.seed_row("m1/load").await;

    let mut body = trigger("m1/load");
    body.parent = Some(ParentRef {
        stage_uid: "m1/split".to_string(),
        execution_uid: None,
        index: 0,
        stage_execution_id: 99,
        child_stage_uid: "m1/load".to_string(),
        parent: None,
    });

    // First attempt: ERROR, not yet final for the parent
    let result = ctx.engine.initialize(body.clone()).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Error);
    assert_eq!(result.error_code.as_deref(), Some("UPSTREAM_TIMEOUT"));
    assert!(ctx.take_triggers().is_empty());
    assert_eq!(ctx.store.execution(row.id).unwrap().error.len(), 1);

    // Second attempt exhausts retryLimit=2 and reports
    let result = ctx.engine.initialize(body).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Error);
    let resumes = ctx.take_triggers();
    assert_eq!(resumes.len(), 1);
    assert_eq!(resumes[0].0, "m1/split");
    assert!(resumes[0].1.resume);

    let stored = ctx.store.execution(row.id).unwrap();
    assert_eq!(stored.error.len(), 2);
    assert!(stored.error.iter().all(|e: &ExecutionErrorEntry| e.status_uid == StatusUid::Error));
}

#[tokio::test]
async fn test_not_initialized_child_still_reports_to_parent() {
    let ctx = TestContext::new(WorkerRegistry::new());

    let mut body = trigger("m1/load");
    body.index = 3;
    body.parent = Some(ParentRef {
        stage_uid: "m1/split".to_string(),
        execution_uid: Some("_run".to_string()),
        index: 0,
        stage_execution_id: 7,
        child_stage_uid: "m1/load".to_string(),
        parent: None,
    });

    let result = ctx.engine.initialize(body).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Unknown);

    let resumes = ctx.take_triggers();
    assert_eq!(resumes.len(), 1);
    assert_eq!(resumes[0].1.execution_uid.as_deref(), Some("_run"));

    let keys = SplitKeys::new(7, "m1/load");
    let reports = ctx.state.get_array(&keys.process()).await.unwrap();
    assert_eq!(reports, vec!["3:U".to_string()]);
}

#[tokio::test]
async fn test_force_update_reruns_failed_row() {
    let ctx = TestContext::new(WorkerRegistry::new());
    let row = ctx.seed_row("m1/extract").await;
    let mut failed = ctx.store.execution(row.id).unwrap();
    failed.status_uid = StatusUid::Failed;
    ctx.store.update_execution(&failed).await.unwrap();

    let result = ctx.engine.initialize(trigger("m1/extract")).await.unwrap();
    assert_eq!(result.error_code.as_deref(), Some("NOT_INITIALIZED"));

    let mut forced = trigger("m1/extract");
    forced.options = json!({"forceUpdate": true}).as_object().cloned().unwrap();
    let result = ctx.engine.initialize(forced).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Done);
}

#[tokio::test]
async fn test_skip_queues_persists_but_sends_nothing() {
    let config = EngineConfig {
        skip_queues: true,
        ..Default::default()
    };
    let ctx = TestContext::with_config(WorkerRegistry::new(), config);
    let row = ctx.seed_row("m1/extract").await;

    let result = ctx.engine.initialize(trigger("m1/extract")).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Done);
    assert!(ctx.dispatcher.messages().is_empty());
    assert_eq!(
        ctx.store.execution(row.id).unwrap().status_uid,
        StatusUid::Done
    );
}

#[tokio::test]
async fn test_mock_execution_leaves_store_untouched() {
    let ctx = TestContext::new(WorkerRegistry::new());
    let row = ctx.seed_row("m1/extract").await;

    let mut body = trigger("m1/extract");
    body.mock_stage_execution = Some(StageExecution {
        stage_uid: "m1/extract".to_string(),
        ..Default::default()
    });
    let result = ctx.engine.initialize(body).await.unwrap();

    assert_eq!(result.status_uid, StatusUid::Done);
    assert!(ctx.dispatcher.messages().is_empty());
    assert_eq!(
        ctx.store.execution(row.id).unwrap().status_uid,
        StatusUid::Initial
    );
}

#[tokio::test]
async fn test_trigger_dispatch_failure_returns_the_result_already_sent() {
    let recorder = Recorder::default();
    let mut registry = WorkerRegistry::new();
    let factory = recorder.clone();
    registry.register("m1", "extract", move || Box::new(factory.clone()));

    let store = Arc::new(MemoryExecutionStore::new());
    let dispatcher = Arc::new(StageTopicsDown::default());
    let engine = StageEngine::builder()
        .executions(store.clone())
        .state(Arc::new(MemoryStateStore::new()))
        .dispatcher(dispatcher.clone())
        .registry(registry)
        .build()
        .unwrap();
    let row = store
        .create_execution(&StageExecution {
            transaction_uid: TRANSACTION.to_string(),
            stage_uid: "m1/extract".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let result = engine.initialize(trigger("m1/extract")).await.unwrap();

    assert_eq!(result.status_uid, StatusUid::Done);
    assert_eq!(result.info, Some(json!({"touched": true})));
    let sent = dispatcher.inner.to_topic(WORKFLOW_TOPIC);
    assert_eq!(sent.len(), 1);
    let message: ResultMessage = serde_json::from_value(sent[0].body.clone()).unwrap();
    assert_eq!(message.result.status_uid, result.status_uid);
    assert_eq!(store.execution(row.id).unwrap().status_uid, StatusUid::Done);
    assert!(recorder.calls().contains(&"on_destroy"));
}
