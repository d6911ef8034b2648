// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for split fan-out, child reporting and fan-in through the engine.

mod common;

use async_trait::async_trait;
use common::*;
use serde_json::{Value, json};

use stagehand_core::coordinator::SplitKeys;
use stagehand_core::model::StageExecution;
use stagehand_core::state_store::StateStore;
use stagehand_core::{
    CoreError, Result, StageExecutionContext, StageResult, StageWorker, StatusUid, WorkerRegistry,
};

const PARENT: &str = "m1/split";
const CHILD: &str = "m1/load";

/// Loads its partition; partition 2 always fails.
#[derive(Default)]
struct LoadWorker;

#[async_trait]
impl StageWorker for LoadWorker {
    async fn execute(&self, ctx: &mut StageExecutionContext) -> Result<StageResult> {
        let partition = ctx.options().get("partition").cloned().unwrap_or(Value::Null);
        let index = partition["index"].as_u64().unwrap_or_default();
        if index == 2 {
            return Err(CoreError::worker(StatusUid::Failed, "BAD_ROWS", "partition 2 is corrupt"));
        }
        Ok(StageResult::done().with_info(json!({
            "loaded": { (index.to_string()): partition["limit"] }
        })))
    }
}

fn registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register_default::<LoadWorker>(CHILD);
    registry
}

fn seeded(config: Value) -> TestContext {
    let ctx = TestContext::new(registry());
    let module = ctx.seed_module("m1");
    ctx.seed_stage(module, PARENT, config);
    ctx.seed_stage(module, CHILD, json!({}));
    ctx
}

#[tokio::test]
async fn test_split_fans_out_and_fails_when_any_child_fails() {
    let ctx = seeded(json!({"childStage": CHILD, "count": 24, "bulkLimit": 10}));
    let parent_row = ctx.seed_row(PARENT).await;

    let mut first = trigger(PARENT);
    first.prefix = Some("tenant-a".to_string());
    first.options = json!({"table": "orders"}).as_object().cloned().unwrap();
    let result = ctx.engine.initialize(first).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Waiting);
    let info = result.info.unwrap();
    assert_eq!(info["length"], 3);
    assert_eq!(info["count"], 24);
    assert_eq!(info["totalLimit"], 10);

    // One child row per partition, created before the triggers went out
    let child_rows = ctx.rows(CHILD);
    assert_eq!(child_rows.len(), 3);
    assert!(child_rows.iter().all(|r| r.status_uid == StatusUid::Initial));

    let children = ctx.take_triggers();
    assert_eq!(children.len(), 3);
    for (index, (topic, body)) in children.iter().enumerate() {
        assert_eq!(topic, CHILD);
        assert_eq!(body.index, index as u64);
        assert_eq!(body.options["table"], "orders");
        assert_eq!(body.options["partition"]["offset"], index as u64 * 10);
        assert_eq!(body.prefix.as_deref(), Some("tenant-a"));
        let parent = body.parent.as_ref().unwrap();
        assert_eq!(parent.stage_execution_id, parent_row.id);
        assert_eq!(parent.child_stage_uid, CHILD);
    }
    assert_eq!(children[2].1.options["partition"]["limit"], 4);

    // Children finish out of order: FAILED first, then the two DONE ones
    for position in [2usize, 0, 1] {
        let result = ctx.engine.initialize(children[position].1.clone()).await.unwrap();
        let expected = if position == 2 { StatusUid::Failed } else { StatusUid::Done };
        assert_eq!(result.status_uid, expected);
    }

    let resumes = ctx.take_triggers();
    assert_eq!(resumes.len(), 3);
    assert!(resumes.iter().all(|(topic, body)| topic == PARENT && body.resume));

    let outcomes = {
        let mut outcomes = Vec::new();
        for (_, body) in resumes {
            outcomes.push(ctx.engine.initialize(body).await);
        }
        outcomes
    };
    let finals: Vec<_> = outcomes.into_iter().flatten().collect();
    assert_eq!(finals.len(), 1, "exactly one finalization");

    let final_result = &finals[0];
    assert_eq!(final_result.status_uid, StatusUid::Failed);
    assert_eq!(final_result.error_code.as_deref(), Some("CHILD_FAILED"));
    let info = final_result.info.as_ref().unwrap();
    assert_eq!(info["loaded"], json!({"0": 10, "1": 10}));
    assert_eq!(info["children"], json!({"0": "D", "1": "D", "2": "F"}));

    // Keys cleared once, only the final phase left behind
    let keys = SplitKeys::new(parent_row.id, CHILD);
    assert_eq!(ctx.state.keys(), vec![keys.status()]);
    assert_eq!(
        ctx.state.get_value(&keys.status()).await.unwrap().as_deref(),
        Some("FAILED")
    );

    let parent_row = ctx.store.execution(parent_row.id).unwrap();
    assert_eq!(parent_row.status_uid, StatusUid::Failed);
    assert_eq!(parent_row.error.len(), 1);

    let parent_results = ctx.results_of(PARENT);
    assert_eq!(parent_results.first().unwrap().status_uid, StatusUid::Waiting);
    assert_eq!(parent_results.last().unwrap().status_uid, StatusUid::Failed);
    assert_eq!(
        parent_results
            .iter()
            .filter(|r| r.status_uid.is_final())
            .count(),
        1
    );
}

#[tokio::test]
async fn test_split_done_when_all_children_done() {
    let ctx = seeded(json!({"childStage": CHILD, "count": 20, "bulkLimit": 10}));
    let parent_row = ctx.seed_row(PARENT).await;

    ctx.engine.initialize(trigger(PARENT)).await.unwrap();
    for (_, body) in ctx.take_triggers() {
        ctx.engine.initialize(body).await.unwrap();
    }

    let mut finals = Vec::new();
    for (_, body) in ctx.take_triggers() {
        finals.extend(ctx.engine.initialize(body).await);
    }
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].status_uid, StatusUid::Done);
    assert_eq!(finals[0].info.as_ref().unwrap()["loaded"], json!({"0": 10, "1": 10}));

    let row = ctx.store.execution(parent_row.id).unwrap();
    assert_eq!(row.status_uid, StatusUid::Done);
    assert!(row.error.is_empty());
}

#[tokio::test]
async fn test_zero_count_finishes_without_children() {
    let ctx = seeded(json!({"childStage": CHILD, "count": 0}));
    ctx.seed_row(PARENT).await;

    let result = ctx.engine.initialize(trigger(PARENT)).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Done);
    assert!(ctx.take_triggers().is_empty());
    assert!(ctx.state.keys().is_empty());
}

#[tokio::test]
async fn test_skip_children_runs_execute_instead() {
    let ctx = seeded(json!({"childStage": CHILD, "count": 30, "skipChildren": true}));
    ctx.seed_row(PARENT).await;

    let result = ctx.engine.initialize(trigger(PARENT)).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Done);
    assert!(ctx.take_triggers().is_empty());
    assert!(ctx.rows(CHILD).is_empty());
}

#[tokio::test]
async fn test_missing_count_fails_the_split() {
    let ctx = seeded(json!({"childStage": CHILD}));
    ctx.seed_row(PARENT).await;

    let result = ctx.engine.initialize(trigger(PARENT)).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Failed);
    assert_eq!(result.error_code.as_deref(), Some("VALIDATION_ERROR"));
}

#[tokio::test]
async fn test_waiting_reentry_does_not_fan_out_again() {
    let ctx = seeded(json!({"childStage": CHILD, "count": 30, "bulkLimit": 10}));
    ctx.seed_row(PARENT).await;

    ctx.engine.initialize(trigger(PARENT)).await.unwrap();
    let children = ctx.take_triggers();
    assert_eq!(children.len(), 3);

    // Only the first child reports; the parent re-enters and keeps waiting
    ctx.engine.initialize(children[0].1.clone()).await.unwrap();
    let resumes = ctx.take_triggers();
    assert_eq!(resumes.len(), 1);

    let result = ctx.engine.initialize(resumes[0].1.clone()).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Waiting);
    assert_eq!(result.info.unwrap()["reported"], 1);
    assert!(ctx.take_triggers().is_empty(), "no second fan-out");
    assert_eq!(ctx.rows(CHILD).len(), 3);
}

#[tokio::test]
async fn test_force_restarts_fan_out() {
    let ctx = seeded(json!({"childStage": CHILD, "count": 20, "bulkLimit": 10}));
    ctx.seed_row(PARENT).await;

    ctx.engine.initialize(trigger(PARENT)).await.unwrap();
    let children = ctx.take_triggers();
    ctx.engine.initialize(children[0].1.clone()).await.unwrap();
    ctx.take_triggers();

    let mut forced = trigger(PARENT);
    forced.options = json!({"force": true}).as_object().cloned().unwrap();
    let result = ctx.engine.initialize(forced).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Waiting);

    let again = ctx.take_triggers();
    assert_eq!(again.len(), 2);
    assert!(again.iter().all(|(_, body)| !body.options.contains_key("force")));

    // The earlier report was cleared with the rest of the keys
    let keys = SplitKeys::new(ctx.rows(PARENT)[0].id, CHILD);
    assert!(ctx.state.get_array(&keys.process()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_side_effect_free_passes_only_size_the_split() {
    let ctx = seeded(json!({"childStage": CHILD, "count": 20, "bulkLimit": 10}));
    let parent_row = ctx.seed_row(PARENT).await;

    let mut pure = trigger(PARENT);
    pure.pure = true;
    let result = ctx.engine.initialize(pure).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Waiting);
    assert_eq!(result.info.as_ref().unwrap()["length"], 2);

    let mut mocked = trigger(PARENT);
    mocked.mock_stage_execution = Some(StageExecution {
        stage_uid: PARENT.to_string(),
        transaction_uid: TRANSACTION.to_string(),
        ..Default::default()
    });
    let result = ctx.engine.initialize(mocked).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Waiting);

    assert!(ctx.state.keys().is_empty());
    assert!(ctx.rows(CHILD).is_empty());
    assert!(ctx.dispatcher.messages().is_empty());
    assert_eq!(ctx.store.execution(parent_row.id).unwrap().status_uid, StatusUid::Initial);

    // A real pass afterwards still fans out and finishes
    let result = ctx.engine.initialize(trigger(PARENT)).await.unwrap();
    assert_eq!(result.status_uid, StatusUid::Waiting);
    let children = ctx.take_triggers();
    assert_eq!(children.len(), 2);
    for (_, body) in children {
        ctx.engine.initialize(body).await.unwrap();
    }
    let mut finals = Vec::new();
    for (_, body) in ctx.take_triggers() {
        finals.extend(ctx.engine.initialize(body).await);
    }
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].status_uid, StatusUid::Done);
}

#[tokio::test]
async fn test_redelivered_child_after_fan_in_leaves_only_status() {
    let ctx = seeded(json!({"childStage": CHILD, "count": 20, "bulkLimit": 10}));
    let parent_row = ctx.seed_row(PARENT).await;

    ctx.engine.initialize(trigger(PARENT)).await.unwrap();
    let children = ctx.take_triggers();
    for (_, body) in &children {
        ctx.engine.initialize(body.clone()).await.unwrap();
    }
    for (_, body) in ctx.take_triggers() {
        ctx.engine.initialize(body).await;
    }
    let keys = SplitKeys::new(parent_row.id, CHILD);
    assert_eq!(ctx.state.keys(), vec![keys.status()]);

    // The queue redelivers the first child after the split finished
    let redelivered = ctx.engine.initialize(children[0].1.clone()).await.unwrap();
    assert_eq!(redelivered.status_uid, StatusUid::Done);
    for (_, body) in ctx.take_triggers() {
        assert!(ctx.engine.initialize(body).await.is_none());
    }

    assert_eq!(ctx.state.keys(), vec![keys.status()]);
    assert_eq!(ctx.store.execution(parent_row.id).unwrap().status_uid, StatusUid::Done);
}
