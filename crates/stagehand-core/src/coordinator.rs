// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Split coordination: fan-out to child stages and race-free fan-in.
//!
//! # Coordination keys
//!
//! Each (stage execution, child stage) pair owns a key prefix in the [`StateStore`]:
//!
//! | Key | Value |
//! |-----|-------|
//! | `split/{id}/{child}/length` | number of children spawned |
//! | `split/{id}/{child}/process/{index}` | `index:status`, one per reporting child |
//! | `split/{id}/{child}/result/{index}` | `index:info` JSON, for children with info |
//! | `split/{id}/{child}/next` | `0` until finalization, then `1` |
//! | `split/{id}/{child}/status` | STARTING, WAITING, DONE or FAILED |
//!
//! The `next` gate only changes through [`StateStore::save_by`] and the `process` set only
//! grows through [`StateStore::push`]. Finalization writes the final `status` first and then
//! clears every other key, so late re-entries stay no-ops and late reports drop themselves.
//!
//! # Phases
//!
//! ```text
//!   status absent/STARTING ──fan out──▶ WAITING ──all reported + won next──▶ DONE | FAILED
//!                                          │
//!                                          └── fewer reported ──▶ WAITING (again)
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::context::{FORCE_KEYS, Services, StageExecutionContext};
use crate::engine::EngineConfig;
use crate::error::{CoreError, Result};
use crate::merge::deep_merge;
use crate::model::{JsonMap, ParentRef, StageExecution, StageResult, TriggerBody, split_stage_uid};
use crate::partition::{
    BULK_LIMIT_KEY, FileSplitStrategy, LENGTH_LIMIT_KEY, PartitionStrategy, Partitions, SplitOptions,
    StaticCount,
};
use crate::resolver::{ConfigKey, value_as_u64};
use crate::status::{ChildPhase, StatusUid};
use crate::worker::StageWorker;

/// Config name of the child stage uid.
pub const CHILD_STAGE_KEY: &str = "childStage";
/// Config flag that runs a split stage without fanning out.
pub const SKIP_CHILDREN_KEY: &str = "skipChildren";
/// Config name of the child execution uid template.
pub const CHILD_EXECUTION_UID_KEY: &str = "childExecutionUid";
/// Config name of the stored file to split.
pub const SPLIT_FILE_KEY: &str = "splitFile";
/// Config name of the directory parts are written to.
pub const SPLIT_TARGET_KEY: &str = "splitTarget";
/// Config flag marking the split file as having a header line.
pub const SPLIT_HEADER_KEY: &str = "splitHeader";
/// Option key carrying a child's partition bounds.
pub const PARTITION_KEY: &str = "partition";

const DEFAULT_CHILD_EXECUTION_UID: &str = ":keep()";

/// Coordination keys of one (stage execution, child stage) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitKeys {
    prefix: String,
}

impl SplitKeys {
    /// Keys of `stage_execution_id` splitting into `child_stage_uid`.
    pub fn new(stage_execution_id: i64, child_stage_uid: &str) -> Self {
        Self {
            prefix: format!("split/{stage_execution_id}/{child_stage_uid}/"),
        }
    }

    /// Keys a child reports into.
    pub fn for_parent(parent: &ParentRef) -> Self {
        Self::new(parent.stage_execution_id, &parent.child_stage_uid)
    }

    /// Prefix shared by every key.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Number of children spawned.
    pub fn length(&self) -> String {
        format!("{}length", self.prefix)
    }

    /// Set of `index:status` reports.
    pub fn process(&self) -> String {
        format!("{}process", self.prefix)
    }

    /// Set of `index:info` payloads.
    pub fn results(&self) -> String {
        format!("{}result", self.prefix)
    }

    /// One-shot finalization gate.
    pub fn next(&self) -> String {
        format!("{}next", self.prefix)
    }

    /// Coordination phase.
    pub fn status(&self) -> String {
        format!("{}status", self.prefix)
    }
}

/// Outcome of evaluating fan-in.
#[derive(Debug, Clone, PartialEq)]
pub enum FanInOutcome {
    /// Not every child has reported.
    Waiting(StageResult),
    /// This invocation won the gate and finalized the split.
    Finalized(StageResult),
    /// Another invocation already won the gate.
    Lost,
}

/// Runs the fan-out/fan-in protocol for split stages.
#[derive(Debug, Clone)]
pub struct SplitCoordinator {
    services: Services,
    config: EngineConfig,
}

fn state_error(key: &str, details: impl Into<String>) -> CoreError {
    CoreError::StateStoreError {
        operation: "decode".to_string(),
        key: key.to_string(),
        details: details.into(),
    }
}

impl SplitCoordinator {
    /// Coordinator over the given collaborators.
    pub fn new(services: Services, config: EngineConfig) -> Self {
        Self { services, config }
    }

    /// Drive the split of `ctx` into `child_stage`.
    ///
    /// `None` means this invocation has nothing to report: the split was already finalized,
    /// or another invocation won the finalization race.
    #[instrument(skip(self, ctx, worker), fields(stage_uid = %ctx.stage_uid(), execution_id = ctx.execution().id))]
    pub async fn run(
        &self,
        ctx: &mut StageExecutionContext,
        worker: &dyn StageWorker,
        child_stage: &str,
    ) -> Result<Option<StageResult>> {
        if ctx.is_side_effect_free() {
            return self.dry_run(ctx, worker, child_stage).await.map(Some);
        }

        let keys = SplitKeys::new(ctx.execution().id, child_stage);
        let state = &self.services.state;

        let phase = if ctx.is_forced() {
            let cleared = state.clear_by_prefix(keys.prefix()).await?;
            info!(cleared, "Forced restart, coordination keys cleared");
            None
        } else {
            state
                .get_value(&keys.status())
                .await?
                .and_then(|s| ChildPhase::parse(&s))
        };

        match phase {
            None if ctx.body().resume => {
                debug!("Resume found no coordination keys, split already finalized");
                Ok(None)
            }
            None | Some(ChildPhase::Starting) => {
                self.fan_out(ctx, worker, child_stage, &keys).await.map(Some)
            }
            Some(ChildPhase::Waiting) => {
                if state.get_value(&keys.next()).await?.as_deref() == Some("1") {
                    debug!("Finalization already claimed");
                    return Ok(None);
                }
                let defaults = worker.result_defaults(ctx);
                match self.evaluate_fan_in(&keys, &defaults).await? {
                    FanInOutcome::Waiting(result) | FanInOutcome::Finalized(result) => {
                        Ok(Some(result))
                    }
                    FanInOutcome::Lost => Ok(None),
                }
            }
            Some(phase) => {
                debug!(phase = phase.as_str(), "Split already finalized");
                Ok(None)
            }
        }
    }

    async fn strategy(
        &self,
        ctx: &StageExecutionContext,
        worker: &dyn StageWorker,
    ) -> Result<Arc<dyn PartitionStrategy>> {
        if let Some(strategy) = worker.partition_strategy(ctx).await? {
            return Ok(strategy);
        }

        if let (Some(source), Some(storage)) =
            (ctx.resolve_str(SPLIT_FILE_KEY), self.services.storage.clone())
        {
            let layers = ctx.layers();
            let lookup = |name: &str| layers.resolve_config(name).and_then(value_as_u64);
            let options = SplitOptions {
                bulk_size: lookup(BULK_LIMIT_KEY).unwrap_or(SplitOptions::default().bulk_size),
                has_header: layers.is_inherited_config_activated(SPLIT_HEADER_KEY, ConfigKey::Config),
                max_parts: lookup(LENGTH_LIMIT_KEY),
                max_in_flight: SplitOptions::default().max_in_flight,
                poll_interval: self.config.split_poll_interval,
                poll_attempts: self.config.split_poll_attempts,
            };
            let target = ctx
                .resolve_str(SPLIT_TARGET_KEY)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{source}.parts/{}", ctx.execution().id));
            return Ok(Arc::new(FileSplitStrategy::new(storage, options, source, target)));
        }

        Ok(Arc::new(StaticCount::from_layers(ctx.layers())?))
    }

    async fn child_row_ids(&self, ctx: &StageExecutionContext, child_stage: &str) -> Result<(i64, i64)> {
        let store = &self.services.executions;
        let (module_uid, _) = split_stage_uid(child_stage);
        let transaction_uid = &ctx.body().transaction_uid;
        let project_uid = ctx.body().project_uid.as_deref();

        let module_execution_id = match store.get_module_execution(transaction_uid, module_uid).await? {
            Some(module_execution) => module_execution.id,
            None => ctx.execution().module_execution_id,
        };

        let stage_config_id = match store.get_module_config(module_uid, project_uid).await? {
            Some(module_config) => store
                .get_stage_config(module_config.id, child_stage)
                .await?
                .map(|s| s.id),
            None => None,
        };
        let stage_config_id = stage_config_id.unwrap_or_else(|| {
            warn!(child_stage, "Child stage has no stage config");
            0
        });

        Ok((module_execution_id, stage_config_id))
    }

    /// Caller options to hand to every child, without the restart flags and config.
    fn forwarded_options(ctx: &StageExecutionContext) -> JsonMap {
        let mut options = ctx.execution().data.options.clone();
        for (key, value) in &ctx.body().options {
            options.insert(key.clone(), value.clone());
        }
        options.remove("config");
        options.remove(PARTITION_KEY);
        for key in FORCE_KEYS {
            options.remove(key);
        }
        options
    }

    fn sizing_result(child_stage: &str, partitions: &Partitions) -> StageResult {
        if partitions.is_empty() {
            return StageResult::done().with_info(json!({
                "childStage": child_stage,
                "count": partitions.count,
                "length": 0,
            }));
        }
        StageResult::waiting().with_info(json!({
            "childStage": child_stage,
            "count": partitions.count,
            "length": partitions.length,
            "totalLimit": partitions.total_limit,
        }))
    }

    /// Sizing of a pure or mocked pass. No keys, rows or triggers are written.
    async fn dry_run(
        &self,
        ctx: &StageExecutionContext,
        worker: &dyn StageWorker,
        child_stage: &str,
    ) -> Result<StageResult> {
        let partitions = self.strategy(ctx, worker).await?.estimate().await?;
        debug!(child_stage, length = partitions.length, "Side-effect free split sized");
        Ok(Self::sizing_result(child_stage, &partitions))
    }

    async fn fan_out(
        &self,
        ctx: &mut StageExecutionContext,
        worker: &dyn StageWorker,
        child_stage: &str,
        keys: &SplitKeys,
    ) -> Result<StageResult> {
        let partitions = self.strategy(ctx, worker).await?.partition().await?;
        if partitions.is_empty() {
            info!(child_stage, "Nothing to split");
            return Ok(Self::sizing_result(child_stage, &partitions));
        }

        let state = &self.services.state;
        state.save(&keys.length(), &partitions.length.to_string()).await?;
        state.save(&keys.next(), "0").await?;
        state.save(&keys.status(), ChildPhase::Waiting.as_str()).await?;

        // Re-entries carry no caller options; keep them on the row.
        let forwarded = Self::forwarded_options(ctx);
        ctx.execution_mut().data.options = forwarded.clone();

        let (module_execution_id, stage_config_id) = self.child_row_ids(ctx, child_stage).await?;
        let raw_uid = ctx
            .resolve_str(CHILD_EXECUTION_UID_KEY)
            .unwrap_or(DEFAULT_CHILD_EXECUTION_UID)
            .to_string();
        let parent = ParentRef {
            stage_uid: ctx.stage_uid().to_string(),
            execution_uid: ctx.body().execution_uid.clone(),
            index: ctx.index(),
            stage_execution_id: ctx.execution().id,
            child_stage_uid: child_stage.to_string(),
            parent: ctx.body().parent.clone().map(Box::new),
        };

        for index in 0..partitions.length {
            let execution_uid =
                ctx.build_execution_uid(&raw_uid, child_stage, index, partitions.length);
            self.ensure_child_row(
                ctx,
                child_stage,
                &execution_uid,
                index,
                module_execution_id,
                stage_config_id,
            )
            .await?;

            let body = TriggerBody {
                stage_uid: child_stage.to_string(),
                execution_uid: (!execution_uid.is_empty()).then_some(execution_uid),
                transaction_uid: ctx.body().transaction_uid.clone(),
                project_uid: ctx.body().project_uid.clone(),
                date: ctx.body().date,
                index,
                options: Self::child_options(&forwarded, &partitions, index),
                prefix: ctx.body().prefix.clone(),
                parent: Some(parent.clone()),
                ..Default::default()
            };
            ctx.stack_trigger(child_stage, serde_json::to_value(&body)?);
        }

        info!(
            child_stage,
            length = partitions.length,
            count = partitions.count,
            "Fanned out to child stage"
        );

        Ok(Self::sizing_result(child_stage, &partitions))
    }

    fn child_options(forwarded: &JsonMap, partitions: &Partitions, index: u64) -> JsonMap {
        let (offset, limit) = partitions.bounds(index);
        let mut options = forwarded.clone();
        let mut partition = json!({
            "index": index,
            "offset": offset,
            "limit": limit,
            "length": partitions.length,
            "count": partitions.count,
        });
        if let Some(path) = partitions.path(index) {
            partition["path"] = Value::String(path);
        }
        options.insert(PARTITION_KEY.to_string(), partition);
        options
    }

    async fn ensure_child_row(
        &self,
        ctx: &StageExecutionContext,
        child_stage: &str,
        execution_uid: &str,
        index: u64,
        module_execution_id: i64,
        stage_config_id: i64,
    ) -> Result<()> {
        let store = &self.services.executions;
        let transaction_uid = &ctx.body().transaction_uid;

        let existing = store
            .find_latest_execution(transaction_uid, child_stage, execution_uid, index)
            .await?;
        if existing.is_some_and(|row| row.status_uid.is_reusable()) && !ctx.is_forced() {
            return Ok(());
        }

        let mut row = StageExecution {
            module_execution_id,
            stage_config_id,
            transaction_uid: transaction_uid.clone(),
            stage_uid: child_stage.to_string(),
            index,
            status_uid: StatusUid::Initial,
            ..Default::default()
        };
        row.system.execution_uid = execution_uid.to_string();
        store.create_execution(&row).await?;
        Ok(())
    }

    /// Record a child's final status (and info) in its parent's coordination keys.
    ///
    /// Returns whether this was the child's first report.
    #[instrument(skip(self, info), fields(parent = %parent.stage_uid, child = %parent.child_stage_uid))]
    pub async fn report(
        &self,
        parent: &ParentRef,
        index: u64,
        status: StatusUid,
        info: Option<&Value>,
    ) -> Result<bool> {
        let keys = SplitKeys::for_parent(parent);
        let member = index.to_string();
        let state = &self.services.state;

        if self.is_finalized(&keys).await? {
            let cleared = self.clear_reports(&keys).await?;
            debug!(index, cleared, "Split already finalized, late report ignored");
            return Ok(false);
        }

        // Info goes in before the status so a finalizer never misses it.
        if let Some(info) = info {
            state
                .push(&keys.results(), &member, &format!("{index}:{info}"))
                .await?;
        }
        let inserted = state
            .push(&keys.process(), &member, &format!("{index}:{status}"))
            .await?;

        // The finalizer writes its phase before clearing, so a push that raced it shows here.
        if self.is_finalized(&keys).await? {
            let cleared = self.clear_reports(&keys).await?;
            debug!(index, cleared, "Split finalized during report, late report removed");
            return Ok(false);
        }

        if !inserted {
            debug!(index, "Duplicate child report ignored");
        }
        Ok(inserted)
    }

    async fn is_finalized(&self, keys: &SplitKeys) -> Result<bool> {
        Ok(self
            .services
            .state
            .get_value(&keys.status())
            .await?
            .and_then(|s| ChildPhase::parse(&s))
            .is_some_and(|phase| phase.is_finalized()))
    }

    async fn clear_reports(&self, keys: &SplitKeys) -> Result<u64> {
        let state = &self.services.state;
        let process = state.clear_by_prefix(&format!("{}/", keys.process())).await?;
        let results = state.clear_by_prefix(&format!("{}/", keys.results())).await?;
        Ok(process + results)
    }

    /// Compare reports against the spawned length and finalize when complete.
    pub async fn evaluate_fan_in(&self, keys: &SplitKeys, defaults: &JsonMap) -> Result<FanInOutcome> {
        let state = &self.services.state;

        let length_key = keys.length();
        let Some(length) = state.get_value(&length_key).await? else {
            if state.get_value(&keys.next()).await?.is_none() {
                debug!("Coordination keys cleared by a concurrent finalizer");
                return Ok(FanInOutcome::Lost);
            }
            return Err(state_error(&length_key, "missing while waiting"));
        };
        let length: u64 = length
            .parse()
            .map_err(|_| state_error(&length_key, "not an integer"))?;

        let reports = state.get_array(&keys.process()).await?;
        let reported = reports.len() as u64;

        if reported < length {
            // A finalizer flips the gate before clearing, so a short read after a clear shows here.
            if state.get_value(&keys.next()).await?.as_deref() != Some("0") {
                debug!("Finalization claimed while counting reports");
                return Ok(FanInOutcome::Lost);
            }
            debug!(reported, length, "Waiting for children");
            return Ok(FanInOutcome::Waiting(StageResult::waiting().with_info(json!({
                "reported": reported,
                "length": length,
            }))));
        }

        if reported > length {
            warn!(reported, length, "More children reported than were spawned");
            if self.config.clear_keys_on_overflow {
                state.clear_by_prefix(keys.prefix()).await?;
                state.save(&keys.status(), ChildPhase::Failed.as_str()).await?;
            }
            return Err(CoreError::InvariantViolation {
                message: format!("{reported} children reported, {length} spawned"),
            });
        }

        if state.save_by(&keys.next(), "1", "0").await? != 1 {
            debug!("Lost finalization race");
            return Ok(FanInOutcome::Lost);
        }

        let statuses = Self::parse_reports(&keys.process(), &reports)?;
        let infos = Self::parse_reports(&keys.results(), &state.get_array(&keys.results()).await?)?;

        let mut merged = Value::Object(defaults.clone());
        for info in infos.values() {
            deep_merge(&mut merged, &serde_json::from_str::<Value>(info)?);
        }
        let children: JsonMap = statuses
            .iter()
            .map(|(index, status)| (index.to_string(), Value::String(status.clone())))
            .collect();
        if let Value::Object(map) = &mut merged {
            map.insert("children".to_string(), Value::Object(children));
        }

        let failed = statuses
            .values()
            .filter(|status| status.as_str() != StatusUid::Done.as_str())
            .count();

        let (phase, result) = if failed == 0 {
            (ChildPhase::Done, StageResult::done())
        } else {
            (
                ChildPhase::Failed,
                StageResult::failure(
                    StatusUid::Failed,
                    "CHILD_FAILED",
                    format!("{failed} of {length} children did not finish DONE"),
                ),
            )
        };
        // Phase first: a report pushed after this point sees it and removes itself.
        state.save(&keys.status(), phase.as_str()).await?;
        let cleared = state.clear_by_prefix(&keys.length()).await?
            + state.clear_by_prefix(&keys.next()).await?
            + self.clear_reports(keys).await?;

        info!(length, failed, cleared, phase = phase.as_str(), "Split finalized");
        Ok(FanInOutcome::Finalized(result.with_info(merged)))
    }

    /// Parse `index:payload` members into an index-ordered map.
    fn parse_reports(key: &str, members: &[String]) -> Result<BTreeMap<u64, String>> {
        members
            .iter()
            .map(|member| {
                let (index, payload) = member
                    .split_once(':')
                    .ok_or_else(|| state_error(key, format!("malformed member '{member}'")))?;
                let index = index
                    .parse::<u64>()
                    .map_err(|_| state_error(key, format!("malformed index in '{member}'")))?;
                Ok((index, payload.to_string()))
            })
            .collect()
    }
}
