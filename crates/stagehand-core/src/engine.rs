// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stage execution state machine.
//!
//! [`StageEngine::initialize`] drives one invocation of one stage partition:
//!
//! 1. Load the latest row for `(transactionUid, stageUid, executionUid, index)` and the
//!    config layers that apply to it.
//! 2. Run the worker hooks, or the [`SplitCoordinator`] when the stage declares a child stage.
//! 3. Convert any error into a result (exactly once).
//! 4. Persist the result, send it to the control topic, report to a coordinating parent and
//!    flush the stacked triggers.
//!
//! Every invocation yields exactly one result unless it is pure, mocked, or a coordinator
//! re-entry that had nothing left to do.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::context::{Services, StageExecutionContext};
use crate::coordinator::{CHILD_STAGE_KEY, SKIP_CHILDREN_KEY, SplitCoordinator};
use crate::dispatch::{Dispatcher, SendOptions};
use crate::error::{CoreError, Result};
use crate::merge::merge_layers;
use crate::model::{
    ConfigHolder, ExecutionErrorEntry, JsonMap, ParentRef, ResultMessage, StageResult,
    TriggerBody, split_stage_uid,
};
use crate::persistence::ExecutionStore;
use crate::resolver::{ConfigKey, ConfigLayers, is_value_activated};
use crate::retry::DEFAULT_RETRY_LIMIT;
use crate::state_store::StateStore;
use crate::status::StatusUid;
use crate::storage::StreamStorage;
use crate::validation::validate_required;
use crate::worker::{StageWorker, WorkerRegistry};

/// Default control topic.
pub const WORKFLOW_TOPIC: &str = "m0/workflow";

/// Option key whose object value is injected as config.
const INJECTED_CONFIG_KEY: &str = "config";

/// Engine settings, usually derived from [`Config`](crate::config::Config).
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Topic every result message is sent to.
    pub workflow_topic: String,
    /// Retry limit when no config layer sets one.
    pub default_retry_limit: u64,
    /// Suppress every dispatch (results, parent re-triggers, stacked triggers).
    pub skip_queues: bool,
    /// Clear coordination keys when more children report than were spawned.
    pub clear_keys_on_overflow: bool,
    /// Poll interval while waiting for file parts to be written.
    pub split_poll_interval: Duration,
    /// Poll bound while waiting for file parts to be written.
    pub split_poll_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflow_topic: WORKFLOW_TOPIC.to_string(),
            default_retry_limit: DEFAULT_RETRY_LIMIT,
            skip_queues: false,
            clear_keys_on_overflow: false,
            split_poll_interval: Duration::from_millis(50),
            split_poll_attempts: 100,
        }
    }
}

/// Post-result callback, invoked after a result is persisted and before it is sent.
pub type ResultCallback = Arc<dyn Fn(&TriggerBody, &StageResult) + Send + Sync>;

/// Convert an error into the result it produces.
pub fn build_execution_error(err: &CoreError) -> StageResult {
    StageResult::failure(err.status_uid(), err.error_code(), err.to_string())
}

fn stamp(mut result: StageResult, started_at: DateTime<Utc>) -> StageResult {
    result.system.started_at = Some(started_at);
    result.system.finished_at = Some(Utc::now());
    result
}

fn send_options(config: &EngineConfig, topic: &str, prefix: &Option<String>) -> SendOptions {
    if topic == config.workflow_topic {
        SendOptions::default()
    } else {
        SendOptions::with_prefix(prefix.clone())
    }
}

/// Builder for a [`StageEngine`].
#[derive(Default)]
pub struct StageEngineBuilder {
    executions: Option<Arc<dyn ExecutionStore>>,
    state: Option<Arc<dyn StateStore>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    storage: Option<Arc<dyn StreamStorage>>,
    registry: WorkerRegistry,
    config: EngineConfig,
    on_result: Option<ResultCallback>,
}

impl fmt::Debug for StageEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageEngineBuilder")
            .field("executions", &self.executions.as_ref().map(|_| "..."))
            .field("state", &self.state.as_ref().map(|_| "..."))
            .field("dispatcher", &self.dispatcher.as_ref().map(|_| "..."))
            .field("storage", &self.storage.as_ref().map(|_| "..."))
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("on_result", &self.on_result.as_ref().map(|_| "..."))
            .finish()
    }
}

impl StageEngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the execution store (required).
    pub fn executions(mut self, executions: Arc<dyn ExecutionStore>) -> Self {
        self.executions = Some(executions);
        self
    }

    /// Set the coordination key store (required).
    pub fn state(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the dispatcher (required).
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set the stream storage used by file splitting.
    pub fn storage(mut self, storage: Arc<dyn StreamStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the worker registry. Default: empty, every stage runs the default worker.
    pub fn registry(mut self, registry: WorkerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the engine settings.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the post-result callback.
    pub fn on_result<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TriggerBody, &StageResult) + Send + Sync + 'static,
    {
        self.on_result = Some(Arc::new(callback));
        self
    }

    /// Build the engine.
    ///
    /// Returns an error if a required collaborator is missing.
    pub fn build(self) -> Result<StageEngine> {
        let missing = |name: &str| CoreError::Configuration(format!("{name} is required"));
        let services = Services {
            executions: self.executions.ok_or_else(|| missing("execution store"))?,
            state: self.state.ok_or_else(|| missing("state store"))?,
            dispatcher: self.dispatcher.ok_or_else(|| missing("dispatcher"))?,
            storage: self.storage,
        };

        let mut engine = StageEngine::new(services, self.registry, self.config);
        engine.on_result = self.on_result;
        Ok(engine)
    }
}

/// Runs stage executions.
pub struct StageEngine {
    services: Services,
    registry: WorkerRegistry,
    config: EngineConfig,
    coordinator: SplitCoordinator,
    on_result: Option<ResultCallback>,
}

impl fmt::Debug for StageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageEngine")
            .field("services", &self.services)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("on_result", &self.on_result.as_ref().map(|_| "..."))
            .finish()
    }
}

impl StageEngine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> StageEngineBuilder {
        StageEngineBuilder::new()
    }

    /// Engine over explicit collaborators.
    pub fn new(services: Services, registry: WorkerRegistry, config: EngineConfig) -> Self {
        let coordinator = SplitCoordinator::new(services.clone(), config.clone());
        Self {
            services,
            registry,
            config,
            coordinator,
            on_result: None,
        }
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Injected collaborators.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// The split coordinator used for stages with a child stage.
    pub fn coordinator(&self) -> &SplitCoordinator {
        &self.coordinator
    }

    /// Run one stage execution pass.
    ///
    /// Returns `None` when there is nothing to report: a coordinator lost the finalization
    /// race, observed an already finalized split, or a resume found its row already final.
    #[instrument(
        skip(self, body),
        fields(
            stage_uid = %body.stage_uid,
            transaction_uid = %body.transaction_uid,
            index = body.index
        )
    )]
    pub async fn initialize(&self, body: TriggerBody) -> Option<StageResult> {
        let started_at = Utc::now();
        let worker = self.registry.resolve(&body.stage_uid);

        let mut ctx = match self.load_context(&body, worker.as_ref()).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => {
                debug!("Row already final, resume ignored");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Stage execution could not be loaded");
                let result = stamp(build_execution_error(&e), started_at);
                if let Err(e) = self.propagate_unloaded(&body, &result).await {
                    error!(error = %e, "Failed to propagate load failure");
                }
                return Some(result);
            }
        };

        let result = match self.run(&mut ctx, worker.as_ref()).await {
            Ok(Some(result)) => Some(stamp(result, started_at)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, code = e.error_code(), "Stage execution failed");
                Some(stamp(build_execution_error(&e), started_at))
            }
        };

        // The returned result is the one handed to the queues, even if a later hop failed.
        if let Some(result) = &result {
            if let Err(e) = self.propagate(&mut ctx, worker.as_ref(), result).await {
                error!(
                    error = %e,
                    code = e.error_code(),
                    status = %result.status_uid,
                    "Failed to propagate result"
                );
            }
        }

        if let Err(e) = worker.on_destroy(&mut ctx).await {
            warn!(error = %e, "on_destroy failed");
        }

        if let Some(result) = &result {
            info!(status = %result.status_uid, "Stage execution finished");
        }
        result
    }

    async fn load_context(
        &self,
        body: &TriggerBody,
        worker: &dyn StageWorker,
    ) -> Result<Option<StageExecutionContext>> {
        let store = &self.services.executions;
        let forced = body
            .options
            .get("forceUpdate")
            .is_some_and(is_value_activated);

        let (execution, mocked) = match &body.mock_stage_execution {
            Some(mock) => (mock.clone(), true),
            None => {
                let latest = store
                    .find_latest_execution(
                        &body.transaction_uid,
                        &body.stage_uid,
                        body.execution_uid.as_deref().unwrap_or_default(),
                        body.index,
                    )
                    .await?;
                match latest {
                    Some(row) if body.resume && row.status_uid.is_final() => return Ok(None),
                    Some(row) if forced || row.status_uid.is_reusable() => (row, false),
                    _ => {
                        return Err(CoreError::NotInitialized {
                            stage_uid: body.stage_uid.clone(),
                            execution_uid: body.execution_uid.clone().unwrap_or_default(),
                            index: body.index,
                        });
                    }
                }
            }
        };

        let (module_uid, _) = split_stage_uid(&body.stage_uid);
        let module_execution = store
            .get_module_execution(&body.transaction_uid, module_uid)
            .await?;
        let project_uid = body
            .project_uid
            .clone()
            .or_else(|| module_execution.as_ref().and_then(|m| m.project_uid.clone()));

        let project = match project_uid.as_deref() {
            Some(uid) => store.get_project_config(uid).await?,
            None => None,
        };
        let module = store
            .get_module_config(module_uid, project_uid.as_deref())
            .await?;
        let stage = match &module {
            Some(module) => store.get_stage_config(module.id, &body.stage_uid).await?,
            None => None,
        };

        let (stage_config, stage_options) = stage
            .map(|s| (s.holder.config, s.holder.options))
            .unwrap_or_default();

        let injected = match body.options.get(INJECTED_CONFIG_KEY) {
            Some(Value::Object(map)) => map.clone(),
            _ => JsonMap::new(),
        };
        let mut body_options = body.options.clone();
        body_options.remove(INJECTED_CONFIG_KEY);

        let default_config = worker.default_config();
        let stage_holder = ConfigHolder {
            config: merge_layers([
                &default_config,
                &stage_config,
                &injected,
                &execution.data.config,
            ]),
            options: merge_layers([&stage_options, &body_options, &execution.data.options]),
        };
        let layers = ConfigLayers::new(
            Some(stage_holder),
            module.map(|m| m.holder),
            project.map(|p| p.holder),
        );

        debug!(execution_id = execution.id, mocked, "Stage execution loaded");
        Ok(Some(StageExecutionContext::new(
            body.clone(),
            execution,
            module_execution,
            layers,
            self.services.clone(),
            self.config.clone(),
            mocked,
        )))
    }

    fn child_stage(ctx: &StageExecutionContext) -> Option<String> {
        if ctx
            .layers()
            .is_inherited_config_activated(SKIP_CHILDREN_KEY, ConfigKey::Config)
        {
            return None;
        }
        ctx.resolve_str(CHILD_STAGE_KEY).map(str::to_string)
    }

    async fn run(
        &self,
        ctx: &mut StageExecutionContext,
        worker: &dyn StageWorker,
    ) -> Result<Option<StageResult>> {
        worker.on_initialize(ctx).await?;
        validate_required(ctx.options(), &worker.required_options())?;
        worker.on_before_execute(ctx).await?;

        let mut result = match Self::child_stage(ctx) {
            Some(child_stage) => match self.coordinator.run(ctx, worker, &child_stage).await? {
                Some(result) => result,
                None => return Ok(None),
            },
            None => {
                if !ctx.is_side_effect_free() {
                    ctx.execution_mut().status_uid = StatusUid::Process;
                    self.services
                        .executions
                        .update_execution(ctx.execution())
                        .await?;
                }
                worker.execute(ctx).await?
            }
        };

        worker.on_before_result(ctx, &mut result).await?;
        Ok(Some(result))
    }

    async fn persist(&self, ctx: &mut StageExecutionContext, result: &StageResult) -> Result<()> {
        let forced = ctx.is_forced();
        let execution = ctx.execution_mut();
        // A coordinator that is still waiting leaves the row alone; a concurrent finalizer owns it.
        if !forced
            && execution.status_uid == StatusUid::Waiting
            && result.status_uid == StatusUid::Waiting
        {
            debug!(execution_id = execution.id, "Row already waiting");
            return Ok(());
        }
        // Re-entries of a waiting coordinator continue the same attempt.
        if execution.status_uid != StatusUid::Waiting || execution.system.started_at.is_none() {
            execution.system.started_at = result.system.started_at;
        }
        execution.system.finished_at = result.system.finished_at;
        execution.status_uid = result.status_uid;
        if result.status_uid.is_failure() {
            execution.error.push(ExecutionErrorEntry {
                status_uid: result.status_uid,
                error_code: result.error_code.clone(),
                error_message: result.error_message.clone(),
                created_at: result.system.finished_at.unwrap_or_else(Utc::now),
            });
        }
        self.services
            .executions
            .update_execution(ctx.execution())
            .await
    }

    async fn send_result(
        &self,
        body: &TriggerBody,
        execution_uid: Option<String>,
        result: &StageResult,
    ) -> Result<()> {
        if self.config.skip_queues {
            debug!("Queues skipped, result not sent");
            return Ok(());
        }
        let message = ResultMessage {
            project_uid: body.project_uid.clone(),
            transaction_uid: body.transaction_uid.clone(),
            stage_uid: body.stage_uid.clone(),
            execution_uid,
            index: body.index,
            result: result.clone(),
        };
        let topic = &self.config.workflow_topic;
        self.services
            .dispatcher
            .send_to_queue(
                topic,
                &serde_json::to_value(&message)?,
                &send_options(&self.config, topic, &body.prefix),
            )
            .await
    }

    /// Report a final child result to its coordinator and re-trigger the coordinating stage.
    async fn notify_parent(
        &self,
        body: &TriggerBody,
        parent: &ParentRef,
        result: &StageResult,
    ) -> Result<()> {
        self.coordinator
            .report(parent, body.index, result.status_uid, result.info.as_ref())
            .await?;

        if self.config.skip_queues {
            return Ok(());
        }
        let resume = TriggerBody {
            stage_uid: parent.stage_uid.clone(),
            execution_uid: parent.execution_uid.clone(),
            transaction_uid: body.transaction_uid.clone(),
            project_uid: body.project_uid.clone(),
            date: body.date,
            index: parent.index,
            prefix: body.prefix.clone(),
            parent: parent.parent.as_deref().cloned(),
            resume: true,
            ..Default::default()
        };
        debug!(parent = %parent.stage_uid, "Re-triggering coordinating stage");
        self.services
            .dispatcher
            .send_to_queue(
                &parent.stage_uid,
                &serde_json::to_value(&resume)?,
                &send_options(&self.config, &parent.stage_uid, &body.prefix),
            )
            .await
    }

    async fn propagate(
        &self,
        ctx: &mut StageExecutionContext,
        worker: &dyn StageWorker,
        result: &StageResult,
    ) -> Result<()> {
        if ctx.is_side_effect_free() {
            debug!(mocked = ctx.is_mocked(), "Side-effect free pass, result kept local");
            return worker.on_after_result(ctx, result).await;
        }

        let final_for_parent = match result.status_uid {
            StatusUid::Done | StatusUid::Failed | StatusUid::Unknown => true,
            StatusUid::Error => ctx.retry().is_last_attempt(),
            _ => false,
        };

        self.persist(ctx, result).await?;

        if let Some(callback) = &self.on_result {
            callback(ctx.body(), result);
        }

        let execution_uid = Some(ctx.execution_uid().to_string()).filter(|uid| !uid.is_empty());
        self.send_result(ctx.body(), execution_uid, result).await?;

        if final_for_parent {
            if let Some(parent) = &ctx.body().parent {
                self.notify_parent(ctx.body(), parent, result).await?;
            }
        }

        worker.on_after_result(ctx, result).await?;

        let triggers = ctx.take_triggers();
        if self.config.skip_queues {
            debug!(count = triggers.len(), "Queues skipped, stacked triggers dropped");
            return Ok(());
        }
        for trigger in &triggers {
            self.services
                .dispatcher
                .send_to_queue(&trigger.topic, &trigger.body, &trigger.options)
                .await?;
        }
        if !triggers.is_empty() {
            debug!(count = triggers.len(), "Stacked triggers sent");
        }
        Ok(())
    }

    /// Propagation for invocations whose row could not be loaded.
    async fn propagate_unloaded(&self, body: &TriggerBody, result: &StageResult) -> Result<()> {
        if body.pure || body.mock_stage_execution.is_some() {
            return Ok(());
        }
        if let Some(callback) = &self.on_result {
            callback(body, result);
        }
        self.send_result(body, body.execution_uid.clone(), result).await?;
        if let Some(parent) = &body.parent {
            self.notify_parent(body, parent, result).await?;
        }
        Ok(())
    }
}
