// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation execution context.
//!
//! Everything a worker may touch during one pass is reachable from the
//! [`StageExecutionContext`]: the trigger body, the loaded row, the resolved config
//! layers and the injected [`Services`].

use std::fmt;
use std::sync::{Arc, LazyLock};

use chrono::{NaiveDate, Utc};
use serde_json::Value;

use crate::dispatch::{Dispatcher, SendOptions};
use crate::engine::EngineConfig;
use crate::model::{JsonMap, ModuleExecution, StageExecution, TriggerBody};
use crate::persistence::ExecutionStore;
use crate::resolver::{ConfigLayers, is_value_activated};
use crate::retry::RetryPolicy;
use crate::state_store::StateStore;
use crate::storage::StreamStorage;
use crate::uid::{UidEnv, build_execution_uid};

/// Option keys that force a stage to restart.
pub const FORCE_KEYS: [&str; 2] = ["force", "forceUpdate"];

static EMPTY: LazyLock<JsonMap> = LazyLock::new(JsonMap::new);

/// External collaborators shared by every invocation.
#[derive(Clone)]
pub struct Services {
    /// Stage/module executions and config rows.
    pub executions: Arc<dyn ExecutionStore>,
    /// Coordination keys.
    pub state: Arc<dyn StateStore>,
    /// Queue client.
    pub dispatcher: Arc<dyn Dispatcher>,
    /// File storage, when the deployment has one.
    pub storage: Option<Arc<dyn StreamStorage>>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("executions", &"...")
            .field("state", &"...")
            .field("dispatcher", &"...")
            .field("storage", &self.storage.as_ref().map(|_| "..."))
            .finish()
    }
}

/// A message queued during the pass, sent after the result is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StackedTrigger {
    /// Destination topic.
    pub topic: String,
    /// Message body.
    pub body: Value,
    /// Routing options.
    pub options: SendOptions,
}

/// State of one stage execution pass.
pub struct StageExecutionContext {
    body: TriggerBody,
    execution: StageExecution,
    module_execution: Option<ModuleExecution>,
    layers: ConfigLayers,
    services: Services,
    config: EngineConfig,
    triggers: Vec<StackedTrigger>,
    mocked: bool,
}

impl fmt::Debug for StageExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageExecutionContext")
            .field("stage_uid", &self.body.stage_uid)
            .field("execution_id", &self.execution.id)
            .field("index", &self.body.index)
            .field("mocked", &self.mocked)
            .field("stacked_triggers", &self.triggers.len())
            .finish()
    }
}

impl StageExecutionContext {
    /// Context over a loaded row and resolved layers.
    pub fn new(
        body: TriggerBody,
        execution: StageExecution,
        module_execution: Option<ModuleExecution>,
        layers: ConfigLayers,
        services: Services,
        config: EngineConfig,
        mocked: bool,
    ) -> Self {
        Self {
            body,
            execution,
            module_execution,
            layers,
            services,
            config,
            triggers: Vec::new(),
            mocked,
        }
    }

    /// The trigger body.
    pub fn body(&self) -> &TriggerBody {
        &self.body
    }

    /// The stage execution row.
    pub fn execution(&self) -> &StageExecution {
        &self.execution
    }

    /// Mutable access to the row. Changes are persisted with the result.
    pub fn execution_mut(&mut self) -> &mut StageExecution {
        &mut self.execution
    }

    /// Owning module execution, when one exists.
    pub fn module_execution(&self) -> Option<&ModuleExecution> {
        self.module_execution.as_ref()
    }

    /// Resolved config layers. The stage layer holds the merged config and options.
    pub fn layers(&self) -> &ConfigLayers {
        &self.layers
    }

    /// Injected collaborators.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Engine settings.
    pub fn engine_config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stage uid from the trigger body.
    pub fn stage_uid(&self) -> &str {
        &self.body.stage_uid
    }

    /// Execution uid of the row, falling back to the body's.
    pub fn execution_uid(&self) -> &str {
        match self.execution.execution_uid() {
            "" => self.body.execution_uid.as_deref().unwrap_or_default(),
            uid => uid,
        }
    }

    /// Partition index.
    pub fn index(&self) -> u64 {
        self.body.index
    }

    /// Whether the pass runs on a dry-run row.
    pub fn is_mocked(&self) -> bool {
        self.mocked
    }

    /// Whether the pass skips persistence and dispatching.
    pub fn is_side_effect_free(&self) -> bool {
        self.mocked || self.body.pure
    }

    /// Whether the caller asked for a restart.
    pub fn is_forced(&self) -> bool {
        FORCE_KEYS
            .iter()
            .any(|key| self.body.options.get(*key).is_some_and(is_value_activated))
    }

    /// Merged config of the stage.
    pub fn config(&self) -> &JsonMap {
        self.layers.stage.as_ref().map_or(&*EMPTY, |h| &h.config)
    }

    /// Merged options of the stage.
    pub fn options(&self) -> &JsonMap {
        self.layers.stage.as_ref().map_or(&*EMPTY, |h| &h.options)
    }

    /// First activated config value across stage, module and project.
    pub fn resolve(&self, name: &str) -> Option<&Value> {
        self.layers.resolve_config(name)
    }

    /// First activated config value, as a string.
    pub fn resolve_str(&self, name: &str) -> Option<&str> {
        self.resolve(name).and_then(Value::as_str)
    }

    /// Retry facts for this row.
    pub fn retry(&self) -> RetryPolicy<'_> {
        RetryPolicy::new(&self.layers, &self.execution, self.config.default_retry_limit)
    }

    /// Business date: module execution date, then body date, then today.
    pub fn date(&self) -> NaiveDate {
        self.module_execution
            .as_ref()
            .map(|m| m.date)
            .or(self.body.date)
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Build a child execution uid for `stage_uid` at `index` of `count`.
    pub fn build_execution_uid(&self, raw: &str, stage_uid: &str, index: u64, count: u64) -> String {
        let env = UidEnv::new(self.execution_uid(), stage_uid)
            .with_position(index, count)
            .with_date(self.date());
        build_execution_uid(raw, &env)
    }

    /// Send options for `topic`: the caller's prefix hint, except on the control topic.
    pub fn send_options(&self, topic: &str) -> SendOptions {
        if topic == self.config.workflow_topic {
            SendOptions::default()
        } else {
            SendOptions::with_prefix(self.body.prefix.clone())
        }
    }

    /// Queue a message to be sent once the result is persisted.
    pub fn stack_trigger(&mut self, topic: impl Into<String>, body: Value) {
        let topic = topic.into();
        let options = self.send_options(&topic);
        self.triggers.push(StackedTrigger {
            topic,
            body,
            options,
        });
    }

    /// Messages queued so far.
    pub fn stacked_triggers(&self) -> &[StackedTrigger] {
        &self.triggers
    }

    pub(crate) fn take_triggers(&mut self) -> Vec<StackedTrigger> {
        std::mem::take(&mut self.triggers)
    }
}
