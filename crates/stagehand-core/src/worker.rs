// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stage workers and the registry that maps stage uids to them.
//!
//! A worker supplies the business logic of one stage through lifecycle hooks. Every hook
//! has a default, so the [`DefaultWorker`] is a no-op stage that finishes DONE.
//!
//! Hook order within one pass:
//!
//! ```text
//! on_initialize → (required options check) → on_before_execute
//!     → execute | split coordinator
//!     → on_before_result → persist/send → on_after_result → on_destroy
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::StageExecutionContext;
use crate::error::Result;
use crate::model::{JsonMap, StageResult, split_stage_uid};
use crate::partition::PartitionStrategy;

/// Business logic of one stage.
#[async_trait]
pub trait StageWorker: Send + Sync {
    /// Lowest-precedence config layer.
    fn default_config(&self) -> JsonMap {
        JsonMap::new()
    }

    /// Dotted option paths that must be present before execution.
    fn required_options(&self) -> Vec<String> {
        Vec::new()
    }

    /// Called first, after the context is loaded.
    async fn on_initialize(&self, _ctx: &mut StageExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Called after required options are validated.
    async fn on_before_execute(&self, _ctx: &mut StageExecutionContext) -> Result<()> {
        Ok(())
    }

    /// Sizing of a split. `None` lets the coordinator pick a strategy from config.
    async fn partition_strategy(
        &self,
        _ctx: &StageExecutionContext,
    ) -> Result<Option<Arc<dyn PartitionStrategy>>> {
        Ok(None)
    }

    /// Values child info is merged over when a split finalizes.
    fn result_defaults(&self, _ctx: &StageExecutionContext) -> JsonMap {
        JsonMap::new()
    }

    /// Stage body for stages without a child stage.
    async fn execute(&self, _ctx: &mut StageExecutionContext) -> Result<StageResult> {
        Ok(StageResult::done())
    }

    /// Last chance to adjust the result before it is persisted.
    async fn on_before_result(
        &self,
        _ctx: &mut StageExecutionContext,
        _result: &mut StageResult,
    ) -> Result<()> {
        Ok(())
    }

    /// Called after the result is persisted and sent, before stacked triggers go out.
    async fn on_after_result(
        &self,
        _ctx: &mut StageExecutionContext,
        _result: &StageResult,
    ) -> Result<()> {
        Ok(())
    }

    /// Teardown. Errors are logged, never surfaced.
    async fn on_destroy(&self, _ctx: &mut StageExecutionContext) -> Result<()> {
        Ok(())
    }
}

/// Worker used for stages nobody registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWorker;

impl StageWorker for DefaultWorker {}

/// Creates a fresh worker per invocation.
pub type WorkerFactory = Arc<dyn Fn() -> Box<dyn StageWorker> + Send + Sync>;

/// `(moduleUid, stageName) → factory` map, populated at startup.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    factories: HashMap<(String, String), WorkerFactory>,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("WorkerRegistry").field("stages", &keys).finish()
    }
}

impl WorkerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `module_uid/stage_name`.
    pub fn register<F>(&mut self, module_uid: &str, stage_name: &str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn StageWorker> + Send + Sync + 'static,
    {
        self.factories.insert(
            (module_uid.to_string(), stage_name.to_string()),
            Arc::new(factory),
        );
        self
    }

    /// Register `W::default()` for a full stage uid.
    pub fn register_default<W>(&mut self, stage_uid: &str) -> &mut Self
    where
        W: StageWorker + Default + 'static,
    {
        let (module_uid, stage_name) = split_stage_uid(stage_uid);
        self.register(module_uid, stage_name, || Box::new(W::default()))
    }

    /// Whether a worker is registered for `stage_uid`.
    pub fn contains(&self, stage_uid: &str) -> bool {
        let (module_uid, stage_name) = split_stage_uid(stage_uid);
        self.factories
            .contains_key(&(module_uid.to_string(), stage_name.to_string()))
    }

    /// Worker for `stage_uid`, or the default worker.
    pub fn resolve(&self, stage_uid: &str) -> Box<dyn StageWorker> {
        let (module_uid, stage_name) = split_stage_uid(stage_uid);
        match self
            .factories
            .get(&(module_uid.to_string(), stage_name.to_string()))
        {
            Some(factory) => factory(),
            None => Box::new(DefaultWorker),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Extract;

    impl StageWorker for Extract {
        fn required_options(&self) -> Vec<String> {
            vec!["source.table".to_string()]
        }

        fn default_config(&self) -> JsonMap {
            json!({"bulkLimit": 500}).as_object().cloned().unwrap()
        }
    }

    #[test]
    fn test_registry_resolves_by_module_and_stage() {
        let mut registry = WorkerRegistry::new();
        registry.register_default::<Extract>("m1/extract");

        assert!(registry.contains("m1/extract"));
        assert!(!registry.contains("m2/extract"));

        let worker = registry.resolve("m1/extract");
        assert_eq!(worker.required_options(), vec!["source.table"]);
        assert_eq!(worker.default_config()["bulkLimit"], 500);

        let fallback = registry.resolve("m1/unknown");
        assert!(fallback.required_options().is_empty());
    }
}
