// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution persistence interface and backends.
//!
//! The relational layer that owns stage executions, module executions and config rows
//! lives outside the core. The core consumes it through [`ExecutionStore`].

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryExecutionStore;
pub use self::sqlite::SqliteExecutionStore;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::model::{ModuleConfig, ModuleExecution, ProjectConfig, StageConfig, StageExecution};

/// Persistence interface used by the engine and the split coordinator.
#[allow(missing_docs)]
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Latest row (highest id) for the given stage partition, whatever its status.
    async fn find_latest_execution(
        &self,
        transaction_uid: &str,
        stage_uid: &str,
        execution_uid: &str,
        index: u64,
    ) -> Result<Option<StageExecution>, CoreError>;

    /// Insert a row. The returned copy carries the assigned id.
    async fn create_execution(&self, execution: &StageExecution)
    -> Result<StageExecution, CoreError>;

    /// Overwrite a row by id.
    async fn update_execution(&self, execution: &StageExecution) -> Result<(), CoreError>;

    async fn get_module_execution(
        &self,
        transaction_uid: &str,
        module_uid: &str,
    ) -> Result<Option<ModuleExecution>, CoreError>;

    async fn get_project_config(&self, project_uid: &str)
    -> Result<Option<ProjectConfig>, CoreError>;

    /// Module config, preferring a row owned by `project_uid` over a project-less one.
    async fn get_module_config(
        &self,
        module_uid: &str,
        project_uid: Option<&str>,
    ) -> Result<Option<ModuleConfig>, CoreError>;

    async fn get_stage_config(
        &self,
        module_config_id: i64,
        stage_uid: &str,
    ) -> Result<Option<StageConfig>, CoreError>;
}
