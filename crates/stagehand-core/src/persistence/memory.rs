// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory execution store for tests and embedding.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::CoreError;
use crate::model::{ModuleConfig, ModuleExecution, ProjectConfig, StageConfig, StageExecution};

use super::ExecutionStore;

#[derive(Default)]
struct Tables {
    next_id: i64,
    executions: Vec<StageExecution>,
    module_executions: Vec<ModuleExecution>,
    project_configs: Vec<ProjectConfig>,
    module_configs: Vec<ModuleConfig>,
    stage_configs: Vec<StageConfig>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Execution store backed by vectors behind a mutex.
///
/// Ids are allocated from one counter shared by every table.
#[derive(Default)]
pub struct MemoryExecutionStore {
    tables: Mutex<Tables>,
}

impl MemoryExecutionStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, CoreError> {
        self.tables.lock().map_err(|_| CoreError::DatabaseError {
            operation: "lock".to_string(),
            details: "memory store mutex poisoned".to_string(),
        })
    }

    /// Insert a project config row, returning its id.
    pub fn insert_project_config(&self, mut row: ProjectConfig) -> Result<i64, CoreError> {
        let mut tables = self.lock()?;
        row.id = tables.allocate_id();
        let id = row.id;
        tables.project_configs.push(row);
        Ok(id)
    }

    /// Insert a module config row, returning its id.
    pub fn insert_module_config(&self, mut row: ModuleConfig) -> Result<i64, CoreError> {
        let mut tables = self.lock()?;
        row.id = tables.allocate_id();
        let id = row.id;
        tables.module_configs.push(row);
        Ok(id)
    }

    /// Insert a stage config row, returning its id.
    pub fn insert_stage_config(&self, mut row: StageConfig) -> Result<i64, CoreError> {
        let mut tables = self.lock()?;
        row.id = tables.allocate_id();
        let id = row.id;
        tables.stage_configs.push(row);
        Ok(id)
    }

    /// Insert a module execution row, returning its id.
    pub fn insert_module_execution(&self, mut row: ModuleExecution) -> Result<i64, CoreError> {
        let mut tables = self.lock()?;
        row.id = tables.allocate_id();
        let id = row.id;
        tables.module_executions.push(row);
        Ok(id)
    }

    /// Snapshot of every stage execution row, in insertion order.
    pub fn executions(&self) -> Vec<StageExecution> {
        self.tables
            .lock()
            .map(|tables| tables.executions.clone())
            .unwrap_or_default()
    }

    /// Snapshot of one stage execution row.
    pub fn execution(&self, id: i64) -> Option<StageExecution> {
        self.executions().into_iter().find(|e| e.id == id)
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn find_latest_execution(
        &self,
        transaction_uid: &str,
        stage_uid: &str,
        execution_uid: &str,
        index: u64,
    ) -> Result<Option<StageExecution>, CoreError> {
        let tables = self.lock()?;
        Ok(tables
            .executions
            .iter()
            .filter(|e| {
                e.transaction_uid == transaction_uid
                    && e.stage_uid == stage_uid
                    && e.system.execution_uid == execution_uid
                    && e.index == index
            })
            .max_by_key(|e| e.id)
            .cloned())
    }

    async fn create_execution(
        &self,
        execution: &StageExecution,
    ) -> Result<StageExecution, CoreError> {
        let mut tables = self.lock()?;
        let mut row = execution.clone();
        row.id = tables.allocate_id();
        tables.executions.push(row.clone());
        Ok(row)
    }

    async fn update_execution(&self, execution: &StageExecution) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        match tables.executions.iter_mut().find(|e| e.id == execution.id) {
            Some(row) => {
                *row = execution.clone();
                Ok(())
            }
            None => Err(CoreError::DatabaseError {
                operation: "update_execution".to_string(),
                details: format!("stage execution {} does not exist", execution.id),
            }),
        }
    }

    async fn get_module_execution(
        &self,
        transaction_uid: &str,
        module_uid: &str,
    ) -> Result<Option<ModuleExecution>, CoreError> {
        let tables = self.lock()?;
        Ok(tables
            .module_executions
            .iter()
            .filter(|m| m.transaction_uid == transaction_uid && m.module_uid == module_uid)
            .max_by_key(|m| m.id)
            .cloned())
    }

    async fn get_project_config(
        &self,
        project_uid: &str,
    ) -> Result<Option<ProjectConfig>, CoreError> {
        let tables = self.lock()?;
        Ok(tables
            .project_configs
            .iter()
            .find(|p| p.project_uid == project_uid)
            .cloned())
    }

    async fn get_module_config(
        &self,
        module_uid: &str,
        project_uid: Option<&str>,
    ) -> Result<Option<ModuleConfig>, CoreError> {
        let tables = self.lock()?;
        let candidates = tables
            .module_configs
            .iter()
            .filter(|m| m.module_uid == module_uid);
        let owned = candidates
            .clone()
            .find(|m| project_uid.is_some() && m.project_uid.as_deref() == project_uid);
        Ok(owned
            .or_else(|| candidates.clone().find(|m| m.project_uid.is_none()))
            .cloned())
    }

    async fn get_stage_config(
        &self,
        module_config_id: i64,
        stage_uid: &str,
    ) -> Result<Option<StageConfig>, CoreError> {
        let tables = self.lock()?;
        Ok(tables
            .stage_configs
            .iter()
            .find(|s| s.module_config_id == module_config_id && s.stage_uid == stage_uid)
            .cloned())
    }
}
