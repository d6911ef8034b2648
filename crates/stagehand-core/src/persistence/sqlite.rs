// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed execution store.
//!
//! JSON-shaped columns (`config`, `options`, `data`, `error`) are stored as TEXT.

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::CoreError;
use crate::migrations;
use crate::model::{
    ConfigHolder, ExecutionSystem, ModuleConfig, ModuleExecution, ProjectConfig, StageConfig,
    StageExecution,
};
use crate::status::StatusUid;

use super::ExecutionStore;

/// SQLite-backed execution store.
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CoreError> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T, CoreError> {
    let raw: String = row.try_get(column)?;
    Ok(serde_json::from_str(&raw)?)
}

fn holder_from_row(row: &SqliteRow) -> Result<ConfigHolder, CoreError> {
    Ok(ConfigHolder {
        config: from_json(row, "config")?,
        options: from_json(row, "options")?,
    })
}

fn execution_from_row(row: &SqliteRow) -> Result<StageExecution, CoreError> {
    let status: String = row.try_get("status_uid")?;
    let status_uid = StatusUid::parse(&status).ok_or_else(|| CoreError::DatabaseError {
        operation: "decode_stage_execution".to_string(),
        details: format!("unknown status '{status}'"),
    })?;
    let index: i64 = row.try_get("idx")?;

    Ok(StageExecution {
        id: row.try_get("id")?,
        module_execution_id: row.try_get("module_execution_id")?,
        stage_config_id: row.try_get("stage_config_id")?,
        transaction_uid: row.try_get("transaction_uid")?,
        stage_uid: row.try_get("stage_uid")?,
        index: index.max(0) as u64,
        status_uid,
        data: from_json(row, "data")?,
        error: from_json(row, "error")?,
        system: ExecutionSystem {
            execution_uid: row.try_get("execution_uid")?,
            started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at")?,
            finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
        },
    })
}

const EXECUTION_COLUMNS: &str = "id, module_execution_id, stage_config_id, transaction_uid, \
     stage_uid, execution_uid, idx, status_uid, data, error, started_at, finished_at";

impl SqliteExecutionStore {
    /// Store over an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a project config row, returning its id.
    pub async fn insert_project_config(&self, row: &ProjectConfig) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO project_configs (project_uid, config, options)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&row.project_uid)
        .bind(to_json(&row.holder.config)?)
        .bind(to_json(&row.holder.options)?)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Insert a module config row, returning its id.
    pub async fn insert_module_config(&self, row: &ModuleConfig) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO module_configs (module_uid, project_uid, config, options)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&row.module_uid)
        .bind(&row.project_uid)
        .bind(to_json(&row.holder.config)?)
        .bind(to_json(&row.holder.options)?)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Insert a stage config row, returning its id.
    pub async fn insert_stage_config(&self, row: &StageConfig) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO stage_configs (module_config_id, stage_uid, config, options)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(row.module_config_id)
        .bind(&row.stage_uid)
        .bind(to_json(&row.holder.config)?)
        .bind(to_json(&row.holder.options)?)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Insert a module execution row, returning its id.
    pub async fn insert_module_execution(&self, row: &ModuleExecution) -> Result<i64, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO module_executions (module_uid, transaction_uid, project_uid, date, parent_id)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.module_uid)
        .bind(&row.transaction_uid)
        .bind(&row.project_uid)
        .bind(row.date)
        .bind(row.parent_id)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }
}

#[async_trait::async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn find_latest_execution(
        &self,
        transaction_uid: &str,
        stage_uid: &str,
        execution_uid: &str,
        index: u64,
    ) -> Result<Option<StageExecution>, CoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {EXECUTION_COLUMNS}
            FROM stage_executions
            WHERE transaction_uid = ? AND stage_uid = ? AND execution_uid = ? AND idx = ?
            ORDER BY id DESC
            LIMIT 1
            "#
        ))
        .bind(transaction_uid)
        .bind(stage_uid)
        .bind(execution_uid)
        .bind(index as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    async fn create_execution(
        &self,
        execution: &StageExecution,
    ) -> Result<StageExecution, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO stage_executions
                (module_execution_id, stage_config_id, transaction_uid, stage_uid, execution_uid,
                 idx, status_uid, data, error, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution.module_execution_id)
        .bind(execution.stage_config_id)
        .bind(&execution.transaction_uid)
        .bind(&execution.stage_uid)
        .bind(&execution.system.execution_uid)
        .bind(execution.index as i64)
        .bind(execution.status_uid.as_str())
        .bind(to_json(&execution.data)?)
        .bind(to_json(&execution.error)?)
        .bind(execution.system.started_at)
        .bind(execution.system.finished_at)
        .execute(&self.pool)
        .await?;

        let mut created = execution.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn update_execution(&self, execution: &StageExecution) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE stage_executions
            SET status_uid = ?, data = ?, error = ?, execution_uid = ?,
                started_at = ?, finished_at = ?
            WHERE id = ?
            "#,
        )
        .bind(execution.status_uid.as_str())
        .bind(to_json(&execution.data)?)
        .bind(to_json(&execution.error)?)
        .bind(&execution.system.execution_uid)
        .bind(execution.system.started_at)
        .bind(execution.system.finished_at)
        .bind(execution.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::DatabaseError {
                operation: "update_execution".to_string(),
                details: format!("stage execution {} does not exist", execution.id),
            });
        }
        Ok(())
    }

    async fn get_module_execution(
        &self,
        transaction_uid: &str,
        module_uid: &str,
    ) -> Result<Option<ModuleExecution>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, module_uid, transaction_uid, project_uid, date, parent_id
            FROM module_executions
            WHERE transaction_uid = ? AND module_uid = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(transaction_uid)
        .bind(module_uid)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ModuleExecution {
            id: row.try_get("id")?,
            module_uid: row.try_get("module_uid")?,
            transaction_uid: row.try_get("transaction_uid")?,
            project_uid: row.try_get("project_uid")?,
            date: row.try_get::<NaiveDate, _>("date")?,
            parent_id: row.try_get("parent_id")?,
        }))
    }

    async fn get_project_config(
        &self,
        project_uid: &str,
    ) -> Result<Option<ProjectConfig>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, project_uid, config, options
            FROM project_configs
            WHERE project_uid = ?
            "#,
        )
        .bind(project_uid)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ProjectConfig {
            id: row.try_get("id")?,
            project_uid: row.try_get("project_uid")?,
            holder: holder_from_row(&row)?,
        }))
    }

    async fn get_module_config(
        &self,
        module_uid: &str,
        project_uid: Option<&str>,
    ) -> Result<Option<ModuleConfig>, CoreError> {
        // Project-owned rows sort before the project-less fallback.
        let row = sqlx::query(
            r#"
            SELECT id, module_uid, project_uid, config, options
            FROM module_configs
            WHERE module_uid = ?1 AND (project_uid IS NULL OR project_uid = ?2)
            ORDER BY project_uid IS NULL, id
            LIMIT 1
            "#,
        )
        .bind(module_uid)
        .bind(project_uid)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(ModuleConfig {
            id: row.try_get("id")?,
            module_uid: row.try_get("module_uid")?,
            project_uid: row.try_get("project_uid")?,
            holder: holder_from_row(&row)?,
        }))
    }

    async fn get_stage_config(
        &self,
        module_config_id: i64,
        stage_uid: &str,
    ) -> Result<Option<StageConfig>, CoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, module_config_id, stage_uid, config, options
            FROM stage_configs
            WHERE module_config_id = ? AND stage_uid = ?
            "#,
        )
        .bind(module_config_id)
        .bind(stage_uid)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StageConfig {
            id: row.try_get("id")?,
            module_config_id: row.try_get("module_config_id")?,
            stage_uid: row.try_get("stage_uid")?,
            holder: holder_from_row(&row)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionErrorEntry;
    use serde_json::json;

    async fn store() -> SqliteExecutionStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrations::run_sqlite(&pool).await.unwrap();
        SqliteExecutionStore::new(pool)
    }

    #[tokio::test]
    async fn test_execution_round_trip_through_columns() {
        let store = store().await;
        let mut execution = StageExecution {
            module_execution_id: 1,
            stage_config_id: 2,
            transaction_uid: "t-1".to_string(),
            stage_uid: "m1/load".to_string(),
            index: 3,
            status_uid: StatusUid::Error,
            ..Default::default()
        };
        execution.system.execution_uid = "_abc".to_string();
        execution.data.config = json!({"retryLimit": 2}).as_object().cloned().unwrap();
        execution.error.push(ExecutionErrorEntry {
            status_uid: StatusUid::Error,
            error_code: Some("TIMEOUT".to_string()),
            error_message: None,
            created_at: Utc::now(),
        });

        let created = store.create_execution(&execution).await.unwrap();
        assert!(created.id > 0);

        let found = store
            .find_latest_execution("t-1", "m1/load", "_abc", 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.status_uid, StatusUid::Error);
        assert_eq!(found.data.config["retryLimit"], 2);
        assert_eq!(found.error.len(), 1);

        let mut updated = found.clone();
        updated.status_uid = StatusUid::Done;
        store.update_execution(&updated).await.unwrap();
        let found = store
            .find_latest_execution("t-1", "m1/load", "_abc", 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.status_uid, StatusUid::Done);
    }

    #[tokio::test]
    async fn test_config_lookups() {
        let store = store().await;
        store
            .insert_project_config(&ProjectConfig {
                project_uid: "p1".to_string(),
                holder: ConfigHolder::with_config(json!({"retryLimit": 9}).as_object().cloned().unwrap()),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .insert_module_config(&ModuleConfig {
                module_uid: "m1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let owned = store
            .insert_module_config(&ModuleConfig {
                module_uid: "m1".to_string(),
                project_uid: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .insert_stage_config(&StageConfig {
                module_config_id: owned,
                stage_uid: "m1/load".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let project = store.get_project_config("p1").await.unwrap().unwrap();
        assert_eq!(project.holder.config["retryLimit"], 9);

        let module = store.get_module_config("m1", Some("p1")).await.unwrap().unwrap();
        assert_eq!(module.id, owned);
        let fallback = store.get_module_config("m1", None).await.unwrap().unwrap();
        assert_eq!(fallback.project_uid, None);

        assert!(store.get_stage_config(owned, "m1/load").await.unwrap().is_some());
        assert!(store.get_stage_config(owned, "m1/other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_row_is_an_error() {
        let store = store().await;
        let ghost = StageExecution {
            id: 404,
            ..Default::default()
        };
        let err = store.update_execution(&ghost).await.unwrap_err();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
