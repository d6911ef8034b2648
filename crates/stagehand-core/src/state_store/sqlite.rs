// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed state store over the `state_values` table.
//!
//! Prefix matching uses `substr` rather than `LIKE`, since `_` is common in keys and is a
//! `LIKE` wildcard.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::error::CoreError;

use super::{StateStore, member_key};

/// State store sharing a pool with [`SqliteExecutionStore`](crate::persistence::SqliteExecutionStore).
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Store over an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get_value(&self, key: &str) -> Result<Option<String>, CoreError> {
        let row = sqlx::query("SELECT value FROM state_values WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.try_get::<String, _>("value")).transpose()?)
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO state_values (key, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn save_by(&self, key: &str, to: &str, from: &str) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE state_values
            SET value = ?, updated_at = CURRENT_TIMESTAMP
            WHERE key = ? AND value = ?
            "#,
        )
        .bind(to)
        .bind(key)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn push(&self, key: &str, member: &str, value: &str) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO state_values (key, value, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            "#,
        )
        .bind(member_key(key, member))
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_array(&self, key: &str) -> Result<Vec<String>, CoreError> {
        let prefix = format!("{key}/");
        let rows = sqlx::query(
            r#"
            SELECT value FROM state_values
            WHERE substr(key, 1, length(?1)) = ?1
            ORDER BY key
            "#,
        )
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("value").map_err(CoreError::from))
            .collect()
    }

    async fn clear_by_prefix(&self, prefix: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM state_values WHERE substr(key, 1, length(?1)) = ?1")
            .bind(prefix)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
