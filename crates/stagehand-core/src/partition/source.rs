// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row sources read by the pagers.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::model::JsonMap;

/// A countable, ordered collection of rows.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Total number of rows.
    async fn count(&self) -> Result<u64>;

    /// Rows `[offset, offset + limit)` in natural order.
    async fn fetch(&self, offset: u64, limit: u64) -> Result<Vec<JsonMap>>;

    /// Value of `column` of the row at `offset` when ordered by `column`.
    async fn value_at(&self, column: &str, offset: u64) -> Result<Option<Value>>;

    /// Up to `limit` rows with `column >= from`, ordered by `column`.
    async fn fetch_from(&self, column: &str, from: &Value, limit: u64) -> Result<Vec<JsonMap>>;
}

/// Orders JSON scalars: numbers numerically, strings lexically, everything else last.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Row source over a vector of rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryRowSource {
    rows: Vec<JsonMap>,
}

impl MemoryRowSource {
    /// Source over `rows`.
    pub fn new(rows: Vec<JsonMap>) -> Self {
        Self { rows }
    }

    fn sorted_by(&self, column: &str) -> Vec<&JsonMap> {
        let mut rows: Vec<&JsonMap> = self.rows.iter().collect();
        rows.sort_by(|a, b| {
            compare_values(
                a.get(column).unwrap_or(&Value::Null),
                b.get(column).unwrap_or(&Value::Null),
            )
        });
        rows
    }
}

#[async_trait]
impl RowSource for MemoryRowSource {
    async fn count(&self) -> Result<u64> {
        Ok(self.rows.len() as u64)
    }

    async fn fetch(&self, offset: u64, limit: u64) -> Result<Vec<JsonMap>> {
        Ok(self
            .rows
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn value_at(&self, column: &str, offset: u64) -> Result<Option<Value>> {
        Ok(self
            .sorted_by(column)
            .get(offset as usize)
            .and_then(|row| row.get(column).cloned()))
    }

    async fn fetch_from(&self, column: &str, from: &Value, limit: u64) -> Result<Vec<JsonMap>> {
        Ok(self
            .sorted_by(column)
            .into_iter()
            .filter(|row| {
                row.get(column)
                    .is_some_and(|v| compare_values(v, from) != Ordering::Less)
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }
}
