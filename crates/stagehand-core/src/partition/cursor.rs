// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cursor paging.
//!
//! Page `i` seeks its first row through the cursor column value at offset
//! `i * page_limit`, then reads `page_limit` rows with a cursor value at or above it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CoreError, Result};
use crate::model::JsonMap;
use crate::status::StatusUid;

use super::{PartitionStrategy, Partitions, RowSource};

/// Pager addressing rows by a monotonic cursor column.
#[derive(Clone)]
pub struct CursorPager {
    source: Arc<dyn RowSource>,
    column: String,
    page_limit: u64,
}

impl CursorPager {
    /// Pager over `source` ordered by `column`.
    pub fn new(source: Arc<dyn RowSource>, column: impl Into<String>, page_limit: u64) -> Self {
        Self {
            source,
            column: column.into(),
            page_limit: page_limit.max(1),
        }
    }

    /// Rows of page `index`.
    pub async fn page(&self, index: u64) -> Result<Vec<JsonMap>> {
        let offset = index.saturating_mul(self.page_limit);
        let first = self
            .source
            .value_at(&self.column, offset)
            .await?
            .ok_or_else(|| {
                CoreError::worker(StatusUid::Failed, "INVALID_PAGE", "invalid page, no first row")
            })?;

        self.source
            .fetch_from(&self.column, &first, self.page_limit)
            .await
    }
}

#[async_trait]
impl PartitionStrategy for CursorPager {
    async fn partition(&self) -> Result<Partitions> {
        let count = self.source.count().await?;
        Ok(Partitions::compute(count, self.page_limit, None))
    }
}
