// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Offset paging: page `i` covers `[i * page_limit, (i + 1) * page_limit)`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::JsonMap;

use super::{PartitionStrategy, Partitions, RowSource};

/// Pager addressing rows by absolute offset.
#[derive(Clone)]
pub struct OffsetPager {
    source: Arc<dyn RowSource>,
    page_limit: u64,
}

impl OffsetPager {
    /// Pager over `source` with `page_limit` rows per page.
    pub fn new(source: Arc<dyn RowSource>, page_limit: u64) -> Self {
        Self {
            source,
            page_limit: page_limit.max(1),
        }
    }

    /// `ceil(count / page_limit)`.
    pub async fn total_pages(&self) -> Result<u64> {
        Ok(self.source.count().await?.div_ceil(self.page_limit))
    }

    /// `(offset, limit)` of page `index`.
    pub fn bounds(&self, index: u64) -> (u64, u64) {
        (index.saturating_mul(self.page_limit), self.page_limit)
    }

    /// Rows of page `index`.
    pub async fn page(&self, index: u64) -> Result<Vec<JsonMap>> {
        let (offset, limit) = self.bounds(index);
        self.source.fetch(offset, limit).await
    }
}

#[async_trait]
impl PartitionStrategy for OffsetPager {
    async fn partition(&self) -> Result<Partitions> {
        let count = self.source.count().await?;
        Ok(Partitions::compute(count, self.page_limit, None))
    }
}
