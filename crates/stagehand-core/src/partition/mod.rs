// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Partitioning strategies.
//!
//! A strategy turns a unit of work into `length` independent partitions, each resumable by
//! its index alone. The split coordinator asks the strategy for [`Partitions`] and emits
//! one child trigger per index.

pub mod cursor;
pub mod file_split;
pub mod offset;
pub mod source;

pub use self::cursor::CursorPager;
pub use self::file_split::{FilePart, FileSplitStrategy, FileSplitter, PartSink, SplitOptions, SplitReport, StorageSink};
pub use self::offset::OffsetPager;
pub use self::source::{MemoryRowSource, RowSource};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::resolver::{ConfigKey, ConfigLayers, value_as_u64};

/// Config name of the total item count.
pub const COUNT_KEY: &str = "count";
/// Config name of the per-partition item limit.
pub const BULK_LIMIT_KEY: &str = "bulkLimit";
/// Config name of the partition count cap.
pub const LENGTH_LIMIT_KEY: &str = "lengthLimit";

/// Sizing of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partitions {
    /// Total number of items.
    pub count: u64,
    /// Number of partitions.
    pub length: u64,
    /// Items per partition.
    pub total_limit: u64,
    /// Where partition payloads live, for strategies that materialize them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

fn div_ceil(a: u64, b: u64) -> u64 {
    if b == 0 { 0 } else { a.div_ceil(b) }
}

impl Partitions {
    /// Size `count` items into partitions of `bulk_limit`, capped at `length_limit`
    /// partitions. When the cap applies each partition grows to `ceil(count / cap)`.
    ///
    /// A zero `bulk_limit` puts every item in one partition.
    pub fn compute(count: u64, bulk_limit: u64, length_limit: Option<u64>) -> Self {
        let bulk_limit = if bulk_limit == 0 { count } else { bulk_limit };
        let mut length = div_ceil(count, bulk_limit);
        let mut total_limit = bulk_limit;

        if let Some(cap) = length_limit.filter(|cap| *cap > 0)
            && length > cap
        {
            length = cap;
            total_limit = div_ceil(count, cap);
        }

        Self {
            count,
            length,
            total_limit,
            location: None,
        }
    }

    /// Partitions already materialized at `location`.
    pub fn materialized(count: u64, length: u64, total_limit: u64, location: impl Into<String>) -> Self {
        Self {
            count,
            length,
            total_limit,
            location: Some(location.into()),
        }
    }

    /// `(offset, limit)` of partition `index`. The last partition is trimmed to `count`.
    pub fn bounds(&self, index: u64) -> (u64, u64) {
        let offset = index.saturating_mul(self.total_limit);
        let limit = self.total_limit.min(self.count.saturating_sub(offset));
        (offset, limit)
    }

    /// Payload location of partition `index`, if materialized.
    pub fn path(&self, index: u64) -> Option<String> {
        self.location.as_ref().map(|loc| format!("{loc}/{index}"))
    }

    /// Whether there is nothing to fan out.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Produces the sizing of a fan-out.
#[async_trait]
pub trait PartitionStrategy: Send + Sync {
    /// Compute partitions. Strategies that materialize payloads do so here.
    async fn partition(&self) -> Result<Partitions>;

    /// Sizing only, for passes that must not write anything. Defaults to [`partition`].
    ///
    /// [`partition`]: PartitionStrategy::partition
    async fn estimate(&self) -> Result<Partitions> {
        self.partition().await
    }
}

/// Sizing read straight from config: `count`, `bulkLimit` and optional `lengthLimit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticCount {
    /// Total number of items.
    pub count: u64,
    /// Items per partition.
    pub bulk_limit: u64,
    /// Partition count cap.
    pub length_limit: Option<u64>,
}

impl StaticCount {
    /// Read sizing from the resolved layers, falling back to options.
    ///
    /// An explicit `count` of `0` sizes an empty fan-out; an absent `count` is invalid.
    pub fn from_layers(layers: &ConfigLayers) -> Result<Self> {
        let lookup = |name: &str| {
            layers
                .resolve(name, ConfigKey::Config)
                .or_else(|| layers.resolve(name, ConfigKey::Options))
                .and_then(value_as_u64)
        };
        let zeroed = |name: &str| {
            layers.is_inherited_config_deactivated(name, ConfigKey::Config)
                || layers.is_inherited_config_deactivated(name, ConfigKey::Options)
        };

        let count = match lookup(COUNT_KEY) {
            Some(count) => count,
            None if zeroed(COUNT_KEY) => 0,
            None => {
                return Err(CoreError::validation(
                    COUNT_KEY,
                    "split stages need a count or a partition strategy",
                ));
            }
        };

        Ok(Self {
            count,
            bulk_limit: lookup(BULK_LIMIT_KEY).unwrap_or(0),
            length_limit: lookup(LENGTH_LIMIT_KEY),
        })
    }
}

#[async_trait]
impl PartitionStrategy for StaticCount {
    async fn partition(&self) -> Result<Partitions> {
        Ok(Partitions::compute(self.count, self.bulk_limit, self.length_limit))
    }
}
