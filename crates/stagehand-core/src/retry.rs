// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry attempt counting.
//!
//! The policy only computes facts. Whether a failed message is re-enqueued is decided by
//! the scheduler outside this crate.

use crate::model::StageExecution;
use crate::resolver::{ConfigLayers, value_as_u64};

/// Fallback retry limit when no layer configures one.
pub const DEFAULT_RETRY_LIMIT: u64 = 3;

/// Config name holding the retry limit.
pub const RETRY_LIMIT_KEY: &str = "retryLimit";

/// Retry facts for one stage execution.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy<'a> {
    layers: &'a ConfigLayers,
    execution: &'a StageExecution,
    default_limit: u64,
}

impl<'a> RetryPolicy<'a> {
    /// Policy over the given layers and row.
    pub fn new(layers: &'a ConfigLayers, execution: &'a StageExecution, default_limit: u64) -> Self {
        Self {
            layers,
            execution,
            default_limit,
        }
    }

    /// First activated `retryLimit` in stage, module, project config, else the default.
    pub fn retry_limit(&self) -> u64 {
        self.layers
            .resolve_config(RETRY_LIMIT_KEY)
            .and_then(value_as_u64)
            .unwrap_or(self.default_limit)
    }

    /// Number of recorded failed attempts.
    ///
    /// With `increase_by_one`, the attempt number this run would have if it failed now.
    pub fn retry_attempt(&self, increase_by_one: bool) -> u64 {
        self.execution.error.len() as u64 + u64::from(increase_by_one)
    }

    /// Whether a failure of the current run exhausts the limit.
    pub fn is_last_attempt(&self) -> bool {
        self.retry_attempt(true) >= self.retry_limit()
    }
}
