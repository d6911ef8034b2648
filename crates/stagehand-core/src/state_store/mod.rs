// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key-value state store used for split coordination.
//!
//! Two primitives carry the coordination protocol and must be atomic in every backend:
//!
//! - [`StateStore::save_by`] is a compare-and-set. It only writes when the current value
//!   equals `from`, and reports how many keys it changed.
//! - [`StateStore::push`] is an insert-if-absent into a set. Members live under
//!   `{key}/{member}` so a duplicate report from the same child is a no-op.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryStateStore;
pub use self::sqlite::SqliteStateStore;

use async_trait::async_trait;

use crate::error::CoreError;

/// Key of a set member.
pub fn member_key(key: &str, member: &str) -> String {
    format!("{key}/{member}")
}

/// Shared key-value store.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current value of `key`.
    async fn get_value(&self, key: &str) -> Result<Option<String>, CoreError>;

    /// Unconditionally set `key`.
    async fn save(&self, key: &str, value: &str) -> Result<(), CoreError>;

    /// Set `key` to `to` only if it currently equals `from`. Returns the number of keys
    /// changed (0 or 1). An absent key is never changed.
    async fn save_by(&self, key: &str, to: &str, from: &str) -> Result<u64, CoreError>;

    /// Add `member` with `value` to the set at `key` unless already present.
    /// Returns whether the member was inserted.
    async fn push(&self, key: &str, member: &str, value: &str) -> Result<bool, CoreError>;

    /// Values of every member of the set at `key`, ordered by member key.
    async fn get_array(&self, key: &str) -> Result<Vec<String>, CoreError>;

    /// Delete every key starting with `prefix`. Returns the number deleted.
    async fn clear_by_prefix(&self, prefix: &str) -> Result<u64, CoreError>;
}
