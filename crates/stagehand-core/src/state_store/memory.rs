// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory state store.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::CoreError;

use super::{StateStore, member_key};

/// State store over a mutex-guarded ordered map.
///
/// Every operation holds the lock for its whole duration, which makes `save_by` and
/// `push` atomic.
#[derive(Default)]
pub struct MemoryStateStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStateStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, key: &str) -> Result<MutexGuard<'_, BTreeMap<String, String>>, CoreError> {
        self.values.lock().map_err(|_| CoreError::StateStoreError {
            operation: "lock".to_string(),
            key: key.to_string(),
            details: "state store mutex poisoned".to_string(),
        })
    }

    /// Every key currently stored.
    pub fn keys(&self) -> Vec<String> {
        self.values
            .lock()
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_value(&self, key: &str) -> Result<Option<String>, CoreError> {
        Ok(self.lock(key)?.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), CoreError> {
        self.lock(key)?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn save_by(&self, key: &str, to: &str, from: &str) -> Result<u64, CoreError> {
        let mut values = self.lock(key)?;
        match values.get_mut(key) {
            Some(current) if current == from => {
                *current = to.to_string();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn push(&self, key: &str, member: &str, value: &str) -> Result<bool, CoreError> {
        let mut values = self.lock(key)?;
        let entry = member_key(key, member);
        if values.contains_key(&entry) {
            return Ok(false);
        }
        values.insert(entry, value.to_string());
        Ok(true)
    }

    async fn get_array(&self, key: &str) -> Result<Vec<String>, CoreError> {
        let prefix = format!("{key}/");
        let values = self.lock(key)?;
        Ok(values
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn clear_by_prefix(&self, prefix: &str) -> Result<u64, CoreError> {
        let mut values = self.lock(prefix)?;
        let before = values.len();
        values.retain(|k, _| !k.starts_with(prefix));
        Ok((before - values.len()) as u64)
    }
}
