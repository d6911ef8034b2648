// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deep merge for JSON values.
//!
//! Objects merge key by key, recursively. Anything else in `source` replaces what
//! `target` had, so later layers always win.

use serde_json::Value;

use crate::model::JsonMap;

/// Merge `source` into `target`.
pub fn deep_merge(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => deep_merge_maps(target, source),
        (target, source) => *target = source.clone(),
    }
}

/// Merge `source` into `target`, key by key.
pub fn deep_merge_maps(target: &mut JsonMap, source: &JsonMap) {
    for (key, value) in source {
        match target.get_mut(key) {
            Some(existing) => deep_merge(existing, value),
            None => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Merge maps in ascending precedence.
pub fn merge_layers<'a>(layers: impl IntoIterator<Item = &'a JsonMap>) -> JsonMap {
    let mut merged = JsonMap::new();
    for layer in layers {
        deep_merge_maps(&mut merged, layer);
    }
    merged
}
