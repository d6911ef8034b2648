// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Required-option validation run before a stage executes.

use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::model::JsonMap;

/// Look up a dotted path (`source.table`) in a map.
pub fn lookup_path<'a>(map: &'a JsonMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = map.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(inner) => inner.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Check that every required path is present and not null.
///
/// All missing paths are reported together in one validation error.
pub fn validate_required<S: AsRef<str>>(options: &JsonMap, required: &[S]) -> Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .map(AsRef::as_ref)
        .filter(|path| matches!(lookup_path(options, path), None | Some(Value::Null)))
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    Err(CoreError::validation(
        missing.join(", "),
        "required option is missing",
    ))
}
