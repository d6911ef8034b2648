// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hierarchical config resolution across stage, module and project layers.
//!
//! A value is *activated* when it is a positive number, `true`, or a non-empty
//! string/array/object. A value is *deactivated* when it is exactly `0` or `false`.
//! Layers are walked stage → module → project and the first layer that has an opinion
//! decides: an activated value wins, a deactivated value stops the walk even if a lower
//! layer holds something truthy. Absence is never an error, it resolves to "not activated".

use serde_json::Value;

use crate::model::ConfigHolder;

/// Which map of a [`ConfigHolder`] to look in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigKey {
    /// The `config` map.
    #[default]
    Config,
    /// The `options` map.
    Options,
}

/// Whether a single value counts as activated.
pub fn is_value_activated(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n > 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Null => false,
    }
}

/// Whether a single value is an explicit deactivation (`0` or `false`).
pub fn is_value_deactivated(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => !*flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        _ => false,
    }
}

fn raw_value<'a>(holder: Option<&'a ConfigHolder>, name: &str, key: ConfigKey) -> Option<&'a Value> {
    let holder = holder?;
    match key {
        ConfigKey::Config => holder.config.get(name),
        ConfigKey::Options => holder.options.get(name),
    }
}

/// Whether `name` is activated in one holder.
pub fn is_activated(holder: Option<&ConfigHolder>, name: &str, key: ConfigKey) -> bool {
    raw_value(holder, name, key).is_some_and(is_value_activated)
}

/// Whether `name` is explicitly deactivated in one holder.
pub fn deactivated(holder: Option<&ConfigHolder>, name: &str, key: ConfigKey) -> bool {
    raw_value(holder, name, key).is_some_and(is_value_deactivated)
}

/// The value of `name` in one holder, only if activated.
pub fn get_activated_value<'a>(
    holder: Option<&'a ConfigHolder>,
    name: &str,
    key: ConfigKey,
) -> Option<&'a Value> {
    raw_value(holder, name, key).filter(|value| is_value_activated(value))
}

/// Outcome of walking layers for one name.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Decision<'a> {
    Activated(&'a Value),
    Deactivated,
    Absent,
}

/// The three config layers of one stage execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigLayers {
    /// Stage layer (highest precedence).
    pub stage: Option<ConfigHolder>,
    /// Module layer.
    pub module: Option<ConfigHolder>,
    /// Project layer (lowest precedence).
    pub project: Option<ConfigHolder>,
}

impl ConfigLayers {
    /// Layers from explicit holders.
    pub fn new(
        stage: Option<ConfigHolder>,
        module: Option<ConfigHolder>,
        project: Option<ConfigHolder>,
    ) -> Self {
        Self {
            stage,
            module,
            project,
        }
    }

    fn decide<'a>(&self, holders: &[Option<&'a ConfigHolder>], name: &str, key: ConfigKey) -> Decision<'a> {
        for holder in holders {
            if deactivated(*holder, name, key) {
                return Decision::Deactivated;
            }
            if let Some(value) = get_activated_value(*holder, name, key) {
                return Decision::Activated(value);
            }
        }
        Decision::Absent
    }

    fn stage_module(&self) -> [Option<&ConfigHolder>; 2] {
        [self.stage.as_ref(), self.module.as_ref()]
    }

    fn inherited(&self) -> [Option<&ConfigHolder>; 3] {
        [self.stage.as_ref(), self.module.as_ref(), self.project.as_ref()]
    }

    /// Activated in stage or module layer.
    pub fn is_module_stage_config_activated(&self, name: &str, key: ConfigKey) -> bool {
        matches!(
            self.decide(&self.stage_module(), name, key),
            Decision::Activated(_)
        )
    }

    /// Activated in stage, module or project layer.
    pub fn is_inherited_config_activated(&self, name: &str, key: ConfigKey) -> bool {
        matches!(
            self.decide(&self.inherited(), name, key),
            Decision::Activated(_)
        )
    }

    /// Deactivated by the first layer that has an opinion on `name`.
    pub fn is_inherited_config_deactivated(&self, name: &str, key: ConfigKey) -> bool {
        matches!(
            self.decide(&self.inherited(), name, key),
            Decision::Deactivated
        )
    }

    /// First activated value of `name` across all layers.
    pub fn resolve(&self, name: &str, key: ConfigKey) -> Option<&Value> {
        match self.decide(&self.inherited(), name, key) {
            Decision::Activated(value) => Some(value),
            _ => None,
        }
    }

    /// [`resolve`](Self::resolve) in the `config` map.
    pub fn resolve_config(&self, name: &str) -> Option<&Value> {
        self.resolve(name, ConfigKey::Config)
    }
}

/// Read a numeric config value, accepting numbers and numeric strings.
pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|n| *n >= 0.0).map(|n| n.ceil() as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
