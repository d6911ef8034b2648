// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted records and wire bodies.
//!
//! Field names serialize in camelCase, which is the shape trigger bodies and result
//! messages have on the queue.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status::StatusUid;

/// Free-form JSON object used for config and option maps.
pub type JsonMap = serde_json::Map<String, Value>;

/// Split a `moduleUid/stageName` stage uid into its two halves.
///
/// A stage uid without a `/` has an empty module uid.
pub fn split_stage_uid(stage_uid: &str) -> (&str, &str) {
    match stage_uid.split_once('/') {
        Some((module, stage)) => (module, stage),
        None => ("", stage_uid),
    }
}

/// One configuration layer: a key/value map plus an options map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigHolder {
    /// Free-form configuration values.
    #[serde(default)]
    pub config: JsonMap,
    /// Free-form option values.
    #[serde(default)]
    pub options: JsonMap,
}

impl ConfigHolder {
    /// Holder with the given config map and no options.
    pub fn with_config(config: JsonMap) -> Self {
        Self {
            config,
            options: JsonMap::new(),
        }
    }
}

/// Project-level configuration row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Surrogate key.
    pub id: i64,
    /// Project identifier.
    pub project_uid: String,
    /// Config and options.
    #[serde(flatten)]
    pub holder: ConfigHolder,
}

/// Module-level configuration row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    /// Surrogate key.
    pub id: i64,
    /// Module identifier.
    pub module_uid: String,
    /// Owning project.
    pub project_uid: Option<String>,
    /// Config and options.
    #[serde(flatten)]
    pub holder: ConfigHolder,
}

/// Stage-level configuration row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    /// Surrogate key.
    pub id: i64,
    /// Owning module config.
    pub module_config_id: i64,
    /// Stage identifier (`moduleUid/stageName`).
    pub stage_uid: String,
    /// Config and options.
    #[serde(flatten)]
    pub holder: ConfigHolder,
}

/// One transaction's run of a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleExecution {
    /// Surrogate key.
    pub id: i64,
    /// Module identifier.
    pub module_uid: String,
    /// Transaction this run belongs to.
    pub transaction_uid: String,
    /// Owning project, when known.
    pub project_uid: Option<String>,
    /// Business date of the run.
    pub date: NaiveDate,
    /// Forwarded parent module execution.
    pub parent_id: Option<i64>,
}

/// Resolved snapshot taken when the row was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionData {
    /// Option overrides.
    #[serde(default)]
    pub options: JsonMap,
    /// Config overrides.
    #[serde(default)]
    pub config: JsonMap,
}

/// One failed attempt. The length of the error list is the attempt counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionErrorEntry {
    /// Status the attempt ended with.
    pub status_uid: StatusUid,
    /// Machine-readable error code.
    pub error_code: Option<String>,
    /// Human-readable message.
    pub error_message: Option<String>,
    /// When the failure was recorded.
    pub created_at: DateTime<Utc>,
}

/// System bookkeeping stored on the row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSystem {
    /// Partition identity of the row.
    #[serde(default)]
    pub execution_uid: String,
    /// When the latest attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the latest attempt finished.
    pub finished_at: Option<DateTime<Utc>>,
}

/// One attempt of one (stage, partition-index) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageExecution {
    /// Surrogate key, assigned by the store.
    pub id: i64,
    /// Owning module execution.
    pub module_execution_id: i64,
    /// Stage configuration row.
    pub stage_config_id: i64,
    /// Transaction the row belongs to.
    pub transaction_uid: String,
    /// Stage identifier (`moduleUid/stageName`).
    pub stage_uid: String,
    /// Partition index.
    #[serde(default)]
    pub index: u64,
    /// Current lifecycle status.
    #[serde(default)]
    pub status_uid: StatusUid,
    /// Snapshot overrides.
    #[serde(default)]
    pub data: StageExecutionData,
    /// One entry per failed attempt.
    #[serde(default)]
    pub error: Vec<ExecutionErrorEntry>,
    /// System bookkeeping.
    #[serde(default)]
    pub system: ExecutionSystem,
}

impl StageExecution {
    /// Execution uid of the row.
    pub fn execution_uid(&self) -> &str {
        &self.system.execution_uid
    }
}

/// Link from a split child back to the stage execution that spawned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    /// Coordinating stage.
    pub stage_uid: String,
    /// Coordinating stage's execution uid.
    pub execution_uid: Option<String>,
    /// Coordinating stage's partition index.
    pub index: u64,
    /// Coordinating stage execution row.
    pub stage_execution_id: i64,
    /// Child stage the split runs.
    pub child_stage_uid: String,
    /// The coordinator's own parent, for nested splits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<ParentRef>>,
}

/// Trigger message body that starts one stage execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerBody {
    /// Stage to run (`moduleUid/stageName`).
    pub stage_uid: String,
    /// Partition identity.
    #[serde(default)]
    pub execution_uid: Option<String>,
    /// Transaction the run belongs to.
    pub transaction_uid: String,
    /// Owning project.
    #[serde(default)]
    pub project_uid: Option<String>,
    /// Business date override.
    #[serde(default)]
    pub date: Option<NaiveDate>,
    /// Partition index.
    #[serde(default)]
    pub index: u64,
    /// Caller options; an object under `config` is injected as config.
    #[serde(default)]
    pub options: JsonMap,
    /// Dry-run execution used instead of a persisted row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_stage_execution: Option<StageExecution>,
    /// Run without side effects.
    #[serde(default)]
    pub pure: bool,
    /// Queue-prefix routing hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Set on split children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    /// Set when a child report re-enters its coordinating stage.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resume: bool,
}

/// Timestamps stamped on every propagated result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSystem {
    /// When the invocation started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the invocation finished.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of one stage execution pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    /// Resulting status.
    pub status_uid: StatusUid,
    /// Free-form result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    /// Machine-readable error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Timestamps.
    #[serde(default)]
    pub system: ResultSystem,
}

impl StageResult {
    /// Result with the given status and nothing else.
    pub fn new(status_uid: StatusUid) -> Self {
        Self {
            status_uid,
            ..Default::default()
        }
    }

    /// DONE result.
    pub fn done() -> Self {
        Self::new(StatusUid::Done)
    }

    /// WAITING result.
    pub fn waiting() -> Self {
        Self::new(StatusUid::Waiting)
    }

    /// Failure result with code and message.
    pub fn failure(
        status_uid: StatusUid,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            status_uid,
            error_code: Some(error_code.into()),
            error_message: Some(error_message.into()),
            ..Default::default()
        }
    }

    /// Attach an info payload.
    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }
}

/// Message sent to the control topic after every invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    /// Owning project.
    pub project_uid: Option<String>,
    /// Transaction the run belongs to.
    pub transaction_uid: String,
    /// Stage that produced the result.
    pub stage_uid: String,
    /// Partition identity.
    pub execution_uid: Option<String>,
    /// Partition index.
    pub index: u64,
    /// The result itself.
    pub result: StageResult,
}
