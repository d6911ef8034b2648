// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution uid building.
//!
//! An execution uid template may embed `:fn()` tokens that are expanded when a child or
//! trigger body is built:
//!
//! | Token | Expands to |
//! |-------|------------|
//! | `:today()` | business date, `YYYYMMDD` |
//! | `:now()` | build instant, `YYYYMMDDHHMMSS` |
//! | `:index()` | partition index |
//! | `:random()` | 8 random alphanumerics |
//! | `:uniqueid()` | simple-format UUID v4 |
//! | `:counter()` | counter that increments on every occurrence |
//! | `:count()` | number of siblings |
//! | `:keep()` | the current execution uid |
//! | `:stageuid()` | stage uid with `/` replaced by `_` |
//!
//! Unknown tokens are left untouched.
//!
//! A uid starting with `_` is *forwarded*: children built under it inherit it as a prefix,
//! so the identity survives nested splits without growing.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use regex::{Captures, Regex};

use crate::error::{CoreError, Result};

/// Prefix marking a forwarded execution uid.
pub const FORWARD_SENTINEL: char = '_';

/// Separator of the `stageUid#executionUid` encoding.
pub const STAGE_EXECUTION_SEPARATOR: char = '#';

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":([A-Za-z_]+)\(\)").expect("token pattern is valid"));

/// Inputs the expanders read from.
#[derive(Debug, Clone)]
pub struct UidEnv<'a> {
    /// Execution uid of the stage doing the building.
    pub self_execution_uid: &'a str,
    /// Stage uid of the stage being targeted.
    pub stage_uid: &'a str,
    /// Partition index of the body being built.
    pub index: u64,
    /// Number of siblings being built.
    pub count: u64,
    /// Business date.
    pub date: NaiveDate,
    /// Build instant.
    pub now: DateTime<Utc>,
    /// First value `:counter()` yields.
    pub counter_start: u64,
}

impl<'a> UidEnv<'a> {
    /// Env for a single body built now, dated today.
    pub fn new(self_execution_uid: &'a str, stage_uid: &'a str) -> Self {
        let now = Utc::now();
        Self {
            self_execution_uid,
            stage_uid,
            index: 0,
            count: 1,
            date: now.date_naive(),
            now,
            counter_start: 1,
        }
    }

    /// Set index and sibling count.
    pub fn with_position(mut self, index: u64, count: u64) -> Self {
        self.index = index;
        self.count = count;
        self
    }

    /// Set the business date.
    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = date;
        self
    }
}

/// Whether a uid is forwarded.
pub fn is_forwarded(execution_uid: &str) -> bool {
    execution_uid.starts_with(FORWARD_SENTINEL)
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

/// Expand every known token of `template`, in appearance order.
pub fn expand(template: &str, env: &UidEnv<'_>) -> String {
    let mut counter = env.counter_start;
    TOKEN
        .replace_all(template, |caps: &Captures<'_>| match &caps[1] {
            "today" => env.date.format("%Y%m%d").to_string(),
            "now" => env.now.format("%Y%m%d%H%M%S").to_string(),
            "index" => env.index.to_string(),
            "random" => random_suffix(),
            "uniqueid" => uuid::Uuid::new_v4().simple().to_string(),
            "counter" => {
                let value = counter;
                counter += 1;
                value.to_string()
            }
            "count" => env.count.to_string(),
            "keep" => env.self_execution_uid.to_string(),
            "stageuid" => env.stage_uid.replace('/', "_"),
            _ => caps[0].to_string(),
        })
        .into_owned()
}

/// Build the execution uid of a body from a raw template.
///
/// When the building stage runs under a forwarded uid and `raw` does not already start
/// with it, the forwarded uid is prepended and `:keep()` tokens are dropped. Separators
/// left dangling by that prefixing are trimmed; any other template expands verbatim.
pub fn build_execution_uid(raw: &str, env: &UidEnv<'_>) -> String {
    let own = env.self_execution_uid;
    if is_forwarded(own) && !raw.starts_with(own) {
        let template = format!("{own}-{}", raw.replace(":keep()", ""));
        return expand(&template, env).trim_end_matches('-').to_string();
    }
    expand(raw, env)
}

fn reject_separator(field: &str, value: &str) -> Result<()> {
    if value.contains(STAGE_EXECUTION_SEPARATOR) {
        return Err(CoreError::validation(
            field,
            format!("must not contain '{STAGE_EXECUTION_SEPARATOR}'"),
        ));
    }
    Ok(())
}

/// Encode `stageUid#executionUid`. Without an execution uid, the stage uid alone.
pub fn join_stage_uid_and_execution_uid(
    stage_uid: &str,
    execution_uid: Option<&str>,
) -> Result<String> {
    reject_separator("stageUid", stage_uid)?;
    match execution_uid.filter(|uid| !uid.is_empty()) {
        Some(uid) => {
            reject_separator("executionUid", uid)?;
            Ok(format!("{stage_uid}{STAGE_EXECUTION_SEPARATOR}{uid}"))
        }
        None => Ok(stage_uid.to_string()),
    }
}

/// Decode a `stageUid#executionUid` string.
pub fn separate_stage_uid_and_execution_uid(joined: &str) -> Result<(String, Option<String>)> {
    match joined.split_once(STAGE_EXECUTION_SEPARATOR) {
        Some((stage_uid, execution_uid)) => {
            reject_separator("executionUid", execution_uid)?;
            let execution_uid = (!execution_uid.is_empty()).then(|| execution_uid.to_string());
            Ok((stage_uid.to_string(), execution_uid))
        }
        None => Ok((joined.to_string(), None)),
    }
}
