// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{EngineConfig, WORKFLOW_TOPIC};
use crate::retry::DEFAULT_RETRY_LIMIT;

/// Stagehand worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL or file path
    pub database_url: String,
    /// Root directory of local stream storage
    pub data_dir: PathBuf,
    /// Control topic results are sent to
    pub workflow_topic: String,
    /// Retry limit when no config layer sets one
    pub default_retry_limit: u64,
    /// Suppress all dispatching
    pub skip_queues: bool,
    /// Clear coordination keys when more children report than were spawned
    pub clear_keys_on_overflow: bool,
    /// File-split convergence poll interval
    pub split_poll_interval: Duration,
    /// File-split convergence poll bound
    pub split_poll_attempts: u32,
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

fn parse_flag(name: &'static str) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(ConfigError::Invalid(name, "must be true or false")),
        },
        Err(_) => Ok(false),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `STAGEHAND_DATABASE_URL`: SQLite connection string or file path
    ///
    /// Optional (with defaults):
    /// - `STAGEHAND_DATA_DIR`: stream storage root (default: `.data`)
    /// - `STAGEHAND_WORKFLOW_TOPIC`: control topic (default: `m0/workflow`)
    /// - `STAGEHAND_DEFAULT_RETRY_LIMIT`: retry limit fallback (default: 3)
    /// - `STAGEHAND_SKIP_QUEUES`: suppress all dispatching (default: false)
    /// - `STAGEHAND_CLEAR_KEYS_ON_OVERFLOW`: clear keys on fan-in overflow (default: false)
    /// - `STAGEHAND_SPLIT_POLL_INTERVAL_MS`: file-split poll interval (default: 50)
    /// - `STAGEHAND_SPLIT_POLL_ATTEMPTS`: file-split poll bound (default: 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("STAGEHAND_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("STAGEHAND_DATABASE_URL"))?;

        let data_dir = std::env::var("STAGEHAND_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".data"));

        let workflow_topic = std::env::var("STAGEHAND_WORKFLOW_TOPIC")
            .unwrap_or_else(|_| WORKFLOW_TOPIC.to_string());
        if workflow_topic.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "STAGEHAND_WORKFLOW_TOPIC",
                "must not be empty",
            ));
        }

        let default_retry_limit = parse_var(
            "STAGEHAND_DEFAULT_RETRY_LIMIT",
            DEFAULT_RETRY_LIMIT,
            "must be a non-negative integer",
        )?;

        let split_poll_interval_ms: u64 = parse_var(
            "STAGEHAND_SPLIT_POLL_INTERVAL_MS",
            50,
            "must be a number of milliseconds",
        )?;

        let split_poll_attempts: u32 = parse_var(
            "STAGEHAND_SPLIT_POLL_ATTEMPTS",
            100,
            "must be a positive integer",
        )?;
        if split_poll_attempts == 0 {
            return Err(ConfigError::Invalid(
                "STAGEHAND_SPLIT_POLL_ATTEMPTS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_url,
            data_dir,
            workflow_topic,
            default_retry_limit,
            skip_queues: parse_flag("STAGEHAND_SKIP_QUEUES")?,
            clear_keys_on_overflow: parse_flag("STAGEHAND_CLEAR_KEYS_ON_OVERFLOW")?,
            split_poll_interval: Duration::from_millis(split_poll_interval_ms),
            split_poll_attempts,
        })
    }

    /// Engine settings derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            workflow_topic: self.workflow_topic.clone(),
            default_retry_limit: self.default_retry_limit,
            skip_queues: self.skip_queues,
            clear_keys_on_overflow: self.clear_keys_on_overflow,
            split_poll_interval: self.split_poll_interval,
            split_poll_attempts: self.split_poll_attempts,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
