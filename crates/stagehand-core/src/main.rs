// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stagehand Worker - local stage runner
//!
//! Reads trigger bodies as JSON lines from stdin and runs them through the engine against
//! SQLite stores. Child and parent triggers loop back through an in-process queue until
//! it drains; control-topic results are printed to stdout as JSON lines.
//!
//! Logs go to stderr so stdout stays machine-readable.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use stagehand_core::config::Config;
use stagehand_core::dispatch::ChannelDispatcher;
use stagehand_core::migrations;
use stagehand_core::persistence::SqliteExecutionStore;
use stagehand_core::state_store::SqliteStateStore;
use stagehand_core::storage::LocalStorage;
use stagehand_core::{StageEngine, TriggerBody};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stagehand_core=info".parse()?),
        )
        .init();

    info!("Starting Stagehand worker");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        data_dir = %config.data_dir.display(),
        workflow_topic = %config.workflow_topic,
        skip_queues = config.skip_queues,
        "Configuration loaded"
    );

    // Connect to database
    let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    info!("Running database migrations...");
    migrations::run_sqlite(&pool).await?;
    info!("Migrations completed");

    let (dispatcher, mut outbox) = ChannelDispatcher::channel();
    let engine = StageEngine::builder()
        .executions(Arc::new(SqliteExecutionStore::new(pool.clone())))
        .state(Arc::new(SqliteStateStore::new(pool.clone())))
        .dispatcher(Arc::new(dispatcher))
        .storage(Arc::new(LocalStorage::new(config.data_dir.clone())))
        .config(config.engine_config())
        .build()?;

    let mut queue: VecDeque<TriggerBody> = VecDeque::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TriggerBody>(&line) {
            Ok(body) => queue.push_back(body),
            Err(e) => warn!(error = %e, "Skipping malformed trigger body"),
        }
    }

    info!(count = queue.len(), "Trigger bodies read");

    let mut stdout = tokio::io::stdout();
    let mut processed = 0u64;
    while let Some(body) = queue.pop_front() {
        engine.initialize(body).await;
        processed += 1;

        while let Ok(message) = outbox.try_recv() {
            if message.topic == config.workflow_topic {
                stdout
                    .write_all(format!("{}\n", message.body).as_bytes())
                    .await?;
                continue;
            }
            match serde_json::from_value::<TriggerBody>(message.body) {
                Ok(body) => {
                    debug!(topic = %message.topic, "Requeued trigger");
                    queue.push_back(body);
                }
                Err(e) => warn!(topic = %message.topic, error = %e, "Dropping non-trigger message"),
            }
        }
    }
    stdout.flush().await?;

    pool.close().await;
    info!(processed, "Queue drained");

    Ok(())
}
