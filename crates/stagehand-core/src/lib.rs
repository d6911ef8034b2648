// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stagehand Core - Stage Execution Engine
//!
//! This crate runs the stages of a distributed ETL workflow. Each stage execution is a
//! short-lived, independently triggered unit of work: it loads its persisted row, resolves
//! layered configuration, runs business logic (or fans out into parallel child stages),
//! and propagates exactly one result.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Message queue                                   │
//! │          (trigger bodies in, results on the control topic out)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                 │ TriggerBody                         ▲ ResultMessage / child triggers
//!                 ▼                                     │
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            StageEngine                                  │
//! │    load row + config layers → worker hooks → result → propagate         │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                         │                          │
//!           ▼                         ▼                          ▼
//! ┌───────────────────┐   ┌───────────────────────┐   ┌───────────────────┐
//! │  ExecutionStore   │   │   SplitCoordinator    │   │  StreamStorage    │
//! │ rows + config     │   │ fan-out / fan-in over │   │ file splitting    │
//! │                   │   │ StateStore keys       │   │                   │
//! └───────────────────┘   └───────────────────────┘   └───────────────────┘
//! ```
//!
//! # Stage Execution Lifecycle
//!
//! ```text
//!      ┌─────────┐
//!      │ INITIAL │
//!      └────┬────┘
//!           │
//!     ┌─────┴──────────────┐
//!     │ child stage        │ no child stage
//!     ▼                    ▼
//! ┌─────────┐         ┌─────────┐
//! │ WAITING │         │ PROCESS │
//! └────┬────┘         └────┬────┘
//!      │ fan-in            │ execute
//!      └─────────┬─────────┘
//!                ▼
//!    DONE | ERROR | FAILED | UNKNOWN
//! ```
//!
//! | Code | Status | Description |
//! |------|--------|-------------|
//! | `I` | INITIAL | Row created, never executed |
//! | `W` | WAITING | Children triggered, fan-in pending |
//! | `A` | ASYNC | Handed off to an asynchronous collaborator |
//! | `P` | PROCESS | Business logic running |
//! | `D` | DONE | Finished successfully |
//! | `E` | ERROR | Failed, retryable |
//! | `F` | FAILED | Failed, expected and terminal |
//! | `U` | UNKNOWN | Failed, unexpected and terminal |
//!
//! # Split Coordination
//!
//! A stage whose config names a `childStage` fans out into one child trigger per partition.
//! Children report their final status into coordination keys, then re-trigger the parent.
//! The parent finalizes once every child has reported; a compare-and-set on the `next`
//! key makes sure exactly one re-entry does so. See [`coordinator`].
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STAGEHAND_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `STAGEHAND_DATA_DIR` | No | `.data` | Local stream storage root |
//! | `STAGEHAND_WORKFLOW_TOPIC` | No | `m0/workflow` | Control topic |
//! | `STAGEHAND_DEFAULT_RETRY_LIMIT` | No | `3` | Retry limit fallback |
//! | `STAGEHAND_SKIP_QUEUES` | No | `false` | Suppress all dispatching |
//! | `STAGEHAND_CLEAR_KEYS_ON_OVERFLOW` | No | `false` | Clear keys on fan-in overflow |
//! | `STAGEHAND_SPLIT_POLL_INTERVAL_MS` | No | `50` | File-split poll interval |
//! | `STAGEHAND_SPLIT_POLL_ATTEMPTS` | No | `100` | File-split poll bound |
//!
//! # Modules
//!
//! - [`engine`]: The stage execution state machine
//! - [`coordinator`]: Split fan-out and fan-in
//! - [`partition`]: Partitioning strategies
//! - [`resolver`]: Layered config activation and lookup
//! - [`uid`]: Execution uid token expansion
//! - [`persistence`], [`state_store`], [`dispatch`], [`storage`]: Consumed interfaces and backends

#![deny(missing_docs)]

/// Environment configuration for the worker binary.
pub mod config;

/// Per-invocation execution context.
pub mod context;

/// Split coordination: fan-out to child stages and fan-in.
pub mod coordinator;

/// Queue dispatching.
pub mod dispatch;

/// The stage execution state machine.
pub mod engine;

/// Error types with status and error code mapping.
pub mod error;

/// Deep merge of JSON values.
pub mod merge;

/// Embedded SQLite migrations.
pub mod migrations;

/// Persisted records and wire bodies.
pub mod model;

/// Partitioning strategies.
pub mod partition;

/// Execution store interface and backends.
pub mod persistence;

/// Layered config resolution.
pub mod resolver;

/// Retry attempt counting.
pub mod retry;

/// Coordination key-value store interface and backends.
pub mod state_store;

/// Status codes.
pub mod status;

/// Stream storage interface and backends.
pub mod storage;

/// Execution uid building.
pub mod uid;

/// Required option validation.
pub mod validation;

/// Stage workers and the worker registry.
pub mod worker;

pub use context::{Services, StageExecutionContext};
pub use coordinator::{FanInOutcome, SplitCoordinator, SplitKeys};
pub use engine::{EngineConfig, StageEngine, StageEngineBuilder};
pub use error::{CoreError, Result};
pub use model::{StageExecution, StageResult, TriggerBody};
pub use status::{ChildPhase, StatusUid};
pub use worker::{StageWorker, WorkerRegistry};
