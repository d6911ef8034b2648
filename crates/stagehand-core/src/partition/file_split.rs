// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Streamed file splitting.
//!
//! A source file is read once, lazily, line by line. Every `bulk_size` lines a part is
//! flushed to a [`PartSink`] on its own task. At most `max_in_flight` parts are held by
//! writers at a time; the reader waits for a permit before handing out the next one. Two
//! counters track progress: `ordered` (parts handed out) and `finished` (parts written).
//! After the last line the splitter polls until both agree, a bounded number of times.
//!
//! Writers never outlive [`FileSplitter::split`]: on any error they are aborted and joined
//! before the error is returned.
//!
//! Blank lines are skipped. When the file has a header, the first line is captured once,
//! excluded from counts and prepended to every part.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::status::StatusUid;
use crate::storage::StreamStorage;

use super::{PartitionStrategy, Partitions};

/// Options of one split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOptions {
    /// Lines per part when no part cap is set.
    pub bulk_size: u64,
    /// Whether the first line is a header.
    pub has_header: bool,
    /// Part cap. When set, the bulk size becomes `ceil(lines / max_parts)` after a pre-scan.
    pub max_parts: Option<u64>,
    /// Parts being written at once.
    pub max_in_flight: usize,
    /// Delay between convergence checks.
    pub poll_interval: Duration,
    /// Number of convergence checks before giving up.
    pub poll_attempts: u32,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            bulk_size: 1000,
            has_header: false,
            max_parts: None,
            max_in_flight: 4,
            poll_interval: Duration::from_millis(50),
            poll_attempts: 100,
        }
    }
}

/// One flushed part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePart {
    /// Part index, in flush order.
    pub index: u64,
    /// Header line, when the file has one.
    pub header: Option<String>,
    /// Data lines.
    pub lines: Vec<String>,
}

impl FilePart {
    /// Newline-terminated bytes, header first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for line in self.header.iter().chain(self.lines.iter()) {
            out.push_str(line);
            out.push('\n');
        }
        out.into_bytes()
    }
}

/// Receives flushed parts.
#[async_trait]
pub trait PartSink: Send + Sync {
    /// Persist one part.
    async fn write_part(&self, part: FilePart) -> Result<()>;
}

/// Sink writing part `i` to `{target}/{i}`.
#[derive(Clone)]
pub struct StorageSink {
    storage: Arc<dyn StreamStorage>,
    target: String,
}

impl StorageSink {
    /// Sink writing under `target`.
    pub fn new(storage: Arc<dyn StreamStorage>, target: impl Into<String>) -> Self {
        Self {
            storage,
            target: target.into(),
        }
    }
}

#[async_trait]
impl PartSink for StorageSink {
    async fn write_part(&self, part: FilePart) -> Result<()> {
        let path = format!("{}/{}", self.target, part.index);
        self.storage.send_stream(&path, part.to_bytes()).await
    }
}

/// Outcome of a split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitReport {
    /// Data lines read, header excluded.
    pub lines: u64,
    /// Parts written.
    pub parts: u64,
    /// Bulk size used.
    pub bulk_size: u64,
    /// Captured header.
    pub header: Option<String>,
}

/// Splits files read from a [`StreamStorage`].
#[derive(Clone)]
pub struct FileSplitter {
    storage: Arc<dyn StreamStorage>,
    options: SplitOptions,
}

struct Progress {
    ordered: AtomicU64,
    finished: AtomicU64,
    failure: Mutex<Option<CoreError>>,
}

impl FileSplitter {
    /// Splitter reading from `storage`.
    pub fn new(storage: Arc<dyn StreamStorage>, options: SplitOptions) -> Self {
        Self { storage, options }
    }

    /// Data lines of `path`, header excluded.
    pub async fn count_lines(&self, path: &str) -> Result<u64> {
        let mut lines = self.storage.read_stream(path).await?.lines();
        let mut count = 0u64;
        let mut header_pending = self.options.has_header;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if header_pending {
                header_pending = false;
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    fn bulk_size_for(&self, lines: u64) -> u64 {
        match self.options.max_parts.filter(|max| *max > 0) {
            Some(max_parts) => lines.div_ceil(max_parts).max(1),
            None => self.options.bulk_size.max(1),
        }
    }

    async fn bulk_size(&self, path: &str) -> Result<u64> {
        if self.options.max_parts.is_some_and(|max| max > 0) {
            let lines = self.count_lines(path).await?;
            return Ok(self.bulk_size_for(lines));
        }
        Ok(self.bulk_size_for(0))
    }

    /// Sizing the split of `path` would produce, without writing anything.
    pub async fn estimate(&self, path: &str) -> Result<SplitReport> {
        let lines = self.count_lines(path).await?;
        let bulk_size = self.bulk_size_for(lines);
        Ok(SplitReport {
            lines,
            parts: lines.div_ceil(bulk_size),
            bulk_size,
            header: None,
        })
    }

    async fn flush(
        &self,
        writers: &mut JoinSet<()>,
        permits: &Arc<Semaphore>,
        sink: &Arc<dyn PartSink>,
        progress: &Arc<Progress>,
        header: &Option<String>,
        lines: Vec<String>,
    ) -> Result<()> {
        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CoreError::StorageError {
                path: String::new(),
                details: "split writer pool closed".to_string(),
            })?;

        let index = progress.ordered.fetch_add(1, Ordering::SeqCst);
        let part = FilePart {
            index,
            header: header.clone(),
            lines,
        };
        let sink = sink.clone();
        let progress = progress.clone();
        writers.spawn(async move {
            let _permit = permit;
            if let Err(e) = sink.write_part(part).await {
                warn!(index, error = %e, "Failed to write file part");
                if let Ok(mut failure) = progress.failure.lock()
                    && failure.is_none()
                {
                    *failure = Some(e);
                }
            }
            progress.finished.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    }

    async fn stream_parts(
        &self,
        path: &str,
        bulk_size: u64,
        sink: &Arc<dyn PartSink>,
        progress: &Arc<Progress>,
        writers: &mut JoinSet<()>,
    ) -> Result<(u64, Option<String>)> {
        let permits = Arc::new(Semaphore::new(self.options.max_in_flight.max(1)));
        let mut lines = self.storage.read_stream(path).await?.lines();
        let mut header = None;
        let mut header_pending = self.options.has_header;
        let mut buffer = Vec::with_capacity(bulk_size.min(10_000) as usize);
        let mut total = 0u64;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if header_pending {
                header_pending = false;
                header = Some(line);
                continue;
            }
            total += 1;
            buffer.push(line);
            if buffer.len() as u64 >= bulk_size {
                let part = std::mem::take(&mut buffer);
                self.flush(writers, &permits, sink, progress, &header, part)
                    .await?;
            }
            // Reap finished writers.
            while writers.try_join_next().is_some() {}
        }
        if !buffer.is_empty() {
            self.flush(writers, &permits, sink, progress, &header, buffer)
                .await?;
        }

        let ordered = progress.ordered.load(Ordering::SeqCst);
        let mut attempts = 0;
        while progress.finished.load(Ordering::SeqCst) < ordered {
            if attempts >= self.options.poll_attempts {
                return Err(CoreError::worker(
                    StatusUid::Error,
                    "SPLIT_NOT_CONVERGED",
                    format!(
                        "split of '{}' did not converge: {} of {} parts written",
                        path,
                        progress.finished.load(Ordering::SeqCst),
                        ordered
                    ),
                ));
            }
            attempts += 1;
            tokio::time::sleep(self.options.poll_interval).await;
        }

        Ok((total, header))
    }

    /// Split `path` into parts handed to `sink`.
    pub async fn split(&self, path: &str, sink: Arc<dyn PartSink>) -> Result<SplitReport> {
        let bulk_size = self.bulk_size(path).await?;
        let progress = Arc::new(Progress {
            ordered: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            failure: Mutex::new(None),
        });
        let mut writers = JoinSet::new();

        let streamed = self
            .stream_parts(path, bulk_size, &sink, &progress, &mut writers)
            .await;
        let (total, header) = match streamed {
            Ok(streamed) => streamed,
            Err(e) => {
                writers.abort_all();
                while writers.join_next().await.is_some() {}
                debug!(path, error = %e, "Split aborted, writers stopped");
                return Err(e);
            }
        };
        while writers.join_next().await.is_some() {}

        let failure = progress
            .failure
            .lock()
            .map_err(|_| CoreError::StorageError {
                path: path.to_string(),
                details: "split progress mutex poisoned".to_string(),
            })?
            .take();
        if let Some(e) = failure {
            return Err(e);
        }

        let ordered = progress.ordered.load(Ordering::SeqCst);
        debug!(path, parts = ordered, lines = total, bulk_size, "File split converged");
        Ok(SplitReport {
            lines: total,
            parts: ordered,
            bulk_size,
            header,
        })
    }
}

/// Partition strategy that materializes parts of a stored file.
#[derive(Clone)]
pub struct FileSplitStrategy {
    splitter: FileSplitter,
    storage: Arc<dyn StreamStorage>,
    source: String,
    target: String,
}

impl FileSplitStrategy {
    /// Split `source` into `{target}/{index}`.
    pub fn new(
        storage: Arc<dyn StreamStorage>,
        options: SplitOptions,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            splitter: FileSplitter::new(storage.clone(), options),
            storage,
            source: source.into(),
            target: target.into(),
        }
    }
}

#[async_trait]
impl PartitionStrategy for FileSplitStrategy {
    async fn partition(&self) -> Result<Partitions> {
        if self.storage.check_directory_exists(&self.target).await? {
            info!(dir = %self.target, "Removing parts left by a previous split");
            self.storage.delete_directory(&self.target).await?;
        }

        let sink: Arc<dyn PartSink> =
            Arc::new(StorageSink::new(self.storage.clone(), self.target.clone()));
        let report = self.splitter.split(&self.source, sink).await?;

        Ok(Partitions::materialized(
            report.lines,
            report.parts,
            report.bulk_size,
            self.target.clone(),
        ))
    }

    async fn estimate(&self) -> Result<Partitions> {
        let report = self.splitter.estimate(&self.source).await?;
        Ok(Partitions::materialized(
            report.lines,
            report.parts,
            report.bulk_size,
            self.target.clone(),
        ))
    }
}
