// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blob/stream storage consumed by file splitting.
//!
//! Paths are `/`-separated and relative to the storage root.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, BufReader};

use crate::error::CoreError;

/// Buffered byte stream read from storage.
pub type ByteStream = Box<dyn AsyncBufRead + Send + Unpin>;

/// Stream storage interface.
#[async_trait]
pub trait StreamStorage: Send + Sync {
    /// Names of the entries directly under `path`, sorted.
    async fn read_directory(&self, path: &str) -> Result<Vec<String>, CoreError>;

    /// Open `path` for streaming reads.
    async fn read_stream(&self, path: &str) -> Result<ByteStream, CoreError>;

    /// Write `bytes` to `path`, creating parent directories.
    async fn send_stream(&self, path: &str, bytes: Vec<u8>) -> Result<(), CoreError>;

    /// Whether `path` exists as a directory.
    async fn check_directory_exists(&self, path: &str) -> Result<bool, CoreError>;

    /// Remove `path` and everything below it.
    async fn delete_directory(&self, path: &str) -> Result<(), CoreError>;
}

fn storage_error(path: &str, details: impl ToString) -> CoreError {
    CoreError::StorageError {
        path: path.to_string(),
        details: details.to_string(),
    }
}

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Storage under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, CoreError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(storage_error(path, "path escapes the storage root"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl StreamStorage for LocalStorage {
    async fn read_directory(&self, path: &str) -> Result<Vec<String>, CoreError> {
        let dir = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| storage_error(path, e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| storage_error(path, e))? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, CoreError> {
        let file = tokio::fs::File::open(self.resolve(path)?)
            .await
            .map_err(|e| storage_error(path, e))?;
        Ok(Box::new(BufReader::new(file)))
    }

    async fn send_stream(&self, path: &str, bytes: Vec<u8>) -> Result<(), CoreError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error(path, e))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| storage_error(path, e))
    }

    async fn check_directory_exists(&self, path: &str) -> Result<bool, CoreError> {
        match tokio::fs::metadata(self.resolve(path)?).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(storage_error(path, e)),
        }
    }

    async fn delete_directory(&self, path: &str) -> Result<(), CoreError> {
        tokio::fs::remove_dir_all(self.resolve(path)?)
            .await
            .map_err(|e| storage_error(path, e))
    }
}

/// Storage over an in-memory map of path to bytes.
#[derive(Default)]
pub struct MemoryStorage {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `contents` at `path`.
    pub fn put(&self, path: &str, contents: impl Into<Vec<u8>>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(normalize(path), contents.into());
        }
    }

    /// Contents at `path`, as UTF-8.
    pub fn get_string(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .ok()?
            .get(&normalize(path))
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    fn lock(&self, path: &str) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, CoreError> {
        self.files
            .lock()
            .map_err(|_| storage_error(path, "storage mutex poisoned"))
    }
}

#[async_trait]
impl StreamStorage for MemoryStorage {
    async fn read_directory(&self, path: &str) -> Result<Vec<String>, CoreError> {
        let prefix = format!("{}/", normalize(path));
        let files = self.lock(path)?;
        let mut names: Vec<String> = files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect();
        names.dedup();
        Ok(names)
    }

    async fn read_stream(&self, path: &str) -> Result<ByteStream, CoreError> {
        let files = self.lock(path)?;
        let bytes = files
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| storage_error(path, "not found"))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn send_stream(&self, path: &str, bytes: Vec<u8>) -> Result<(), CoreError> {
        self.lock(path)?.insert(normalize(path), bytes);
        Ok(())
    }

    async fn check_directory_exists(&self, path: &str) -> Result<bool, CoreError> {
        let prefix = format!("{}/", normalize(path));
        Ok(self.lock(path)?.keys().any(|k| k.starts_with(&prefix)))
    }

    async fn delete_directory(&self, path: &str) -> Result<(), CoreError> {
        let prefix = format!("{}/", normalize(path));
        self.lock(path)?.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }
}
