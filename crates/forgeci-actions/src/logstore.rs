// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task log storage.
//!
//! Logs live in a pending area while the task runs and move to the archive
//! once the task finishes (or a sweeper flushes them). Rows are stored
//! length-prefixed, so `Task.log_indexes[i]` is the exact byte offset of
//! row i and a range of rows can be served without scanning the file.

use std::path::PathBuf;

use async_trait::async_trait;
use forgeci_protocol::runner_proto::LogRow;
use prost::Message;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{ActionsError, Result};

/// Bytes of length prefix per row (u32 big-endian).
const ROW_PREFIX_LEN: usize = 4;

/// Relative path for a task's log file, sharded by the low byte of the id.
pub fn task_log_filename(task_id: i64) -> String {
    format!("{:02x}/{}.log", (task_id as u64) & 0xff, task_id)
}

/// Storage backend for task logs.
///
/// `append` targets the pending area; `transfer` moves a finished log into
/// the archive, after which appends are refused by the lifecycle layer.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Whether the archive already holds this log.
    async fn has(&self, filename: &str) -> Result<bool>;

    /// Append rows to a pending log, returning the encoded byte length of
    /// each row so the caller can extend its offset index.
    async fn append(&self, filename: &str, rows: &[LogRow]) -> Result<Vec<i64>>;

    /// Move a pending log into the archive, returning its size in bytes.
    async fn transfer(&self, filename: &str) -> Result<i64>;

    /// Delete a log from both areas. Missing files are not an error.
    async fn delete(&self, filename: &str) -> Result<()>;
}

/// Filesystem-backed log store rooted at a single directory.
pub struct FsLogStore {
    pending_dir: PathBuf,
    archive_dir: PathBuf,
}

impl FsLogStore {
    /// Create a store rooted at `base`. Directories are created lazily.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            pending_dir: base.join("pending"),
            archive_dir: base.join("archive"),
        }
    }

    fn io_err(operation: &str, path: &std::path::Path, e: std::io::Error) -> ActionsError {
        ActionsError::StorageError {
            operation: operation.to_string(),
            details: format!("{:?}: {}", path, e),
        }
    }
}

#[async_trait]
impl LogStore for FsLogStore {
    async fn has(&self, filename: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.archive_dir.join(filename))
            .await
            .unwrap_or(false))
    }

    async fn append(&self, filename: &str, rows: &[LogRow]) -> Result<Vec<i64>> {
        let path = self.pending_dir.join(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err("append", parent, e))?;
        }

        let mut lengths = Vec::with_capacity(rows.len());
        let mut buf = Vec::new();
        for row in rows {
            let encoded = row.encode_to_vec();
            buf.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
            buf.extend_from_slice(&encoded);
            lengths.push((ROW_PREFIX_LEN + encoded.len()) as i64);
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Self::io_err("append", &path, e))?;
        file.write_all(&buf)
            .await
            .map_err(|e| Self::io_err("append", &path, e))?;
        file.flush()
            .await
            .map_err(|e| Self::io_err("append", &path, e))?;

        Ok(lengths)
    }

    async fn transfer(&self, filename: &str) -> Result<i64> {
        let from = self.pending_dir.join(filename);
        let to = self.archive_dir.join(filename);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err("transfer", parent, e))?;
        }

        let size = tokio::fs::metadata(&from)
            .await
            .map_err(|e| Self::io_err("transfer", &from, e))?
            .len() as i64;

        // rename is atomic within the store root; copy+remove would leave a
        // window where has() and append() disagree.
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| Self::io_err("transfer", &from, e))?;

        debug!(file = filename, size, "log transferred to archive");
        Ok(size)
    }

    async fn delete(&self, filename: &str) -> Result<()> {
        for dir in [&self.pending_dir, &self.archive_dir] {
            let path = dir.join(filename);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Self::io_err("delete", &path, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(contents: &[&str]) -> Vec<LogRow> {
        contents
            .iter()
            .map(|c| LogRow {
                time: 1_700_000_000,
                content: c.to_string(),
            })
            .collect()
    }

    /// Decode a file written by FsLogStore back into rows using the offsets
    /// the caller would have accumulated from append().
    fn decode_at(bytes: &[u8], offset: usize) -> LogRow {
        let len = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        LogRow::decode(&bytes[offset + 4..offset + 4 + len]).unwrap()
    }

    #[tokio::test]
    async fn test_append_returns_row_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLogStore::new(dir.path());
        let name = task_log_filename(42);

        let lengths = store.append(&name, &rows(&["hello", "a longer line"])).await.unwrap();
        assert_eq!(lengths.len(), 2);
        assert!(lengths[1] > lengths[0]);

        let bytes = std::fs::read(dir.path().join("pending").join(&name)).unwrap();
        assert_eq!(bytes.len() as i64, lengths.iter().sum::<i64>());

        // Offsets derived from the returned lengths land on row boundaries.
        assert_eq!(decode_at(&bytes, 0).content, "hello");
        assert_eq!(decode_at(&bytes, lengths[0] as usize).content, "a longer line");
    }

    #[tokio::test]
    async fn test_append_accumulates_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLogStore::new(dir.path());
        let name = task_log_filename(7);

        let first = store.append(&name, &rows(&["one"])).await.unwrap();
        let _second = store.append(&name, &rows(&["two"])).await.unwrap();

        let bytes = std::fs::read(dir.path().join("pending").join(&name)).unwrap();
        assert_eq!(decode_at(&bytes, first[0] as usize).content, "two");
    }

    #[tokio::test]
    async fn test_transfer_moves_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLogStore::new(dir.path());
        let name = task_log_filename(9);

        let lengths = store.append(&name, &rows(&["x"])).await.unwrap();
        assert!(!store.has(&name).await.unwrap());

        let size = store.transfer(&name).await.unwrap();
        assert_eq!(size, lengths[0]);
        assert!(store.has(&name).await.unwrap());
        assert!(!dir.path().join("pending").join(&name).exists());
    }

    #[tokio::test]
    async fn test_transfer_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLogStore::new(dir.path());
        assert!(store.transfer("no/such.log").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLogStore::new(dir.path());
        let name = task_log_filename(3);

        store.append(&name, &rows(&["x"])).await.unwrap();
        store.transfer(&name).await.unwrap();

        store.delete(&name).await.unwrap();
        assert!(!store.has(&name).await.unwrap());
        store.delete(&name).await.unwrap();
    }

    #[test]
    fn test_filename_shards_by_low_byte() {
        assert_eq!(task_log_filename(1), "01/1.log");
        assert_eq!(task_log_filename(0x1ff), "ff/511.log");
    }
}
