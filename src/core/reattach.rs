//! Durable record of the processes the operator owns.
//!
//! Stored as a single JSON array. Every read-modify-write runs under an
//! in-process mutex plus an advisory lock on `<path>.lock`, and the new
//! content replaces the old file by rename so a crash mid-write leaves the
//! previous version intact.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::domain::ExecutionContext;

/// Errors that can occur with the reattach collection
#[derive(Debug, Error)]
pub enum ReattachError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to replace reattach file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// A process the operator started and believes is running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReattachInfo {
    pub execution_context: ExecutionContext,

    /// Remote configuration endpoint of the process
    pub network_address: String,

    pub pid: u32,
}

/// JSON-file backed set of [`ReattachInfo`]
pub struct ReattachCollection {
    path: PathBuf,
    guard: Mutex<()>,
}

impl ReattachCollection {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records (missing file is an empty collection)
    pub fn items(&self) -> Result<Vec<ReattachInfo>, ReattachError> {
        let _guard = self.lock();
        self.read_items()
    }

    /// Record for an execution context id
    pub fn find(&self, id: &str) -> Result<Option<ReattachInfo>, ReattachError> {
        Ok(self
            .items()?
            .into_iter()
            .find(|item| item.execution_context.id == id))
    }

    /// Whether a process for the execution context id is recorded
    pub fn contains(&self, id: &str) -> Result<bool, ReattachError> {
        Ok(self.find(id)?.is_some())
    }

    /// Add a record, replacing any record with the same pid
    pub fn add_process(&self, info: ReattachInfo) -> Result<(), ReattachError> {
        self.update(|items| {
            items.retain(|item| item.pid != info.pid);
            items.push(info);
        })
    }

    /// Remove the record for `pid`; returns whether one existed
    pub fn remove_process(&self, pid: u32) -> Result<bool, ReattachError> {
        self.update(|items| {
            let before = items.len();
            items.retain(|item| item.pid != pid);
            items.len() != before
        })
    }

    fn update<R>(&self, mutate: impl FnOnce(&mut Vec<ReattachInfo>) -> R) -> Result<R, ReattachError> {
        let _guard = self.lock();
        let _file_lock = self.lock_file()?;

        let mut items = self.read_items()?;
        let result = mutate(&mut items);
        self.write_items(&items)?;

        Ok(result)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Exclusive advisory lock, released when the file is dropped
    fn lock_file(&self) -> Result<File, ReattachError> {
        let dir = self.directory();
        fs::create_dir_all(dir)?;

        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(PathBuf::from(lock_path))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn directory(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
    }

    fn read_items(&self) -> Result<Vec<ReattachInfo>, ReattachError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_str(&content)?)
    }

    fn write_items(&self, items: &[ReattachInfo]) -> Result<(), ReattachError> {
        let mut tmp = NamedTempFile::new_in(self.directory())?;
        serde_json::to_writer_pretty(&mut tmp, items)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{sidecar_tags, Tags};
    use tempfile::TempDir;

    fn info(binary: &str, pid: u32) -> ReattachInfo {
        ReattachInfo {
            execution_context: ExecutionContext::new(binary, "1.0", Tags::new()),
            network_address: format!("127.0.0.1:{}", 10000 + pid),
            pid,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let collection = ReattachCollection::new(temp.path().join("reattach.json"));
        assert!(collection.items().unwrap().is_empty());
    }

    #[test]
    fn test_add_and_remove() {
        let temp = TempDir::new().unwrap();
        let collection = ReattachCollection::new(temp.path().join("state/reattach.json"));

        collection.add_process(info("long", 100)).unwrap();
        collection.add_process(info("other", 200)).unwrap();
        assert_eq!(collection.items().unwrap().len(), 2);
        assert!(collection.contains("long--1.0").unwrap());

        assert!(collection.remove_process(100).unwrap());
        assert!(!collection.remove_process(100).unwrap());

        let items = collection.items().unwrap();
        assert_eq!(items, vec![info("other", 200)]);
    }

    #[test]
    fn test_add_replaces_same_pid() {
        let temp = TempDir::new().unwrap();
        let collection = ReattachCollection::new(temp.path().join("reattach.json"));

        collection.add_process(info("long", 100)).unwrap();
        collection.add_process(info("long", 100)).unwrap();
        assert_eq!(collection.items().unwrap().len(), 1);
    }

    #[test]
    fn test_persisted_layout() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("reattach.json");
        let collection = ReattachCollection::new(&path);

        let record = ReattachInfo {
            execution_context: ExecutionContext::new("filebeat", "7.8.0", sidecar_tags("long")),
            network_address: "127.0.0.1:10001".to_string(),
            pid: 42,
        };
        collection.add_process(record.clone()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let entry = &raw.as_array().unwrap()[0];
        assert_eq!(entry["pid"], 42);
        assert_eq!(entry["network_address"], "127.0.0.1:10001");
        assert_eq!(entry["execution_context"]["binary_name"], "filebeat");
        assert_eq!(entry["execution_context"]["version"], "7.8.0");
        assert_eq!(entry["execution_context"]["tags"]["sidecar-of"], "long");
        assert_eq!(entry["execution_context"]["id"], record.execution_context.id.as_str());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("reattach.json");
        std::fs::write(&path, "{ not an array").unwrap();

        let collection = ReattachCollection::new(&path);
        assert!(matches!(
            collection.items(),
            Err(ReattachError::Serialization(_))
        ));
    }
}
