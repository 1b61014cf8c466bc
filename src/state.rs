//! Persisted record of lifecycle containers started for event subscriptions,
//! keyed by the working directory they were started from.
//!
//! The document lives in one JSON file per user. Read-modify-write cycles
//! hold an exclusive advisory lock on a sidecar `<file>.lock`, so concurrent
//! invocations serialize their writes; which of two racing subscribers wins
//! the record for a directory is not reconciled. Async callers go through
//! [`StateStore::blocking`] so a lock held elsewhere never parks a runtime
//! thread.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{ExecError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub container_id: String,
    /// Container port to host port.
    pub ports: BTreeMap<u16, u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ContainerRecord {
    pub fn new(container_id: impl Into<String>, ports: BTreeMap<u16, u16>) -> Self {
        Self {
            container_id: container_id.into(),
            ports,
            started_at: Some(Utc::now()),
        }
    }
}

pub type StateDocument = BTreeMap<String, ContainerRecord>;

#[derive(Clone, Debug)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the whole document. A missing or unreadable file is an empty one.
    pub fn read(&self) -> StateDocument {
        match self.load() {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.path.display(), "ignoring state file: {}", e);
                StateDocument::new()
            }
        }
    }

    /// Runs `op` against this store on tokio's blocking pool.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&StateStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| ExecError::StateStore(format!("state file task failed: {}", e)))?
    }

    pub fn get(&self, cwd: &str) -> Option<ContainerRecord> {
        self.read().remove(cwd)
    }

    /// Sets the record for `cwd`, keeping every other entry.
    pub fn write(&self, cwd: &str, record: ContainerRecord) -> Result<()> {
        self.update(|doc| {
            doc.insert(cwd.to_string(), record);
        })
    }

    /// Drops the record for `cwd`, returning it if there was one.
    pub fn remove(&self, cwd: &str) -> Result<Option<ContainerRecord>> {
        let mut removed = None;
        self.update(|doc| removed = doc.remove(cwd))?;
        Ok(removed)
    }

    fn update(&self, change: impl FnOnce(&mut StateDocument)) -> Result<()> {
        let _lock = self.lock()?;
        let mut doc = self.read();
        change(&mut doc);
        self.persist(&doc)
    }

    fn load(&self) -> Result<StateDocument> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StateDocument::new()),
            Err(e) => return Err(ExecError::StateStore(e.to_string())),
        };
        if text.trim().is_empty() {
            return Ok(StateDocument::new());
        }
        serde_json::from_str(&text).map_err(|e| ExecError::StateStore(e.to_string()))
    }

    fn persist(&self, doc: &StateDocument) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let json = serde_json::to_string_pretty(doc).map_err(|e| ExecError::StateStore(e.to_string()))?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&self.path)
            .map_err(|e| ExecError::StateStore(e.to_string()))?;
        debug!(path = %self.path.display(), entries = doc.len(), "state file written");
        Ok(())
    }

    fn lock_path(&self) -> PathBuf {
        let mut lock_path = self.path.clone().into_os_string();
        lock_path.push(".lock");
        PathBuf::from(lock_path)
    }

    fn lock(&self) -> Result<File> {
        let lock_path = self.lock_path();
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;
        file.lock_exclusive()
            .map_err(|e| ExecError::StateStore(format!("failed to lock state file: {}", e)))?;
        Ok(file)
    }
}
