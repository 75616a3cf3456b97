//! Append-only run event logs.
//!
//! The log owns `seq` assignment: each append gets the next number for its
//! run, starting at 1, so sequences are strictly increasing per run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::core::events::{EventKind, NewEvent, RunEvent};
use crate::core::types::RunId;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("event log io at {path}: {message}")]
    Io { path: PathBuf, message: String },
    #[error("corrupt event log {path} line {line}: {message}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("serialize event: {0}")]
    Serialize(String),
    #[error("event log unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: NewEvent) -> Result<RunEvent, EventLogError>;
    /// Events of a run in `seq` order.
    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<RunEvent>, EventLogError>;
}

/// Event log held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventLog {
    events: Arc<Mutex<HashMap<RunId, Vec<RunEvent>>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events of a run, for assertions outside the async context.
    pub fn snapshot(&self, run_id: &RunId) -> Vec<RunEvent> {
        self.events
            .lock()
            .map(|events| events.get(run_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: NewEvent) -> Result<RunEvent, EventLogError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| EventLogError::Unavailable("event log mutex poisoned".to_string()))?;
        let run_events = events.entry(event.run_id.clone()).or_default();
        let seq = run_events.last().map_or(1, |last| last.seq + 1);
        let stored = RunEvent::from_new(event, seq);
        run_events.push(stored.clone());
        Ok(stored)
    }

    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<RunEvent>, EventLogError> {
        let events = self
            .events
            .lock()
            .map_err(|_| EventLogError::Unavailable("event log mutex poisoned".to_string()))?;
        Ok(events.get(run_id).cloned().unwrap_or_default())
    }
}

/// File-backed log: one `<run-id>.jsonl` per run, one event per line.
#[derive(Debug)]
pub struct JsonlEventLog {
    dir: PathBuf,
    /// Last assigned seq per active run; loaded from disk on first append and
    /// dropped once the run reaches a terminal status. The async mutex also
    /// serializes appends so lines never interleave.
    last_seq: tokio::sync::Mutex<HashMap<RunId, u64>>,
}

impl JsonlEventLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_seq: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{run_id}.jsonl"))
    }
}

fn io_error(path: &Path, err: impl std::fmt::Display) -> EventLogError {
    EventLogError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

async fn read_events(path: &Path) -> Result<Vec<RunEvent>, EventLogError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_error(path, err)),
    };
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|err| EventLogError::Corrupt {
                path: path.to_path_buf(),
                line: i + 1,
                message: err.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl EventLog for JsonlEventLog {
    #[instrument(skip_all, fields(run_id = %event.run_id, kind = event.kind.name()))]
    async fn append(&self, event: NewEvent) -> Result<RunEvent, EventLogError> {
        let path = self.path_for(&event.run_id);
        let mut last_seq = self.last_seq.lock().await;
        let previous = match last_seq.get(&event.run_id) {
            Some(seq) => *seq,
            None => read_events(&path)
                .await?
                .last()
                .map_or(0, |last| last.seq),
        };

        let stored = RunEvent::from_new(event, previous + 1);
        let mut line =
            serde_json::to_string(&stored).map_err(|err| EventLogError::Serialize(err.to_string()))?;
        line.push('\n');

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| io_error(&self.dir, err))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| io_error(&path, err))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| io_error(&path, err))?;
        file.sync_data().await.map_err(|err| io_error(&path, err))?;

        if matches!(stored.event, EventKind::StatusChanged { to, .. } if to.is_terminal()) {
            // A retry appends again and reloads the seq from the file.
            last_seq.remove(&stored.run_id);
        } else {
            last_seq.insert(stored.run_id.clone(), stored.seq);
        }
        debug!(seq = stored.seq, "event appended");
        Ok(stored)
    }

    async fn list_by_run(&self, run_id: &RunId) -> Result<Vec<RunEvent>, EventLogError> {
        read_events(&self.path_for(run_id)).await
    }
}
