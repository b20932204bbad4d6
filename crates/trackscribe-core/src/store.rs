//! Session stores
//!
//! The persistence seam: one logging run is a session holding fused log
//! rows and timing rows. The writer thread appends through [`SessionStore`];
//! schema and query mechanics stay behind the trait.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::sample::{LogEntry, SessionId, TimingSample};

/// Storage for logging sessions
pub trait SessionStore: Send + Sync {
    /// Create a new session and return its id
    fn create_session(&self) -> Result<SessionId, StoreError>;

    /// Reopen an existing session for appending
    fn open_session(&self, id: SessionId) -> Result<(), StoreError>;

    /// Append one fused log row to a session
    fn append_log_entry(&self, id: SessionId, entry: &LogEntry) -> Result<(), StoreError>;

    /// Append one timing row to a session
    fn append_timing_entry(&self, id: SessionId, sample: &TimingSample) -> Result<(), StoreError>;
}

#[derive(Default)]
struct SessionRecord {
    log: Vec<LogEntry>,
    timing: Vec<TimingSample>,
}

/// In-memory session store, used by tests and demos
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fused rows persisted for a session
    pub fn log_entries(&self, id: SessionId) -> Vec<LogEntry> {
        self.sessions
            .lock()
            .get(&id)
            .map(|r| r.log.clone())
            .unwrap_or_default()
    }

    /// Timing rows persisted for a session
    pub fn timing_entries(&self, id: SessionId) -> Vec<TimingSample> {
        self.sessions
            .lock()
            .get(&id)
            .map(|r| r.timing.clone())
            .unwrap_or_default()
    }

    /// Ids of all known sessions
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.lock().keys().copied().collect()
    }
}

impl SessionStore for MemoryStore {
    fn create_session(&self) -> Result<SessionId, StoreError> {
        let id = SessionId::new();
        self.sessions.lock().insert(id, SessionRecord::default());
        Ok(id)
    }

    fn open_session(&self, id: SessionId) -> Result<(), StoreError> {
        match self.sessions.lock().get(&id) {
            Some(_) => Ok(()),
            None => Err(StoreError::SessionNotFound(id)),
        }
    }

    fn append_log_entry(&self, id: SessionId, entry: &LogEntry) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock();
        let record = sessions
            .get_mut(&id)
            .ok_or(StoreError::SessionNotFound(id))?;
        record.log.push(entry.clone());
        Ok(())
    }

    fn append_timing_entry(&self, id: SessionId, sample: &TimingSample) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock();
        let record = sessions
            .get_mut(&id)
            .ok_or(StoreError::SessionNotFound(id))?;
        record.timing.push(sample.clone());
        Ok(())
    }
}

/// One serialized row of a JSON-lines session file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionRow {
    /// Session header, first row of every file
    Header {
        /// The session id
        session: SessionId,
        /// When the file was created
        created_at: DateTime<Utc>,
    },
    /// A fused log row
    Log(LogEntry),
    /// A timing row
    Timing(TimingSample),
}

/// File-backed session store: one JSON-lines file per session under a root
/// directory, named `<session-id>.jsonl`, header row first.
pub struct JsonlStore {
    root: PathBuf,
    open: Mutex<HashMap<SessionId, BufWriter<File>>>,
}

impl JsonlStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Path of a session's file
    pub fn session_path(&self, id: SessionId) -> PathBuf {
        self.root.join(format!("{id}.jsonl"))
    }

    /// Read every row of a session file back, for analysis and tests
    pub fn read_session(&self, id: SessionId) -> Result<Vec<SessionRow>, StoreError> {
        let path = self.session_path(id);
        if !path.exists() {
            return Err(StoreError::SessionNotFound(id));
        }
        let text = std::fs::read_to_string(path)?;
        let mut rows = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            rows.push(serde_json::from_str(line)?);
        }
        Ok(rows)
    }

    fn append_row(&self, id: SessionId, row: &SessionRow) -> Result<(), StoreError> {
        let mut open = self.open.lock();
        let writer = open.get_mut(&id).ok_or(StoreError::SessionNotFound(id))?;
        serde_json::to_writer(&mut *writer, row)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl SessionStore for JsonlStore {
    fn create_session(&self) -> Result<SessionId, StoreError> {
        let id = SessionId::new();
        let file = File::create(self.session_path(id))?;
        let mut writer = BufWriter::new(file);
        let header = SessionRow::Header {
            session: id,
            created_at: Utc::now(),
        };
        serde_json::to_writer(&mut writer, &header)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        self.open.lock().insert(id, writer);
        Ok(id)
    }

    fn open_session(&self, id: SessionId) -> Result<(), StoreError> {
        let mut open = self.open.lock();
        if open.contains_key(&id) {
            return Err(StoreError::SessionAlreadyOpen(id));
        }
        let path = self.session_path(id);
        if !path.exists() {
            return Err(StoreError::SessionNotFound(id));
        }
        let file = OpenOptions::new().append(true).open(path)?;
        open.insert(id, BufWriter::new(file));
        Ok(())
    }

    fn append_log_entry(&self, id: SessionId, entry: &LogEntry) -> Result<(), StoreError> {
        self.append_row(id, &SessionRow::Log(entry.clone()))
    }

    fn append_timing_entry(&self, id: SessionId, sample: &TimingSample) -> Result<(), StoreError> {
        self.append_row(id, &SessionRow::Timing(sample.clone()))
    }
}
