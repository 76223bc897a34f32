//! # raft-storage
//!
//! why: provide durable persistence for raft state so a restarted node keeps its term, vote and log
//! relations: written by raft-kv's server after every raft-core transition, read back on restart
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing and simulated crashes

use raft_core::{LogEntry, Unpersisted};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("persisted state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Everything a node needs to come back after a crash
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,
}

/// trait for durable storage of raft state
///
/// this abstraction allows the same node code to work with:
/// - real filesystem (native)
/// - in-memory (testing, crash/restart simulation)
pub trait Storage: Send {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> Result<(u64, Option<u64>)>;

    /// append entries to the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> Result<Vec<LogEntry>>;

    /// drop every entry at or after `from_index` (for conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> Result<()>;

    /// clear all persisted state
    fn clear(&mut self) -> Result<()>;

    fn load_state(&self) -> Result<PersistentState> {
        let (current_term, voted_for) = self.load_term_and_vote()?;
        Ok(PersistentState {
            current_term,
            voted_for,
            log: self.load_log()?,
        })
    }

    /// write a delta drained from a raft node: term/vote first, then the
    /// rewritten log suffix
    fn persist(&mut self, delta: &Unpersisted) -> Result<()> {
        if let Some((term, voted_for)) = delta.term_and_vote {
            self.save_term_and_vote(term, voted_for)?;
        }
        if let Some((from, entries)) = &delta.log_suffix {
            self.truncate_log_from(*from)?;
            self.append_entries(entries)?;
        }
        Ok(())
    }
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for, replaced atomically
/// - log.jsonl: one entry per line, appended in place
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    /// index of the last entry in `log.jsonl`, 0 when empty
    last_index: u64,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut storage = Self { dir, last_index: 0 };
        storage.drop_torn_tail()?;
        storage.last_index = storage.load_log()?.last().map_or(0, |e| e.index);
        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    /// atomic write: write to temp file, fsync, then rename over the target
    fn replace_file(&self, target: &Path, temp_name: &str, contents: &[u8]) -> Result<()> {
        let temp_path = self.dir.join(temp_name);
        let mut file = File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&temp_path, target)?;
        Ok(())
    }

    /// rewrite the log without a half-written final line so later appends
    /// start on a clean line
    fn drop_torn_tail(&self) -> Result<()> {
        let path = self.log_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if bytes.is_empty() || bytes.ends_with(b"\n") {
            return Ok(());
        }

        let log = self.load_log()?;
        self.replace_file(&path, "log.tmp", &Self::encode_lines(&log)?)
    }

    fn encode_lines(entries: &[LogEntry]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

/// metadata structure for term and vote
#[derive(serde::Serialize, serde::Deserialize, Default)]
struct MetaData {
    term: u64,
    voted_for: Option<u64>,
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<()> {
        let meta = MetaData { term, voted_for };
        let json = serde_json::to_vec_pretty(&meta)?;
        self.replace_file(&self.meta_path(), "meta.tmp", &json)
    }

    fn load_term_and_vote(&self) -> Result<(u64, Option<u64>)> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok((0, None)); // default for new nodes
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        let meta: MetaData = serde_json::from_str(&contents)?;

        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(&Self::encode_lines(entries)?)?;
        file.sync_data()?;
        if let Some(last) = entries.last() {
            self.last_index = last.index;
        }

        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut lines = BufReader::new(File::open(&path)?).lines().peekable();
        let mut log = Vec::new();
        while let Some(line) = lines.next() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => log.push(entry),
                // a torn final line means we crashed mid-append; the entry was never acknowledged
                Err(_) if lines.peek().is_none() => break,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(log)
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<()> {
        // the common case: persist truncating just past the end before an append
        if from_index > self.last_index {
            return Ok(());
        }

        let kept: Vec<LogEntry> = self
            .load_log()?
            .into_iter()
            .filter(|e| e.index < from_index)
            .collect();
        let contents = Self::encode_lines(&kept)?;
        self.replace_file(&self.log_path(), "log.tmp", &contents)?;
        self.last_index = kept.last().map_or(0, |e| e.index);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        for path in [self.meta_path(), self.log_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.last_index = 0;
        Ok(())
    }
}

// -- in-memory storage implementation --

#[derive(Debug, Default)]
struct MemoryState {
    term: u64,
    voted_for: Option<u64>,
    log: Vec<LogEntry>,
}

/// in-memory storage for testing
///
/// clones share the same state, so a node rebuilt from a clone after a
/// simulated crash sees everything its predecessor persisted
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> Result<T> {
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(f(&mut state))
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<()> {
        self.with_state(|s| {
            s.term = term;
            s.voted_for = voted_for;
        })
    }

    fn load_term_and_vote(&self) -> Result<(u64, Option<u64>)> {
        self.with_state(|s| (s.term, s.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.with_state(|s| s.log.extend(entries.iter().cloned()))
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        self.with_state(|s| s.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<()> {
        self.with_state(|s| s.log.retain(|e| e.index < from_index))
    }

    fn clear(&mut self) -> Result<()> {
        self.with_state(|s| *s = MemoryState::default())
    }
}
