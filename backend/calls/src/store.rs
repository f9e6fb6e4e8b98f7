use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::{info, warn};

use callforge_core::CallRecord;

pub const CALL_LOG_FILE: &str = "calls.jsonl";

/// Append-only JSONL log of call record snapshots.
///
/// Every mutation appends the full record. Replay folds by `callId`, so the
/// last line written for a call wins.
pub struct CallStore {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl CallStore {
    /// Open or create `<dir>/calls.jsonl`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("Failed to create store dir {}", dir.display()))?;
        let path = dir.join(CALL_LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open call log {}", path.display()))?;
        info!(path = %path.display(), "Call store opened");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &CallRecord) -> Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, record).context("Failed to serialize call record")?;
        writer.write_all(b"\n")?;
        writer.flush().context("Failed to flush call log")?;
        Ok(())
    }

    /// Latest snapshot of every call in the log.
    pub fn load_all(&self) -> Result<Vec<CallRecord>> {
        read_records(&self.path)
    }

    /// Calls that had not reached a terminal state when last written.
    pub fn load_active(&self) -> Result<Vec<CallRecord>> {
        Ok(self.load_all()?.into_iter().filter(|r| !r.is_terminal()).collect())
    }
}

/// Replay a call log, keeping the last snapshot per call. Ordered by
/// start time, oldest first. Unparseable lines are skipped.
pub fn read_records(path: &Path) -> Result<Vec<CallRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read call log {}", path.display())),
    };

    let mut latest: HashMap<String, CallRecord> = HashMap::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CallRecord>(&line) {
            Ok(record) => {
                latest.insert(record.call_id.clone(), record);
            }
            Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed call log line"),
        }
    }

    let mut records: Vec<CallRecord> = latest.into_values().collect();
    records.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    Ok(records)
}

/// Most recent `limit` calls, newest first.
pub fn read_history(dir: &Path, limit: usize) -> Result<Vec<CallRecord>> {
    let mut records = read_records(&dir.join(CALL_LOG_FILE))?;
    records.reverse();
    records.truncate(limit);
    Ok(records)
}
