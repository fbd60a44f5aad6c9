//! Append-only transcript files
//!
//! One `<task id>.log` file per task. Every append is redacted before it touches
//! the disk. Readers never take the append lock: they snapshot the file length
//! and read up to it, so a concurrent append is either fully visible on the next
//! poll or not at all.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::redact::Redactor;
use crate::metrics::TRANSCRIPT_BYTES;
use crate::tasks::store::is_safe_id;
use crate::tasks::TaskStatus;

/// Error type for transcript operations
#[derive(Debug, Error)]
pub enum TranscriptError {
    #[error("invalid task id: {0}")]
    InvalidId(String),

    #[error("transcript I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Suffix of a transcript plus the length it was read up to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptChunk {
    pub content: String,
    /// Absolute length at the time of the read; pass it back as the next offset
    pub length: u64,
}

/// Marks lines written by the orchestrator rather than the remote terminal
pub const NOTICE_PREFIX: &str = "[agentvisor]";

/// File-backed transcript store
pub struct TranscriptStore {
    base_dir: PathBuf,
    redactor: Redactor,
    /// Serialises redact + write so appends for a task never interleave
    append_lock: Mutex<()>,
}

impl TranscriptStore {
    /// Create a store rooted at `base_dir` using the built-in redaction rules
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self, TranscriptError> {
        Self::with_redactor(base_dir, Redactor::builtin())
    }

    pub fn with_redactor(base_dir: impl Into<PathBuf>, redactor: Redactor) -> Result<Self, TranscriptError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            redactor,
            append_lock: Mutex::new(()),
        })
    }

    /// Create an empty transcript if none exists
    pub fn init(&self, task_id: &str) -> Result<(), TranscriptError> {
        let path = self.path(task_id)?;
        OpenOptions::new().create(true).append(true).open(path)?;
        Ok(())
    }

    /// Redact `text` and append it. Returns the new transcript length.
    pub fn append(&self, task_id: &str, text: &str) -> Result<u64, TranscriptError> {
        let path = self.path(task_id)?;
        if text.is_empty() {
            return self.len(task_id);
        }
        let clean = self.redactor.redact(text);

        let _guard = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(clean.as_bytes())?;
        let length = file.metadata()?.len();
        TRANSCRIPT_BYTES.inc_by(clean.len() as u64);
        Ok(length)
    }

    /// Append `line` followed by a newline
    pub fn append_line(&self, task_id: &str, line: &str) -> Result<u64, TranscriptError> {
        self.append(task_id, &format!("{}\n", line))
    }

    /// Append an orchestrator notice on its own line, set apart from terminal output
    pub fn append_notice(&self, task_id: &str, message: &str) -> Result<u64, TranscriptError> {
        self.append(task_id, &format!("\r\n{} {}\r\n", NOTICE_PREFIX, message))
    }

    /// Full transcript, or only its last `limit_lines` lines
    pub fn read(&self, task_id: &str, limit_lines: Option<usize>) -> Result<String, TranscriptError> {
        let chunk = self.read_from_offset(task_id, 0)?;
        Ok(match limit_lines {
            Some(limit) => tail_lines(&chunk.content, limit).to_string(),
            None => chunk.content,
        })
    }

    /// Everything appended at or after byte `offset`.
    ///
    /// An offset at or beyond the current length yields empty content. A
    /// missing transcript reads as empty.
    pub fn read_from_offset(&self, task_id: &str, offset: u64) -> Result<TranscriptChunk, TranscriptError> {
        let path = self.path(task_id)?;
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TranscriptChunk {
                    content: String::new(),
                    length: 0,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let length = file.metadata()?.len();
        if offset >= length {
            return Ok(TranscriptChunk {
                content: String::new(),
                length,
            });
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut bytes = Vec::with_capacity((length - offset) as usize);
        file.take(length - offset).read_to_end(&mut bytes)?;
        Ok(TranscriptChunk {
            content: String::from_utf8_lossy(&bytes).into_owned(),
            length,
        })
    }

    /// Current length in bytes; 0 when the transcript does not exist
    pub fn len(&self, task_id: &str) -> Result<u64, TranscriptError> {
        let path = self.path(task_id)?;
        match std::fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the whole transcript with a single marker line
    pub fn reset(&self, task_id: &str, marker: &str) -> Result<(), TranscriptError> {
        let path = self.path(task_id)?;
        let clean = self.redactor.redact(marker);
        let _guard = self.append_lock.lock().unwrap_or_else(|e| e.into_inner());
        std::fs::write(&path, format!("{}\n", clean.trim_end_matches('\n')))?;
        debug!(task_id, "Transcript reset");
        Ok(())
    }

    /// Time since the transcript was last written; `None` if it does not exist
    pub fn age(&self, task_id: &str) -> Result<Option<Duration>, TranscriptError> {
        let path = self.path(task_id)?;
        let modified = match std::fs::metadata(path) {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(SystemTime::now().duration_since(modified).unwrap_or_default()))
    }

    /// Whole minutes since the last write
    pub fn age_minutes(&self, task_id: &str) -> Result<Option<u64>, TranscriptError> {
        Ok(self.age(task_id)?.map(|age| age.as_secs() / 60))
    }

    fn path(&self, task_id: &str) -> Result<PathBuf, TranscriptError> {
        if !is_safe_id(task_id) {
            return Err(TranscriptError::InvalidId(task_id.to_string()));
        }
        Ok(self.base_dir.join(format!("{}.log", task_id)))
    }
}

/// A running task whose transcript has been idle for at least `threshold`
pub fn needs_attention(status: TaskStatus, idle: Option<Duration>, threshold: Duration) -> bool {
    status == TaskStatus::Running && idle.map(|age| age >= threshold).unwrap_or(false)
}

/// Last `limit` lines of `content`, keeping a trailing newline if present
fn tail_lines(content: &str, limit: usize) -> &str {
    if limit == 0 {
        return "";
    }
    let body = content.strip_suffix('\n').unwrap_or(content);
    match body.rmatch_indices('\n').nth(limit - 1) {
        Some((idx, _)) => &content[idx + 1..],
        None => content,
    }
}
