//! Append-only, newline-delimited JSON log.
//!
//! One log backs one repository's durable commit stream. Records are JSON
//! values separated by `\n`. A batch append is written as
//! `\n` + values joined by `\n\n` + `\n`, so every batch starts on a blank
//! line that a reader can resynchronize on after a torn write.
//!
//! Reading is a forward-only cursor scan. A trailing record without its
//! newline, or a complete record that is not valid JSON, is treated as the
//! remains of an interrupted write: a writable log is truncated back to the
//! end of the last good record and scanning stops there.
//!
//! A log has exactly one writer, enforced with a [`WriterLock`]. Appends are
//! only allowed once the initial scan has reached the end of the file.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::config::LogConfig;
use crate::lock::{LockRetry, WriterLock};

/// Default cursor read buffer.
pub const DEFAULT_READ_CHUNK_BYTES: usize = 1024 * 1024;

const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy)]
pub struct LogOptions {
    /// Drop appended entries whose `id` field was already seen.
    pub dedupe: bool,
    pub read_chunk_bytes: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            dedupe: true,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
        }
    }
}

impl From<&LogConfig> for LogOptions {
    fn from(config: &LogConfig) -> Self {
        Self {
            dedupe: config.dedupe,
            read_chunk_bytes: config.read_chunk_bytes.max(1),
        }
    }
}

pub struct LogFile {
    path: PathBuf,
    file: File,
    writable: bool,
    scan_complete: bool,
    known_ids: Option<HashSet<String>>,
    read_chunk_bytes: usize,
    _lock: Option<WriterLock>,
}

/// Resumable scan position.
pub struct Cursor {
    total_bytes: u64,
    /// Next byte to read from the file.
    file_offset: u64,
    /// End of the last complete, well-formed record.
    last_good_offset: u64,
    chunk_start: u64,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_len: usize,
    /// Bytes of a record that spans read-buffer refills.
    pending: Vec<u8>,
    done: bool,
}

impl Cursor {
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn last_good_offset(&self) -> u64 {
        self.last_good_offset
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[derive(Debug, Default)]
pub struct ScanBatch {
    pub values: Vec<Value>,
    pub done: bool,
}

enum Line {
    Blank,
    Value(Value),
    Malformed(serde_json::Error),
}

fn parse_line(bytes: &[u8]) -> Line {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Line::Blank;
    }
    match serde_json::from_slice(bytes) {
        Ok(value) => Line::Value(value),
        Err(err) => Line::Malformed(err),
    }
}

/// Reserve room for `additional` bytes, doubling and rounding to whole pages.
fn grow_pending(buf: &mut Vec<u8>, additional: usize) {
    let needed = buf.len() + additional;
    if needed <= buf.capacity() {
        return;
    }
    let mut target = buf.capacity().max(PAGE_SIZE);
    while target < needed {
        target *= 2;
    }
    let target = target.div_ceil(PAGE_SIZE) * PAGE_SIZE;
    buf.reserve_exact(target - buf.len());
}

impl LogFile {
    /// Open a log. A writable log creates missing parent directories and
    /// takes the single-writer lock.
    pub fn open(path: &Path, writable: bool, options: LogOptions) -> Result<Self> {
        let lock = if writable {
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create log directory: {}", parent.display())
                    })?;
                }
            }
            Some(WriterLock::acquire(path, LockRetry::default())?)
        } else {
            None
        };

        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(writable)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            writable,
            scan_complete: false,
            known_ids: options.dedupe.then(HashSet::new),
            read_chunk_bytes: options.read_chunk_bytes.max(1),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Whether a scan has reached the end of the file.
    pub fn scan_complete(&self) -> bool {
        self.scan_complete
    }

    /// Start a scan from the beginning, bounded by the current file length.
    pub fn start_cursor(&mut self) -> Result<Cursor> {
        let total_bytes = self
            .file
            .metadata()
            .with_context(|| format!("Failed to stat log file: {}", self.path.display()))?
            .len();
        self.file
            .seek(SeekFrom::Start(0))
            .with_context(|| format!("Failed to seek log file: {}", self.path.display()))?;
        let buf_len = self.read_chunk_bytes.min(total_bytes as usize).max(1);
        Ok(Cursor {
            total_bytes,
            file_offset: 0,
            last_good_offset: 0,
            chunk_start: 0,
            read_buf: vec![0; buf_len],
            read_pos: 0,
            read_len: 0,
            pending: Vec::new(),
            done: false,
        })
    }

    /// Decode up to `max_values` more records.
    ///
    /// Resumes where the previous call stopped. `done` is set once the end of
    /// the file or a damaged record was reached.
    pub fn scan(&mut self, cursor: &mut Cursor, max_values: usize) -> Result<ScanBatch> {
        let mut values = Vec::new();
        if cursor.done {
            return Ok(ScanBatch { values, done: true });
        }

        while values.len() < max_values.max(1) {
            if cursor.read_pos >= cursor.read_len {
                if cursor.file_offset >= cursor.total_bytes {
                    if !cursor.pending.is_empty() {
                        let torn = cursor.pending.len();
                        cursor.pending.clear();
                        self.discard_tail(cursor.last_good_offset, torn, "partial record")?;
                    }
                    self.finish(cursor);
                    return Ok(ScanBatch { values, done: true });
                }
                self.fill(cursor)?;
                continue;
            }

            let window = &cursor.read_buf[cursor.read_pos..cursor.read_len];
            match window.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    let end = cursor.read_pos + idx;
                    let record_end = cursor.chunk_start + end as u64 + 1;
                    let line = if cursor.pending.is_empty() {
                        parse_line(&cursor.read_buf[cursor.read_pos..end])
                    } else {
                        grow_pending(&mut cursor.pending, end - cursor.read_pos);
                        cursor
                            .pending
                            .extend_from_slice(&cursor.read_buf[cursor.read_pos..end]);
                        let line = parse_line(&cursor.pending);
                        cursor.pending.clear();
                        line
                    };
                    cursor.read_pos = end + 1;

                    match line {
                        Line::Blank => cursor.last_good_offset = record_end,
                        Line::Value(value) => {
                            self.remember_id(&value);
                            values.push(value);
                            cursor.last_good_offset = record_end;
                        }
                        Line::Malformed(err) => {
                            tracing::warn!(
                                path = %self.path.display(),
                                offset = cursor.last_good_offset,
                                error = %err,
                                "malformed log record"
                            );
                            let torn = (cursor.total_bytes - cursor.last_good_offset) as usize;
                            self.discard_tail(cursor.last_good_offset, torn, "malformed record")?;
                            self.finish(cursor);
                            return Ok(ScanBatch { values, done: true });
                        }
                    }
                }
                None => {
                    let tail = cursor.read_len - cursor.read_pos;
                    grow_pending(&mut cursor.pending, tail);
                    cursor
                        .pending
                        .extend_from_slice(&cursor.read_buf[cursor.read_pos..cursor.read_len]);
                    cursor.read_pos = cursor.read_len;
                }
            }
        }

        Ok(ScanBatch {
            values,
            done: false,
        })
    }

    /// Scan the whole file from the start.
    pub fn read_all(&mut self, batch_size: usize) -> Result<Vec<Value>> {
        let mut cursor = self.start_cursor()?;
        let mut all = Vec::new();
        loop {
            let batch = self.scan(&mut cursor, batch_size)?;
            all.extend(batch.values);
            if batch.done {
                return Ok(all);
            }
        }
    }

    fn fill(&mut self, cursor: &mut Cursor) -> Result<()> {
        let remaining = cursor.total_bytes - cursor.file_offset;
        let want = (cursor.read_buf.len() as u64).min(remaining) as usize;
        self.file
            .seek(SeekFrom::Start(cursor.file_offset))
            .with_context(|| format!("Failed to seek log file: {}", self.path.display()))?;
        self.file
            .read_exact(&mut cursor.read_buf[..want])
            .with_context(|| format!("Failed to read log file: {}", self.path.display()))?;
        cursor.chunk_start = cursor.file_offset;
        cursor.file_offset += want as u64;
        cursor.read_pos = 0;
        cursor.read_len = want;
        Ok(())
    }

    fn finish(&mut self, cursor: &mut Cursor) {
        cursor.done = true;
        self.scan_complete = true;
    }

    fn discard_tail(&mut self, good_offset: u64, bytes: usize, reason: &str) -> Result<()> {
        if !self.writable {
            tracing::debug!(
                path = %self.path.display(),
                offset = good_offset,
                bytes,
                reason,
                "ignoring damaged tail of read-only log"
            );
            return Ok(());
        }
        tracing::warn!(
            path = %self.path.display(),
            offset = good_offset,
            bytes,
            reason,
            "truncating damaged log tail"
        );
        self.file
            .set_len(good_offset)
            .with_context(|| format!("Failed to truncate log file: {}", self.path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("Failed to sync log file: {}", self.path.display()))?;
        Ok(())
    }

    fn remember_id(&mut self, value: &Value) {
        if let (Some(known), Some(id)) = (
            self.known_ids.as_mut(),
            value.get("id").and_then(Value::as_str),
        ) {
            known.insert(id.to_owned());
        }
    }

    /// Append `entries` as one batch. Returns how many were written after
    /// de-duplication. Does not flush.
    ///
    /// # Panics
    ///
    /// If the log is read-only or its initial scan has not completed.
    pub fn append(&mut self, entries: &[Value]) -> Result<usize> {
        assert!(self.writable, "append on read-only log {}", self.path.display());
        assert!(
            self.scan_complete,
            "append before the initial scan of {} completed",
            self.path.display()
        );

        let mut fresh = Vec::with_capacity(entries.len());
        for entry in entries {
            if let (Some(known), Some(id)) = (
                self.known_ids.as_mut(),
                entry.get("id").and_then(Value::as_str),
            ) {
                if !known.insert(id.to_owned()) {
                    continue;
                }
            }
            fresh.push(entry);
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut buf = vec![b'\n'];
        for (idx, entry) in fresh.iter().enumerate() {
            if idx > 0 {
                buf.extend_from_slice(b"\n\n");
            }
            serde_json::to_writer(&mut buf, entry).context("Failed to encode log entry")?;
        }
        buf.push(b'\n');

        self.file
            .seek(SeekFrom::End(0))
            .with_context(|| format!("Failed to seek log file: {}", self.path.display()))?;
        self.file
            .write_all(&buf)
            .with_context(|| format!("Failed to append to log file: {}", self.path.display()))?;
        Ok(fresh.len())
    }

    /// Durability barrier for everything appended so far.
    pub fn flush(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .with_context(|| format!("Failed to flush log file: {}", self.path.display()))
    }

    /// Release the handle and the writer lock. Does not flush.
    pub fn close(self) {
        drop(self);
    }
}
