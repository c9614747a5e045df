//! Durable procedure log
//!
//! Append-only store of procedure state transitions. Each append is one
//! framed entry carrying a batch of [`LogRecord`]s, so a batch (a parent's
//! suspended state plus its new children) is either fully replayed or not
//! at all.
//!
//! Entry format: `[MAGIC][SEQUENCE][PAYLOAD_LEN][PAYLOAD][CRC32]` where the
//! payload is the bincode encoding of `Vec<LogRecord>` and the checksum covers
//! sequence, length and payload.
//!
//! Replay order is append order. A torn or corrupted tail is reported and cut
//! off when the log is opened; nothing after it is trusted.

use super::{ProcId, ProcedureRecord};
use crate::common::{crc32, Error, LogSyncPolicy, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const LOG_MAGIC: [u8; 4] = [0x50, 0x4C, 0x47, 0x31]; // "PLG1"
const HEADER_LEN: u64 = 4 + 8 + 4;
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogRecord {
    /// Full state of a procedure after a transition
    Update(ProcedureRecord),
    /// The procedure is gone; earlier records for it may be compacted away
    Delete(ProcId),
}

impl LogRecord {
    pub fn proc_id(&self) -> ProcId {
        match self {
            LogRecord::Update(r) => r.id,
            LogRecord::Delete(id) => *id,
        }
    }
}

/// Persistence primitive for the executor.
///
/// `append` must not return `Ok` until the records would survive a process
/// crash. Any `Err` from `append` is treated as a fatal durability failure.
pub trait ProcedureLog: Send {
    fn append(&mut self, records: &[LogRecord]) -> Result<()>;

    /// Every record in append order. May be called any number of times.
    fn read_all(&self) -> Result<Vec<LogRecord>>;

    /// Rewrite the log so that it holds only `live`.
    fn compact(&mut self, live: &[ProcedureRecord]) -> Result<()>;

    /// Records appended since the last compaction (or open).
    fn appended_since_compaction(&self) -> usize;
}

/// File-backed log.
pub struct FileProcedureLog {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    sync_policy: LogSyncPolicy,
    appended: usize,
}

impl FileProcedureLog {
    /// Open or create the log file. A corrupted tail is truncated so new
    /// appends land after the last valid entry.
    pub fn open(path: impl AsRef<Path>, sync_policy: LogSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let scan = Self::scan(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        if scan.valid_len < len {
            tracing::warn!(
                path = %path.display(),
                valid = scan.valid_len,
                len,
                "Truncating corrupted procedure log tail"
            );
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }
        drop(file);

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_sequence: scan.next_sequence,
            sync_policy,
            appended: scan.records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn scan(path: &Path) -> Result<Scan> {
        let mut scan = Scan::default();
        Self::for_each_entry(path, |seq, records, end| {
            scan.next_sequence = seq + 1;
            scan.valid_len = end;
            scan.records += records.len();
        })?;
        Ok(scan)
    }

    /// Walk valid entries, stopping at the first corrupted one.
    fn for_each_entry<F>(path: &Path, mut callback: F) -> Result<()>
    where
        F: FnMut(u64, Vec<LogRecord>, u64),
    {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut offset = 0u64;

        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((sequence, records, len))) => {
                    offset += len;
                    callback(sequence, records, offset);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Procedure log replay stopped at corrupted entry: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(u64, Vec<LogRecord>, u64)>> {
        // Read magic
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != LOG_MAGIC {
            return Err(Error::Corrupted("invalid procedure log magic".into()));
        }

        let mut seq_bytes = [0u8; 8];
        reader.read_exact(&mut seq_bytes)?;
        let sequence = u64::from_le_bytes(seq_bytes);

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let payload_len = u32::from_le_bytes(len_bytes);
        if payload_len > MAX_PAYLOAD {
            return Err(Error::Corrupted(format!(
                "payload length {} exceeds limit",
                payload_len
            )));
        }

        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let computed = checksum(&seq_bytes, &len_bytes, &payload);
        if computed != stored {
            return Err(Error::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let records: Vec<LogRecord> = bincode::deserialize(&payload)
            .map_err(|e| Error::Corrupted(format!("undecodable entry {}: {}", sequence, e)))?;

        Ok(Some((
            sequence,
            records,
            HEADER_LEN + payload_len as u64 + 4,
        )))
    }

    fn write_entry<W: Write>(writer: &mut W, sequence: u64, records: &[LogRecord]) -> Result<()> {
        let payload = bincode::serialize(records)?;
        if payload.len() > MAX_PAYLOAD as usize {
            return Err(Error::ProcedureLog(format!(
                "entry of {} bytes exceeds limit",
                payload.len()
            )));
        }
        let seq_bytes = sequence.to_le_bytes();
        let len_bytes = (payload.len() as u32).to_le_bytes();

        writer.write_all(&LOG_MAGIC)?;
        writer.write_all(&seq_bytes)?;
        writer.write_all(&len_bytes)?;
        writer.write_all(&payload)?;
        writer.write_all(&checksum(&seq_bytes, &len_bytes, &payload).to_le_bytes())?;
        Ok(())
    }

    /// Push the buffered entry out according to the sync policy. Every
    /// policy flushes, so the entry is readable before `append` returns.
    fn maybe_sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        if self.sync_policy == LogSyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Sync to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
}

impl ProcedureLog for FileProcedureLog {
    fn append(&mut self, records: &[LogRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let sequence = self.next_sequence;
        Self::write_entry(&mut self.writer, sequence, records)?;
        self.maybe_sync()?;
        self.next_sequence += 1;
        self.appended += records.len();
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<LogRecord>> {
        let mut out = Vec::new();
        Self::for_each_entry(&self.path, |_, records, _| out.extend(records))?;
        Ok(out)
    }

    /// Write the live set to a sibling file, fsync it, then rename it over the
    /// log. A crash at any point leaves either the old or the new log intact.
    fn compact(&mut self, live: &[ProcedureRecord]) -> Result<()> {
        self.writer.flush()?;

        let tmp = self.path.with_extension("compact");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut writer = BufWriter::new(file);
            if !live.is_empty() {
                let records: Vec<LogRecord> =
                    live.iter().cloned().map(LogRecord::Update).collect();
                Self::write_entry(&mut writer, 0, &records)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                dir.sync_all().ok();
            }
        }

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.next_sequence = 1;
        self.appended = live.len();

        tracing::debug!(live = live.len(), "Compacted procedure log");
        Ok(())
    }

    fn appended_since_compaction(&self) -> usize {
        self.appended
    }
}

#[derive(Debug, Default)]
struct Scan {
    next_sequence: u64,
    valid_len: u64,
    records: usize,
}

fn checksum(seq_bytes: &[u8; 8], len_bytes: &[u8; 4], payload: &[u8]) -> u32 {
    let mut data = Vec::with_capacity(12 + payload.len());
    data.extend_from_slice(seq_bytes);
    data.extend_from_slice(len_bytes);
    data.extend_from_slice(payload);
    crc32(&data)
}

/// In-memory log. Clones share the same storage, so a test can hand one
/// clone to a master, drop the master and replay from another clone.
#[derive(Clone, Default)]
pub struct MemoryProcedureLog {
    entries: Arc<Mutex<Vec<LogRecord>>>,
    appended: usize,
}

impl MemoryProcedureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogRecord>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProcedureLog for MemoryProcedureLog {
    fn append(&mut self, records: &[LogRecord]) -> Result<()> {
        self.lock().extend_from_slice(records);
        self.appended += records.len();
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<LogRecord>> {
        Ok(self.lock().clone())
    }

    fn compact(&mut self, live: &[ProcedureRecord]) -> Result<()> {
        *self.lock() = live.iter().cloned().map(LogRecord::Update).collect();
        self.appended = live.len();
        Ok(())
    }

    fn appended_since_compaction(&self) -> usize {
        self.appended
    }
}
