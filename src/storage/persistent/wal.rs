//! Write-ahead log for the cache tables.
//!
//! Every table mutation is appended (and optionally fsynced) before it
//! becomes visible in memory. On open the log is scanned; a torn tail left
//! by a crash mid-append is truncated so later appends stay readable.
//! `compact` replaces the history with the live rows only.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::record::{
    CacheEntry, ComputedHouseholdKey, EconomyKey, HouseholdRecord, PolicyRecord,
    ReformImpactKey, Row,
};

use super::codec;

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When this entry was written.
    pub timestamp: DateTime<Utc>,
    /// The mutation being logged.
    pub kind: WalEntryKind,
}

/// Post-write state of one row. `row: None` records a removal.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    Economy {
        key: EconomyKey,
        row: Option<Row<CacheEntry>>,
    },
    ReformImpact {
        key: ReformImpactKey,
        row: Option<Row<CacheEntry>>,
    },
    ComputedHousehold {
        key: ComputedHouseholdKey,
        row: Option<Row<CacheEntry>>,
    },
    Policy(PolicyRecord),
    Household(HouseholdRecord),
}

fn poisoned() -> IoError {
    IoError::new(ErrorKind::Other, "poisoned lock: wal")
}

struct WalWriter {
    out: BufWriter<File>,
    sequence: u64,
}

/// Append-only write-ahead log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<WalWriter>,
    sync_on_write: bool,
}

impl WriteAheadLog {
    /// Open or create a WAL file.
    ///
    /// An existing file is scanned for its last valid sequence number; bytes
    /// after the last complete entry are truncated.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len();
        let sequence = if file_len >= codec::HEADER_LEN {
            let (last_sequence, valid_len) = Self::scan(path)?;
            if valid_len < file_len {
                warn!(
                    path = %path.display(),
                    dropped_bytes = file_len - valid_len,
                    last_sequence,
                    "truncating torn WAL tail"
                );
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            last_sequence
        } else {
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
            0
        };

        let file = OpenOptions::new().append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(WalWriter {
                out: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    /// Append an entry. Returns the sequence number assigned to it.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;

        let sequence = writer.sequence + 1;
        let entry = WalEntry {
            sequence,
            timestamp: Utc::now(),
            kind,
        };
        let encoded = codec::encode(&entry)?;

        writer.out.write_all(&encoded)?;
        writer.out.flush()?;
        if self.sync_on_write {
            writer.out.get_ref().sync_data()?;
        }

        writer.sequence = sequence;
        Ok(sequence)
    }

    /// Replace the log with `live`, one entry per row, renumbered from 1.
    ///
    /// The new log is written to a temporary file, fsynced and renamed over
    /// the old one, so a crash leaves either the full history or the
    /// compacted log. Appends are blocked for the duration.
    pub fn compact(&self, live: Vec<WalEntryKind>) -> IoResult<u64> {
        let mut writer = self.writer.lock().map_err(|_| poisoned())?;
        writer.out.flush()?;

        let temp_path = self.path.with_extension("wal.compact");
        let mut out = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?,
        );
        codec::write_header(&mut out)?;

        let timestamp = Utc::now();
        let mut sequence = 0;
        for kind in live {
            sequence += 1;
            out.write_all(&codec::encode(&WalEntry {
                sequence,
                timestamp,
                kind,
            })?)?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);

        if let Err(e) = std::fs::rename(&temp_path, &self.path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        writer.out = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        writer.sequence = sequence;
        Ok(sequence)
    }

    /// Iterate over all entries, for replay.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last appended entry.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.writer.lock().map_err(|_| poisoned())?.sequence)
    }

    /// WAL file size in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Returns (last sequence, byte length of the valid prefix).
    fn scan(path: &Path) -> IoResult<(u64, u64)> {
        let mut iter = WalIterator::new(path)?;
        let mut last_sequence = 0;
        let mut valid_len = iter.position()?;

        while let Some(entry) = iter.next() {
            match entry {
                Ok(entry) => {
                    last_sequence = entry.sequence;
                    valid_len = iter.position()?;
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        sequence = last_sequence + 1,
                        error = %e,
                        "WAL corruption detected; replay stops here"
                    );
                    break;
                }
            }
        }

        Ok((last_sequence, valid_len))
    }
}

/// Iterator over WAL entries. Stops at a torn tail.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let _version = codec::read_header(&mut reader)?;

        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.position() {
            Ok(pos) if pos >= self.file_size => return None,
            Ok(_) => {}
            Err(e) => return Some(Err(e)),
        }

        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
