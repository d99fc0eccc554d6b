//! Append-only write-ahead log.
//!
//! On-disk framing is `[u32 length][u32 crc32][payload]`, little-endian,
//! CRC-32 over the payload bytes. Replay stops cleanly at the first torn or
//! corrupt record; everything after that point is discarded even if it
//! would decode.

use crate::error::{Error, Result};
use crate::fault::FaultInjector;
use crate::metrics::Metrics;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Upper bound on a single record; a torn length field must not trigger a
/// multi-gigabyte allocation during replay.
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

const REC_HEADER_LEN: usize = 8;

/// Serialized appender. One append proceeds at a time; each record is
/// framed, written, and synced before the call returns.
pub struct WalWriter {
    path: PathBuf,
    rotated_path: PathBuf,
    file: Mutex<File>,
    fault: FaultInjector,
    metrics: Arc<Metrics>,
    delay: Duration,
    fail_probability: f64,
}

impl WalWriter {
    pub fn new(
        path: impl Into<PathBuf>,
        fault: FaultInjector,
        metrics: Arc<Metrics>,
        delay_ms: u64,
        fail_probability: f64,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = Self::open_append(&path)?;
        let rotated_path = path.with_extension("log.old");
        Ok(WalWriter {
            path,
            rotated_path,
            file: Mutex::new(file),
            fault,
            metrics,
            delay: Duration::from_millis(delay_ms),
            fail_probability,
        })
    }

    fn open_append(path: &Path) -> std::io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    /// Appends one record durably. On failure (I/O or injected) nothing is
    /// considered logged and the caller must not apply the mutation.
    pub fn append(&self, record: &str) -> Result<()> {
        let mut file = self.file.lock();
        self.fault.maybe_delay(self.delay);
        if self.fault.should_fail(self.fail_probability) {
            return Err(Error::Wal(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected append failure",
            )));
        }
        let payload = record.as_bytes();
        let mut frame = Vec::with_capacity(REC_HEADER_LEN + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        frame.extend_from_slice(payload);
        file.write_all(&frame).map_err(Error::Wal)?;
        file.sync_data().map_err(Error::Wal)?;
        drop(file);
        self.metrics.set_wal_bytes(self.size_bytes());
        Ok(())
    }

    /// Current on-disk size of the active log; I/O errors read as 0.
    pub fn size_bytes(&self) -> u64 {
        fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    /// Moves the active log aside and starts a fresh one, so a snapshot can
    /// collapse everything logged so far. Skipped (returns false) while a
    /// previous rotation is still awaiting its snapshot; replaying the
    /// un-pruned segment is idempotent, losing it is not.
    pub fn rotate(&self) -> Result<bool> {
        let mut file = self.file.lock();
        if self.rotated_path.exists() {
            return Ok(false);
        }
        file.sync_data()?;
        fs::rename(&self.path, &self.rotated_path)?;
        *file = Self::open_append(&self.path)?;
        drop(file);
        self.metrics.set_wal_bytes(self.size_bytes());
        Ok(true)
    }

    /// Deletes the rotated segment. Called only after the snapshot that
    /// covers it has committed.
    pub fn prune_rotated(&self) -> Result<()> {
        match fs::remove_file(&self.rotated_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn rotated_path(&self) -> &Path {
        &self.rotated_path
    }
}

/// Sequential replay reader.
pub struct WalReader {
    path: PathBuf,
}

impl WalReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        WalReader { path: path.into() }
    }

    /// Reads records in order until end-of-file, a short read (torn tail),
    /// or a checksum mismatch. Returns every record recovered before the
    /// stopping point.
    pub fn read_all(&self) -> Vec<String> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        loop {
            let mut header = [0u8; REC_HEADER_LEN];
            if reader.read_exact(&mut header).is_err() {
                break;
            }
            let len = u32::from_le_bytes(header[0..4].try_into().expect("4-byte slice"));
            let checksum = u32::from_le_bytes(header[4..8].try_into().expect("4-byte slice"));
            if len > MAX_RECORD_LEN {
                warn!(len, "implausible record length, stopping replay");
                break;
            }
            let mut payload = vec![0u8; len as usize];
            if reader.read_exact(&mut payload).is_err() {
                break;
            }
            if crc32fast::hash(&payload) != checksum {
                warn!(record = records.len(), "checksum mismatch, stopping replay");
                break;
            }
            match String::from_utf8(payload) {
                Ok(record) => records.push(record),
                Err(_) => {
                    warn!(record = records.len(), "non-utf8 record, stopping replay");
                    break;
                }
            }
        }
        records
    }
}
