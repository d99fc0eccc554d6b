//! Point-in-time snapshots of the store.
//!
//! Items are serialized back-to-back as
//! `[u32 key_len][u32 val_len][u64 version][i64 ttl_ms][key][value]`,
//! little-endian, into `snapshot.tmp`; the atomic rename to `snapshot.dat`
//! is the commit point. A crash mid-write leaves the previous snapshot
//! intact plus an orphaned `.tmp` the next boot ignores.

use crate::error::{Error, Result};
use crate::fault::FaultInjector;
use crate::metrics::Metrics;
use crate::store::SnapshotItem;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

const SNAPSHOT_FILE: &str = "snapshot.dat";
const TEMP_FILE: &str = "snapshot.tmp";

/// Sanity bound for key/value lengths during load; a corrupt header must
/// not trigger a huge allocation.
const MAX_FIELD_LEN: u32 = 64 * 1024 * 1024;

const ITEM_HEADER_LEN: usize = 24;

pub struct SnapshotManager {
    dir: PathBuf,
    fault: FaultInjector,
    metrics: Arc<Metrics>,
    delay: Duration,
}

impl SnapshotManager {
    pub fn new(
        dir: impl Into<PathBuf>,
        fault: FaultInjector,
        metrics: Arc<Metrics>,
        delay_ms: u64,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(SnapshotManager {
            dir,
            fault,
            metrics,
            delay: Duration::from_millis(delay_ms),
        })
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    /// Writes all items to the temp file, syncs, then renames over the
    /// previous snapshot. Residual TTLs are computed against the clock at
    /// write time; entries already past their deadline get 0 and expire
    /// again immediately on load.
    pub fn write_snapshot(&self, items: &[SnapshotItem]) -> Result<()> {
        let start = Instant::now();
        self.fault.maybe_delay(self.delay);
        let temp = self.dir.join(TEMP_FILE);
        let result = self.write_items(&temp, items);
        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(Error::Snapshot(e));
        }
        fs::rename(&temp, self.snapshot_path()).map_err(Error::Snapshot)?;
        let elapsed = start.elapsed();
        self.metrics.set_snapshot_duration(elapsed.as_millis() as u64);
        info!(items = items.len(), elapsed_ms = elapsed.as_millis() as u64, "snapshot written");
        Ok(())
    }

    fn write_items(&self, temp: &PathBuf, items: &[SnapshotItem]) -> std::io::Result<()> {
        let file = File::create(temp)?;
        let mut out = BufWriter::new(file);
        let now = Instant::now();
        for item in items {
            let ttl_ms: i64 = match item.expire_at {
                Some(deadline) => deadline
                    .checked_duration_since(now)
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0),
                None => -1,
            };
            out.write_all(&(item.key.len() as u32).to_le_bytes())?;
            out.write_all(&(item.value.len() as u32).to_le_bytes())?;
            out.write_all(&item.version.to_le_bytes())?;
            out.write_all(&ttl_ms.to_le_bytes())?;
            out.write_all(item.key.as_bytes())?;
            out.write_all(item.value.as_bytes())?;
        }
        out.flush()?;
        out.into_inner().map_err(|e| e.into_error())?.sync_all()
    }

    /// Loads the latest committed snapshot; empty when none exists. Stops
    /// at the first short read. TTLs are reconstituted against the clock at
    /// load time; -1 means no expiry.
    pub fn load_latest(&self) -> Vec<SnapshotItem> {
        let file = match File::open(self.snapshot_path()) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let mut reader = BufReader::new(file);
        let now = Instant::now();
        let mut items = Vec::new();
        loop {
            let mut header = [0u8; ITEM_HEADER_LEN];
            if reader.read_exact(&mut header).is_err() {
                break;
            }
            let key_len = u32::from_le_bytes(header[0..4].try_into().expect("4-byte slice"));
            let val_len = u32::from_le_bytes(header[4..8].try_into().expect("4-byte slice"));
            let version = u64::from_le_bytes(header[8..16].try_into().expect("8-byte slice"));
            let ttl_ms = i64::from_le_bytes(header[16..24].try_into().expect("8-byte slice"));
            if key_len > MAX_FIELD_LEN || val_len > MAX_FIELD_LEN {
                break;
            }
            let mut key = vec![0u8; key_len as usize];
            let mut value = vec![0u8; val_len as usize];
            if reader.read_exact(&mut key).is_err() || reader.read_exact(&mut value).is_err() {
                break;
            }
            let (key, value) = match (String::from_utf8(key), String::from_utf8(value)) {
                (Ok(k), Ok(v)) => (k, v),
                _ => break,
            };
            let expire_at = if ttl_ms >= 0 {
                Some(now + Duration::from_millis(ttl_ms as u64))
            } else {
                None
            };
            items.push(SnapshotItem {
                key,
                value,
                version,
                expire_at,
            });
        }
        items
    }
}
