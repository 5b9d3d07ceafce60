//! Replication log with optional file persistence.
//!
//! On disk every entry is a frame: `len (u32 LE) | crc32 (u32 LE) | bincode(LoggedEntry)`.

use crate::error::{StoreError, StoreResult};
use crate::record::LogEntry;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Frames larger than this are treated as a torn tail.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

#[derive(Debug, Serialize, Deserialize)]
struct LoggedEntry {
    entry: LogEntry,
    timestamp: u64,
}

pub struct ReplicationLog {
    entries: Vec<LogEntry>,
    file: Option<File>,
}

impl ReplicationLog {
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            file: None,
        }
    }

    /// Open (or create) a log file and load the entries it already holds.
    /// Reading stops at the first torn or corrupt frame.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path.as_ref())?;
        file.seek(SeekFrom::Start(0))?;
        let entries = Self::read_frames(&mut BufReader::new(&file))?;
        tracing::info!(
            path = %path.as_ref().display(),
            entries = entries.len(),
            "replication log opened"
        );
        Ok(Self {
            entries,
            file: Some(file),
        })
    }

    fn read_frames<R: Read>(reader: &mut R) -> StoreResult<Vec<LogEntry>> {
        let mut entries = Vec::new();
        loop {
            let mut header = [0u8; 8];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            if len > MAX_FRAME_SIZE {
                tracing::warn!(len, "replication log frame too large, truncating");
                break;
            }

            let mut data = vec![0u8; len];
            if reader.read_exact(&mut data).is_err() {
                tracing::warn!("torn replication log frame, truncating");
                break;
            }
            if crc32fast::hash(&data) != crc {
                tracing::warn!("replication log checksum mismatch, truncating");
                break;
            }
            match bincode::deserialize::<LoggedEntry>(&data) {
                Ok(logged) => entries.push(logged.entry),
                Err(e) => {
                    tracing::warn!(error = %e, "undecodable replication log frame, truncating");
                    break;
                }
            }
        }
        Ok(entries)
    }

    pub fn append(&mut self, entry: LogEntry) -> StoreResult<()> {
        if let Some(file) = self.file.as_mut() {
            let logged = LoggedEntry {
                entry,
                timestamp: std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default(),
            };
            let data = bincode::serialize(&logged)?;
            if data.len() > MAX_FRAME_SIZE {
                return Err(StoreError::ResourceExhausted(format!(
                    "log entry of {} bytes exceeds frame limit",
                    data.len()
                )));
            }
            let mut frame = Vec::with_capacity(data.len() + 8);
            frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
            frame.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
            frame.extend_from_slice(&data);
            file.write_all(&frame)?;
            file.sync_data()?;
            self.entries.push(logged.entry);
        } else {
            self.entries.push(entry);
        }
        Ok(())
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_persistent(&self) -> bool {
        self.file.is_some()
    }
}
