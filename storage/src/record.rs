//! Framed record files
//!
//! Every file an index persists has the same shape:
//!
//! ```text
//! ┌──────────┬───────────────┬──────────────────────────────────────┐
//! │ "FDIX"   │ version (u16) │ record*                              │
//! └──────────┴───────────────┴──────────────────────────────────────┘
//!
//! record:
//! ┌──────────────┬────────────────────────┬──────────────┐
//! │ len (u32 LE) │ payload (len bytes)    │ crc32 (u32)  │
//! └──────────────┴────────────────────────┴──────────────┘
//! ```
//!
//! Payloads go through the [`Compressor`]; the checksum covers the stored
//! (compressed) bytes. Files are replaced atomically: the new content is
//! written to a sibling temp file, synced, then renamed over the old one.

use crate::FDIX_MAGIC;
use crate::FORMAT_VERSION;
use crate::compression::Compressor;
use crate::error::Result;
use crate::error::StorageError;
use std::fs;
use std::fs::File;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

const HEADER_LEN: usize = 4 + 2;
const LEN_PREFIX: usize = 4;
const CRC_LEN: usize = 4;

/// Accumulates framed records in memory until [`RecordWriter::commit`].
pub struct RecordWriter {
    compressor: Compressor,
    buffer: Vec<u8>,
    records: usize,
}

impl RecordWriter {
    pub fn new(compressor: Compressor) -> Self {
        let mut buffer = Vec::with_capacity(4096);
        buffer.extend_from_slice(FDIX_MAGIC);
        buffer.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        Self {
            compressor,
            buffer,
            records: 0,
        }
    }

    pub fn push(&mut self, payload: &[u8]) -> Result<()> {
        let stored = self.compressor.compress(payload)?;
        let len = u32::try_from(stored.len()).map_err(|_| {
            StorageError::InvalidArgument(format!("record of {} bytes is too large", stored.len()))
        })?;
        self.buffer.extend_from_slice(&len.to_le_bytes());
        self.buffer.extend_from_slice(&stored);
        self.buffer
            .extend_from_slice(&crc32fast::hash(&stored).to_le_bytes());
        self.records += 1;
        Ok(())
    }

    pub const fn record_count(&self) -> usize {
        self.records
    }

    /// The framed file content, without touching the filesystem.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Atomically replace `path` with the accumulated records.
    pub fn commit(self, path: &Path) -> Result<()> {
        write_atomically(path, &self.buffer)
    }
}

/// Write `bytes` to a temp file next to `path`, sync it and rename it over
/// `path`.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = with_suffix(path, "tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// `path` with `.suffix` appended to its file name.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Sequential reader over the records of one file.
pub struct RecordReader {
    path: PathBuf,
    data: Vec<u8>,
    offset: usize,
    compressor: Compressor,
}

impl RecordReader {
    /// Open `path`; `Ok(None)` when the file does not exist.
    pub fn open(path: &Path, compressor: Compressor) -> Result<Option<Self>> {
        match fs::read(path) {
            Ok(data) => Self::from_bytes(path.to_path_buf(), data, compressor).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Validate the header of `data`. `path` is only used in error reports.
    pub fn from_bytes(path: PathBuf, data: Vec<u8>, compressor: Compressor) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(StorageError::MalformedRecord {
                offset: 0,
                declared: HEADER_LEN,
                available: data.len(),
            });
        }
        if &data[..FDIX_MAGIC.len()] != FDIX_MAGIC {
            return Err(StorageError::InvalidMagic);
        }
        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion(version, FORMAT_VERSION));
        }
        Ok(Self {
            path,
            data,
            offset: HEADER_LEN,
            compressor,
        })
    }

    /// Next decompressed payload, `Ok(None)` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        let remaining = self.data.len() - self.offset;
        if remaining == 0 {
            return Ok(None);
        }
        if remaining < LEN_PREFIX {
            return Err(StorageError::MalformedRecord {
                offset: self.offset,
                declared: LEN_PREFIX,
                available: remaining,
            });
        }

        let start = self.offset;
        let len_bytes = [
            self.data[start],
            self.data[start + 1],
            self.data[start + 2],
            self.data[start + 3],
        ];
        let declared = u32::from_le_bytes(len_bytes) as usize;
        let available = remaining - LEN_PREFIX;
        if declared.saturating_add(CRC_LEN) > available {
            return Err(StorageError::MalformedRecord {
                offset: start,
                declared,
                available,
            });
        }

        let body_start = start + LEN_PREFIX;
        let body_end = body_start + declared;
        let stored = &self.data[body_start..body_end];
        let expected = u32::from_le_bytes([
            self.data[body_end],
            self.data[body_end + 1],
            self.data[body_end + 2],
            self.data[body_end + 3],
        ]);
        let actual = crc32fast::hash(stored);
        if expected != actual {
            return Err(StorageError::ChecksumMismatch {
                path: self.path.clone(),
                expected,
                actual,
            });
        }

        self.offset = body_end + CRC_LEN;
        self.compressor.decompress(stored).map(Some)
    }

    /// Drain every remaining record.
    pub fn read_all(mut self) -> Result<Vec<Vec<u8>>> {
        let mut records = Vec::new();
        while let Some(record) = self.next_record()? {
            records.push(record);
        }
        Ok(records)
    }
}
