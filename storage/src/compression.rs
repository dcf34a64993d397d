//! Zstd compression of record payloads

use crate::error::Result;
use crate::error::StorageError;
use serde::Deserialize;
use serde::Serialize;
use std::io::Read;

/// Compression applied to every record payload of an index file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionLevel {
    /// Payloads are stored as-is
    None,
    /// Fast compression (level 1)
    Fast,
    /// Balanced compression (level 3)
    #[default]
    Balanced,
    /// Maximum compression (level 9)
    Maximum,
}

impl CompressionLevel {
    /// Zstd level, or `None` when payloads are stored raw
    pub const fn zstd_level(self) -> Option<i32> {
        match self {
            Self::None => None,
            Self::Fast => Some(1),
            Self::Balanced => Some(3),
            Self::Maximum => Some(9),
        }
    }

    /// Tag byte written in front of each payload
    const fn tag(self) -> u8 {
        match self.zstd_level() {
            Some(_) => 1,
            None => 0,
        }
    }
}

/// Compresses record payloads. Each payload carries a one byte tag, so a file
/// written with one level can be read by a compressor configured with another.
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    level: CompressionLevel,
}

impl Compressor {
    pub const fn new(level: CompressionLevel) -> Self {
        Self { level }
    }

    pub const fn level(&self) -> CompressionLevel {
        self.level
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 1);
        out.push(self.level.tag());
        match self.level.zstd_level() {
            Some(level) => {
                let compressed = zstd::encode_all(data, level)
                    .map_err(|e| StorageError::Compression(e.to_string()))?;
                out.extend_from_slice(&compressed);
            }
            None => out.extend_from_slice(data),
        }
        Ok(out)
    }

    pub fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let Some((&tag, body)) = payload.split_first() else {
            return Err(StorageError::CorruptData(
                "empty compressed payload".to_string(),
            ));
        };

        match tag {
            0 => Ok(body.to_vec()),
            1 => {
                let mut decoder = zstd::Decoder::new(body)
                    .map_err(|e| StorageError::Compression(e.to_string()))?;
                let mut decompressed = Vec::new();
                decoder
                    .read_to_end(&mut decompressed)
                    .map_err(|e| StorageError::Compression(e.to_string()))?;
                Ok(decompressed)
            }
            other => Err(StorageError::CorruptData(format!(
                "unknown compression tag {other}"
            ))),
        }
    }
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new(CompressionLevel::default())
    }
}
