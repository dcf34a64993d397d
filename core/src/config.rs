//! Engine configuration, loadable from TOML

use crate::error::IndexError;
use crate::error::Result;
use filedex_storage::CompressionLevel;
use filedex_storage::FaultKind;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Persistent index root
    #[serde(default = "default_index_root")]
    pub index_root: PathBuf,

    /// Foreign files admitted per refresh batch
    #[serde(default = "default_foreign_file_cap")]
    pub foreign_file_cap: usize,

    /// Route writes through the in-memory overlay
    #[serde(default)]
    pub buffering: bool,

    #[serde(default)]
    pub compression: CompressionLevel,

    /// `false` keeps every index in memory only
    #[serde(default = "default_true")]
    pub persistent: bool,

    #[serde(default)]
    pub fault_policy: FaultPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            index_root: default_index_root(),
            foreign_file_cap: default_foreign_file_cap(),
            buffering: false,
            compression: CompressionLevel::default(),
            persistent: true,
            fault_policy: FaultPolicy::default(),
        }
    }
}

/// Which storage fault classes schedule a rebuild of the affected index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPolicy {
    #[serde(default = "default_true")]
    pub rebuild_on_io: bool,
    #[serde(default = "default_true")]
    pub rebuild_on_decode: bool,
    #[serde(default = "default_true")]
    pub rebuild_on_malformed: bool,
    #[serde(default = "default_true")]
    pub rebuild_on_invalid_argument: bool,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self {
            rebuild_on_io: true,
            rebuild_on_decode: true,
            rebuild_on_malformed: true,
            rebuild_on_invalid_argument: true,
        }
    }
}

impl FaultPolicy {
    pub const fn rebuilds_on(&self, kind: FaultKind) -> bool {
        match kind {
            FaultKind::Io => self.rebuild_on_io,
            FaultKind::Decode => self.rebuild_on_decode,
            FaultKind::Malformed => self.rebuild_on_malformed,
            FaultKind::InvalidArgument => self.rebuild_on_invalid_argument,
        }
    }
}

fn default_index_root() -> PathBuf {
    PathBuf::from("index")
}

const fn default_foreign_file_cap() -> usize {
    2
}

const fn default_true() -> bool {
    true
}

impl EngineConfig {
    /// Config with `index_root` set and everything else defaulted.
    pub fn with_root(index_root: impl Into<PathBuf>) -> Self {
        Self {
            index_root: index_root.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| IndexError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IndexError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.persistent && self.index_root.as_os_str().is_empty() {
            return Err(IndexError::Config(
                "index_root must be set for a persistent engine".to_string(),
            ));
        }
        Ok(())
    }
}
