//! Directory layout of the index root: per-index directories, composite
//! version markers, the registered-indices list and the corruption marker.

use crate::FORMAT_VERSION;
use crate::error::Result;
use crate::record::with_suffix;
use crate::record::write_atomically;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use tracing::info;
use tracing::warn;

const CORRUPTION_MARKER: &str = "corruption.marker";
const REGISTERED_FILE: &str = "registered";
const DELETING_SUFFIX: &str = "deleting";

/// Index definition version combined with the record format version. Either
/// half changing invalidates everything persisted for the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeVersion {
    pub index: u32,
    pub format: u16,
}

impl CompositeVersion {
    pub const fn current(index: u32) -> Self {
        Self {
            index,
            format: FORMAT_VERSION,
        }
    }

    fn to_bytes(self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[..4].copy_from_slice(&self.index.to_le_bytes());
        out[4..].copy_from_slice(&self.format.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; 6] = bytes.try_into().ok()?;
        Some(Self {
            index: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            format: u16::from_le_bytes([bytes[4], bytes[5]]),
        })
    }
}

/// What [`StorageRoot::clear_if_marked`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOutcome {
    /// No corruption marker was present.
    Absent,
    /// The root was deleted and recreated empty.
    Cleared,
    /// Deletion failed; the marker was put back for the next start.
    Kept,
}

/// The persistent index root.
#[derive(Debug, Clone)]
pub struct StorageRoot {
    root: PathBuf,
}

impl StorageRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn ensure_exists(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Layout of an index whose version marker lives in its own directory.
    pub fn index_layout(&self, name: &str) -> IndexLayout {
        let dir = self.root.join(name);
        IndexLayout {
            name: name.to_string(),
            version_file: dir.join(format!("{name}.ver")),
            dir,
        }
    }

    /// Layout of an index whose version marker is nested under `owner`'s
    /// directory, so wiping the owner invalidates this index too.
    pub fn index_layout_owned_by(&self, name: &str, owner: &str) -> IndexLayout {
        let mut layout = self.index_layout(name);
        layout.version_file = self.root.join(owner).join(format!("{name}.ver"));
        layout
    }

    pub fn corruption_marker(&self) -> PathBuf {
        self.root.join(CORRUPTION_MARKER)
    }

    pub fn is_marked_corrupted(&self) -> bool {
        self.corruption_marker().exists()
    }

    pub fn mark_corrupted(&self) -> Result<()> {
        self.ensure_exists()?;
        fs::write(self.corruption_marker(), b"corrupted")?;
        Ok(())
    }

    /// Delete the whole root if the corruption marker is present.
    ///
    /// When the delete fails the marker is written again so the corrupted
    /// state survives to the next start.
    pub fn clear_if_marked(&self) -> Result<MarkerOutcome> {
        if !self.is_marked_corrupted() {
            return Ok(MarkerOutcome::Absent);
        }

        info!("Corruption marker found, deleting index root {:?}", self.root);
        match safe_delete(&self.root) {
            Ok(()) => {
                self.ensure_exists()?;
                Ok(MarkerOutcome::Cleared)
            }
            Err(e) => {
                warn!("Failed to delete corrupted index root {:?}: {}", self.root, e);
                self.mark_corrupted()?;
                Ok(MarkerOutcome::Kept)
            }
        }
    }

    /// Names recorded by the last [`StorageRoot::write_registered`].
    pub fn read_registered(&self) -> Result<Vec<String>> {
        match fs::read_to_string(self.root.join(REGISTERED_FILE)) {
            Ok(text) => Ok(text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_registered<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let mut text = String::new();
        for name in names {
            text.push_str(name.as_ref());
            text.push('\n');
        }
        write_atomically(&self.root.join(REGISTERED_FILE), text.as_bytes())
    }

    /// Delete the directories of indexes registered last time but absent from
    /// `current`, then record `current` as the registered set. Returns the
    /// names that were dropped.
    pub fn drop_unregistered<S: AsRef<str>>(&self, current: &[S]) -> Result<Vec<String>> {
        let keep: BTreeSet<&str> = current.iter().map(|name| name.as_ref()).collect();
        let mut dropped = Vec::new();

        for name in self.read_registered()? {
            if keep.contains(name.as_str()) {
                continue;
            }
            let dir = self.root.join(&name);
            if dir.exists() {
                info!("Dropping storage of unregistered index {}", name);
                safe_delete(&dir)?;
            }
            dropped.push(name);
        }

        self.write_registered(current)?;
        Ok(dropped)
    }
}

/// Paths belonging to one index.
#[derive(Debug, Clone)]
pub struct IndexLayout {
    name: String,
    dir: PathBuf,
    version_file: PathBuf,
}

impl IndexLayout {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn version_file(&self) -> &Path {
        &self.version_file
    }

    /// Inverted index records.
    pub fn storage_file(&self) -> PathBuf {
        self.dir.join(format!("{}.storage", self.name))
    }

    /// Forward index records.
    pub fn inputs_file(&self) -> PathBuf {
        self.dir.join(format!("{}_inputs", self.name))
    }

    /// Per-file indexing stamps.
    pub fn stamps_file(&self) -> PathBuf {
        self.dir.join(format!("{}.stamps", self.name))
    }

    pub fn read_version(&self) -> Option<CompositeVersion> {
        let bytes = fs::read(&self.version_file).ok()?;
        CompositeVersion::from_bytes(&bytes)
    }

    /// True when the marker is missing, unreadable or records another version.
    pub fn version_differs(&self, version: CompositeVersion) -> bool {
        self.read_version() != Some(version)
    }

    pub fn rewrite_version(&self, version: CompositeVersion) -> Result<()> {
        write_atomically(&self.version_file, &version.to_bytes())
    }

    /// Remove every file of the index. The version marker goes with the
    /// directory unless it is nested under an owner.
    pub fn wipe(&self) -> Result<()> {
        if self.dir.exists() {
            safe_delete(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}

/// Rename `dir` to a `.deleting` sibling, then remove it. A leftover sibling
/// from an interrupted delete is removed first.
pub fn safe_delete(dir: &Path) -> Result<()> {
    let doomed = with_suffix(dir, DELETING_SUFFIX);
    if doomed.exists() {
        fs::remove_dir_all(&doomed)?;
    }
    match fs::rename(dir, &doomed) {
        Ok(()) => fs::remove_dir_all(&doomed)?,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(_) => fs::remove_dir_all(dir)?,
    }
    Ok(())
}
