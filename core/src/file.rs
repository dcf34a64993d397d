//! Files as the engine sees them: identity, type, owning project and content

use filedex_storage::FileId;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;

/// Concrete file type, e.g. `"rust"` or `"java"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileType(pub String);

impl FileType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical project owning a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(pub String);

impl ProjectId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Freshness signal of a file's content. Two contents with equal stamps are
/// treated as identical by the up-to-date check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentStamp(pub u64);

impl ContentStamp {
    /// Leading 64 bits of the SHA-256 digest of `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Self(u64::from_le_bytes(head))
    }
}

/// One file's content, as handed to the update path by the host.
#[derive(Debug, Clone)]
pub struct FileContent {
    pub id: FileId,
    pub file_type: FileType,
    pub project: Option<ProjectId>,
    pub bytes: Arc<[u8]>,
    pub stamp: ContentStamp,
}

impl FileContent {
    pub fn new(id: FileId, file_type: FileType, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            id,
            file_type,
            project: None,
            stamp: ContentStamp::of(&bytes),
            bytes,
        }
    }

    #[must_use]
    pub fn with_project(mut self, project: ProjectId) -> Self {
        self.project = Some(project);
        self
    }

    /// Content as UTF-8, `None` for binary files.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub const fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            id: self.id,
            stamp: self.stamp,
        }
    }
}

/// What the up-to-date check compares stored state against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSnapshot {
    pub id: FileId,
    pub stamp: ContentStamp,
}
