//! Per-file indexing state of one index

use crate::file::ContentStamp;
use crate::file::FileSnapshot;
use dashmap::DashMap;
use filedex_storage::Compressor;
use filedex_storage::FileId;
use filedex_storage::Result;
use filedex_storage::StorageError;
use filedex_storage::record::RecordReader;
use filedex_storage::record::RecordWriter;
use serde::Deserialize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileIndexingState {
    NotIndexed,
    OutDated,
    UpToDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum StampEntry {
    Indexed(ContentStamp),
    Invalidated,
}

/// Content stamps the index was last built from, one per file. Persisted to
/// `<name>.stamps` when a path is given.
///
/// While buffering, stamps of files written through the storage overlay go
/// to a separate in-memory layer that shadows the persisted one and is never
/// flushed. `None` in that layer records a removal.
#[derive(Debug)]
pub struct FileStateTable {
    stamps: DashMap<FileId, StampEntry>,
    buffered: DashMap<FileId, Option<StampEntry>>,
    buffering: AtomicBool,
    path: Option<PathBuf>,
    compressor: Compressor,
    dirty: AtomicBool,
}

impl FileStateTable {
    pub fn in_memory() -> Self {
        Self {
            stamps: DashMap::new(),
            buffered: DashMap::new(),
            buffering: AtomicBool::new(false),
            path: None,
            compressor: Compressor::default(),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn open(path: PathBuf, compressor: Compressor) -> Result<Self> {
        let stamps = DashMap::new();
        if let Some(reader) = RecordReader::open(&path, compressor)? {
            for record in reader.read_all()? {
                let (entries, _): (Vec<(FileId, StampEntry)>, usize) =
                    bincode::serde::decode_from_slice(&record, bincode::config::standard())?;
                for (file, entry) in entries {
                    stamps.insert(file, entry);
                }
            }
        }
        Ok(Self {
            stamps,
            buffered: DashMap::new(),
            buffering: AtomicBool::new(false),
            path: Some(path),
            compressor,
            dirty: AtomicBool::new(false),
        })
    }

    /// Pure comparison of the stored stamp against the snapshot.
    pub fn state(&self, snapshot: &FileSnapshot) -> FileIndexingState {
        let entry = match self.buffered.get(&snapshot.id) {
            Some(shadowed) => *shadowed,
            None => self.stamps.get(&snapshot.id).map(|entry| *entry),
        };
        match entry {
            None => FileIndexingState::NotIndexed,
            Some(StampEntry::Indexed(stamp)) if stamp == snapshot.stamp => {
                FileIndexingState::UpToDate
            }
            Some(_) => FileIndexingState::OutDated,
        }
    }

    fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::Acquire)
    }

    pub fn mark_indexed(&self, file: FileId, stamp: ContentStamp) {
        if self.is_buffering() {
            self.buffered.insert(file, Some(StampEntry::Indexed(stamp)));
            return;
        }
        self.stamps.insert(file, StampEntry::Indexed(stamp));
        self.dirty.store(true, Ordering::Release);
    }

    /// Force `file` back to `OutDated` if it was indexed at all.
    pub fn invalidate(&self, file: FileId) {
        if let Some(mut entry) = self.buffered.get_mut(&file)
            && entry.is_some()
        {
            *entry = Some(StampEntry::Invalidated);
        }
        if let Some(mut entry) = self.stamps.get_mut(&file) {
            *entry = StampEntry::Invalidated;
            self.dirty.store(true, Ordering::Release);
        }
    }

    pub fn set_unindexed(&self, file: FileId) {
        if self.is_buffering() {
            self.buffered.insert(file, None);
            return;
        }
        if self.stamps.remove(&file).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Start or stop shadowing stamp writes. Stopping discards the buffered
    /// layer, like the storage overlay it mirrors.
    pub fn set_buffering(&self, enabled: bool) {
        if !self.buffering.swap(enabled, Ordering::AcqRel) || enabled {
            return;
        }
        self.discard_buffered();
    }

    /// Drop the buffered layer. Every file written while buffering becomes
    /// `OutDated`, since its data went away with the overlay.
    pub fn discard_buffered(&self) {
        let files: Vec<FileId> = self.buffered.iter().map(|entry| *entry.key()).collect();
        self.buffered.clear();
        if files.is_empty() {
            return;
        }
        for file in files {
            self.stamps.insert(file, StampEntry::Invalidated);
        }
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear(&self) -> Result<()> {
        self.stamps.clear();
        self.buffered.clear();
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            self.dirty.store(false, Ordering::Release);
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut entries: Vec<(FileId, StampEntry)> = self
            .stamps
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        entries.sort_unstable_by_key(|(file, _)| *file);

        let mut writer = RecordWriter::new(self.compressor);
        let payload = bincode::serde::encode_to_vec(&entries, bincode::config::standard())?;
        writer.push(&payload)?;
        if let Err(e) = writer.commit(path) {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    pub fn indexed_files(&self) -> usize {
        self.stamps.len()
    }
}
