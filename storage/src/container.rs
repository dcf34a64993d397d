//! Per-key value containers and forward-index entries

use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::collections::HashMap;

/// Dense file identifier handed out by the host's file-identity service.
pub type FileId = u32;

/// Forward-index entry: what one file contributed, key → value.
pub type InputData<K, V> = HashMap<K, V>;

/// Values stored under one key, each with the ascending set of files that
/// produced it.
///
/// Values are compared with `PartialEq` and kept in insertion order. A value
/// whose file set becomes empty is removed, so an empty container always
/// means "no file contributes anything for this key".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueContainer<V> {
    entries: Vec<(V, BTreeSet<FileId>)>,
}

impl<V> Default for ValueContainer<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V: PartialEq> ValueContainer<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `value` with `file`. A file contributes at most one value per
    /// key, so any previous association of `file` is dropped first.
    pub fn add_value(&mut self, file: FileId, value: V) {
        self.remove_file(file);
        if let Some((_, files)) = self.entries.iter_mut().find(|(v, _)| *v == value) {
            files.insert(file);
        } else {
            self.entries.push((value, BTreeSet::from([file])));
        }
    }

    /// Drop every association of `file`. Returns whether anything was removed.
    pub fn remove_file(&mut self, file: FileId) -> bool {
        let mut removed = false;
        for (_, files) in &mut self.entries {
            removed |= files.remove(&file);
        }
        if removed {
            self.entries.retain(|(_, files)| !files.is_empty());
        }
        removed
    }

    /// Files that produced `value`, ascending.
    pub fn file_ids<'a>(&'a self, value: &'a V) -> impl Iterator<Item = FileId> + 'a {
        self.entries
            .iter()
            .filter(move |(v, _)| v == value)
            .flat_map(|(_, files)| files.iter().copied())
    }

    pub fn is_associated(&self, value: &V, file: FileId) -> bool {
        self.entries
            .iter()
            .any(|(v, files)| v == value && files.contains(&file))
    }

    /// The value `file` contributed, if any.
    pub fn value_of(&self, file: FileId) -> Option<&V> {
        self.entries
            .iter()
            .find(|(_, files)| files.contains(&file))
            .map(|(v, _)| v)
    }
}

impl<V> ValueContainer<V> {
    /// Union of the file sets of every value, ascending.
    pub fn all_file_ids(&self) -> BTreeSet<FileId> {
        self.entries
            .iter()
            .flat_map(|(_, files)| files.iter().copied())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&V, &BTreeSet<FileId>)> {
        self.entries.iter().map(|(v, files)| (v, files))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(v, _)| v)
    }

    pub const fn value_count(&self) -> usize {
        self.entries.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
