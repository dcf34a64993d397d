//! Tests for the file-backed storage

use super::*;
use crate::error::FaultKind;
use crate::layout::CompositeVersion;
use crate::record::RecordWriter;
use pretty_assertions::assert_eq;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

type Storage = PersistentIndexStorage<String, u32>;

fn open(root: &StorageRoot) -> Result<Storage> {
    PersistentIndexStorage::open(
        root.index_layout("words"),
        Arc::new(BincodeExternalizer::<String>::new()),
        Arc::new(BincodeExternalizer::<u32>::new()),
        Compressor::default(),
    )
}

fn key(s: &str) -> String {
    s.to_string()
}

#[test]
fn test_flush_and_reopen() {
    let dir = TempDir::new().unwrap();
    let root = StorageRoot::new(dir.path());

    {
        let mut storage = open(&root).unwrap();
        assert!(!storage.is_dirty());
        storage.add_value(&key("foo"), 1, 10).unwrap();
        storage.add_value(&key("foo"), 3, 10).unwrap();
        storage.add_value(&key("bar"), 3, 7).unwrap();
        storage
            .write_inputs(3, Some(InputData::from([(key("foo"), 10), (key("bar"), 7)])))
            .unwrap();
        assert!(storage.is_dirty());
        storage.flush().unwrap();
        assert!(!storage.is_dirty());
    }

    let storage = open(&root).unwrap();
    let foo = storage.read(&key("foo")).unwrap();
    assert_eq!(foo.file_ids(&10).collect::<Vec<_>>(), vec![1, 3]);
    assert!(storage.read(&key("bar")).unwrap().is_associated(&7, 3));
    assert_eq!(
        storage.read_inputs(3).unwrap(),
        Some(InputData::from([(key("foo"), 10), (key("bar"), 7)]))
    );
    assert_eq!(storage.read_inputs(1).unwrap(), None);
}

#[test]
fn test_truncated_storage_is_fault() {
    let dir = TempDir::new().unwrap();
    let root = StorageRoot::new(dir.path());

    let mut storage = open(&root).unwrap();
    for i in 0..20 {
        storage.add_value(&format!("key{i}"), i, i).unwrap();
    }
    storage.flush().unwrap();
    drop(storage);

    let path = root.index_layout("words").storage_file();
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();

    let err = open(&root).err().unwrap();
    assert!(matches!(err, StorageError::MalformedRecord { .. }));
    assert_eq!(err.kind(), FaultKind::Malformed);
}

#[test]
fn test_buffered_writes_are_transient() {
    let dir = TempDir::new().unwrap();
    let root = StorageRoot::new(dir.path());
    let mut storage = open(&root).unwrap();
    storage.add_value(&key("foo"), 1, 1).unwrap();
    storage.flush().unwrap();

    storage.set_buffering(true);
    storage.remove_all_values(&key("foo"), 1).unwrap();
    storage.add_value(&key("bar"), 2, 2).unwrap();
    storage.write_inputs(2, Some(InputData::from([(key("bar"), 2)]))).unwrap();
    assert!(!storage.is_dirty());

    assert!(storage.read(&key("foo")).unwrap().is_empty());
    let mut keys = Vec::new();
    storage
        .process_keys(&mut |k| {
            keys.push(k.clone());
            true
        })
        .unwrap();
    assert_eq!(keys, vec![key("bar")]);

    storage.clear_memory_buffer();
    assert!(storage.read(&key("foo")).unwrap().is_associated(&1, 1));
    assert!(storage.read(&key("bar")).unwrap().is_empty());
    assert_eq!(storage.read_inputs(2).unwrap(), None);

    storage.set_buffering(false);
    storage.add_value(&key("bar"), 2, 2).unwrap();
    assert!(storage.is_dirty());
}

#[test]
fn test_clear_removes_files() {
    let dir = TempDir::new().unwrap();
    let root = StorageRoot::new(dir.path());
    let layout = root.index_layout("words");
    layout.rewrite_version(CompositeVersion::current(3)).unwrap();

    let mut storage = open(&root).unwrap();
    storage.add_value(&key("foo"), 1, 1).unwrap();
    storage.write_inputs(1, Some(InputData::from([(key("foo"), 1)]))).unwrap();
    storage.flush().unwrap();
    assert!(layout.storage_file().exists());

    storage.clear().unwrap();
    assert!(!layout.storage_file().exists());
    assert!(!layout.inputs_file().exists());
    assert!(!layout.version_differs(CompositeVersion::current(3)));
    assert!(open(&root).unwrap().read(&key("foo")).unwrap().is_empty());
}

fn write_records(path: &std::path::Path, records: &[Vec<u8>]) {
    let mut writer = RecordWriter::new(Compressor::default());
    for record in records {
        writer.push(record).unwrap();
    }
    writer.commit(path).unwrap();
}

#[test]
fn test_oversized_entry_count_is_fault() {
    let dir = TempDir::new().unwrap();
    let root = StorageRoot::new(dir.path());
    let layout = root.index_layout("words");
    fs::create_dir_all(layout.dir()).unwrap();

    let generation = 1u64.to_le_bytes().to_vec();
    let mut bogus = 1u32.to_le_bytes().to_vec();
    bogus.extend_from_slice(&u32::MAX.to_le_bytes());
    write_records(&layout.storage_file(), &[generation.clone()]);
    write_records(&layout.inputs_file(), &[generation, bogus]);

    let err = open(&root).err().unwrap();
    assert_eq!(err.kind(), FaultKind::Decode);
}

#[test]
fn test_files_from_different_flushes_are_fault() {
    let dir = TempDir::new().unwrap();
    let root = StorageRoot::new(dir.path());
    let layout = root.index_layout("words");

    let mut storage = open(&root).unwrap();
    assert_eq!(storage.generation(), 0);
    storage.add_value(&key("foo"), 1, 1).unwrap();
    storage.write_inputs(1, Some(InputData::from([(key("foo"), 1)]))).unwrap();
    storage.flush().unwrap();
    let stale_inputs = fs::read(layout.inputs_file()).unwrap();

    storage.add_value(&key("bar"), 2, 2).unwrap();
    storage.write_inputs(2, Some(InputData::from([(key("bar"), 2)]))).unwrap();
    storage.flush().unwrap();
    assert_eq!(storage.generation(), 2);
    drop(storage);
    assert_eq!(open(&root).unwrap().generation(), 2);

    fs::write(layout.inputs_file(), &stale_inputs).unwrap();
    let err = open(&root).err().unwrap();
    assert!(matches!(err, StorageError::CorruptData(_)));

    fs::remove_file(layout.inputs_file()).unwrap();
    assert!(matches!(open(&root).err().unwrap(), StorageError::CorruptData(_)));
}
