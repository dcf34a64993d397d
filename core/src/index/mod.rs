//! One index: inverted and forward storage behind a read/write lock, the
//! per-file state table and the user indexer.
//!
//! ```text
//!              ┌──────────────── IndexCore<K, V> ────────────────┐
//!  queries ──▶ │ read()  ─▶ IndexReadGuard  ─┐                   │
//!              │                             ├─▶ RwLock<storage> │
//!  updater ──▶ │ write() ─▶ IndexWriteGuard ─┘                   │
//!              │ FileStateTable   modification stamp   indexer   │
//!              └─────────────────────────────────────────────────┘
//! ```
//!
//! Readers only ever hold the read lock. `update_with` applies a whole diff
//! under one write guard, so readers see either the state before or after
//! it. A writer that panics poisons the lock; every later access reports that
//! as a storage fault until a rebuild clears the index and the poison.

pub mod diff;
pub mod extension;
pub mod state;

use crate::access::AccessContext;
use crate::access::ResultCache;
use crate::error::IndexError;
use crate::error::Result;
use crate::file::FileContent;
use crate::file::FileSnapshot;
use crate::input_filter::InputFilter;
use diff::InputDataDiff;
use extension::DataIndexer;
use filedex_storage::FileId;
use filedex_storage::IndexStorage;
use filedex_storage::InputData;
use filedex_storage::StorageError;
use filedex_storage::ValueContainer;
use state::FileIndexingState;
use state::FileStateTable;
use std::any::Any;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use tracing::debug;

/// Bounds every index key type satisfies.
pub trait IndexKey: Eq + Hash + Clone + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + Send + Sync + 'static> IndexKey for T {}

/// Bounds every index value type satisfies.
pub trait IndexValue: PartialEq + Clone + Send + Sync + 'static {}

impl<T: PartialEq + Clone + Send + Sync + 'static> IndexValue for T {}

type Storage<K, V> = Box<dyn IndexStorage<K, V>>;

pub struct IndexCore<K, V> {
    name: &'static str,
    version: u32,
    storage: RwLock<Storage<K, V>>,
    states: FileStateTable,
    indexer: Arc<dyn DataIndexer<K, V>>,
    input_filter: Arc<dyn InputFilter>,
    modifications: AtomicU64,
    all_keys: ResultCache<u64, Arc<Vec<K>>>,
}

impl<K: IndexKey, V: IndexValue> IndexCore<K, V> {
    pub fn new(
        name: &'static str,
        version: u32,
        storage: Storage<K, V>,
        states: FileStateTable,
        indexer: Arc<dyn DataIndexer<K, V>>,
        input_filter: Arc<dyn InputFilter>,
    ) -> Self {
        Self {
            name,
            version,
            storage: RwLock::new(storage),
            states,
            indexer,
            input_filter,
            modifications: AtomicU64::new(0),
            all_keys: ResultCache::new(4),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn version(&self) -> u32 {
        self.version
    }

    fn fault(&self) -> impl Fn(StorageError) -> IndexError + '_ {
        move |source| IndexError::storage(self.name, source)
    }

    fn poisoned(&self) -> IndexError {
        IndexError::storage(
            self.name,
            StorageError::Poisoned(format!("index {} lock", self.name)),
        )
    }

    pub fn read(&self) -> Result<IndexReadGuard<'_, K, V>> {
        let storage = self.storage.read().map_err(|_| self.poisoned())?;
        Ok(IndexReadGuard {
            core: self,
            storage,
        })
    }

    pub fn write(&self) -> Result<IndexWriteGuard<'_, K, V>> {
        let storage = self.storage.write().map_err(|_| self.poisoned())?;
        Ok(IndexWriteGuard {
            core: self,
            storage,
        })
    }

    /// Run the indexer on `content`. Errors and panics inside the indexer
    /// become [`IndexError::Indexer`].
    pub fn map_input(&self, content: &FileContent) -> Result<InputData<K, V>> {
        let indexer = &self.indexer;
        match catch_unwind(AssertUnwindSafe(|| indexer.map(content))) {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(e)) => Err(IndexError::Indexer {
                index: self.name.to_string(),
                file: content.id,
                message: e.to_string(),
            }),
            Err(payload) => Err(IndexError::Indexer {
                index: self.name.to_string(),
                file: content.id,
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Reindex one file and mark it up to date. A file the input filter
    /// rejects contributes nothing.
    pub fn update_file(&self, content: &FileContent) -> Result<()> {
        let data = if self.input_filter.accept(content, content.project.as_ref()) {
            self.map_input(content)?
        } else {
            InputData::new()
        };

        {
            let mut guard = self.write()?;
            let old = guard.get_indexed_file_data(content.id)?;
            let diff = InputDataDiff::compute(content.id, &old, &data);
            guard.update_with(&diff)?;
        }
        self.states.mark_indexed(content.id, content.stamp);
        Ok(())
    }

    /// Drop everything `file` contributed and forget its state.
    pub fn remove_file(&self, file: FileId) -> Result<()> {
        {
            let mut guard = self.write()?;
            let old = guard.get_indexed_file_data(file)?;
            if !old.is_empty() {
                let diff = InputDataDiff::compute(file, &old, &InputData::new());
                guard.update_with(&diff)?;
            }
        }
        self.states.set_unindexed(file);
        Ok(())
    }

    pub fn indexing_state(&self, snapshot: &FileSnapshot) -> FileIndexingState {
        self.states.state(snapshot)
    }

    pub fn invalidate_indexed_state(&self, file: FileId) {
        self.states.invalidate(file);
    }

    pub fn set_unindexed_state(&self, file: FileId) {
        self.states.set_unindexed(file);
    }

    /// Monotonic counter bumped by every applied diff and by `clear`.
    pub fn modification_stamp(&self) -> u64 {
        self.modifications.load(Ordering::Acquire)
    }

    /// Drop buffered writes. Files they covered fall back to `OutDated`.
    pub fn cleanup_memory_storage(&self) -> Result<()> {
        let mut guard = self.write()?;
        guard.storage.clear_memory_buffer();
        self.states.discard_buffered();
        self.all_keys.clear();
        self.bump();
        Ok(())
    }

    pub fn set_buffering(&self, enabled: bool) -> Result<()> {
        let mut guard = self.write()?;
        guard.storage.set_buffering(enabled);
        self.states.set_buffering(enabled);
        self.bump();
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        let storage_dirty = self
            .storage
            .read()
            .map(|storage| storage.is_dirty())
            .unwrap_or(false);
        storage_dirty || self.states.is_dirty()
    }

    pub fn flush(&self) -> Result<()> {
        self.write()?.storage.flush().map_err(self.fault())?;
        self.states.flush().map_err(self.fault())
    }

    /// Discard all data and states. Used by rebuilds, so it also takes over a
    /// lock poisoned by a panicking writer and clears the poison once the
    /// storage is empty again.
    pub fn clear(&self) -> Result<()> {
        {
            let mut storage = self.storage.write().unwrap_or_else(PoisonError::into_inner);
            storage.clear().map_err(self.fault())?;
            self.states.clear().map_err(self.fault())?;
            self.storage.clear_poison();
        }
        self.all_keys.clear();
        self.bump();
        debug!("Cleared index {}", self.name);
        Ok(())
    }

    /// Every key with at least one value, memoized per modification stamp.
    pub fn all_keys(&self, context: &AccessContext) -> Result<Arc<Vec<K>>> {
        let stamp = self.modification_stamp();
        self.all_keys.get_or_try_compute(context, stamp, || {
            let guard = self.read()?;
            let mut keys = Vec::new();
            let mut cancelled = false;
            guard.process_keys(&mut |key| {
                if context.is_cancelled() {
                    cancelled = true;
                    return false;
                }
                keys.push(key.clone());
                true
            })?;
            if cancelled {
                return Err(IndexError::Cancelled);
            }
            Ok(Arc::new(keys))
        })
    }

    fn bump(&self) {
        self.modifications.fetch_add(1, Ordering::AcqRel);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "indexer panicked".to_string()
    }
}

/// Shared access to one index's storage.
pub struct IndexReadGuard<'a, K, V> {
    core: &'a IndexCore<K, V>,
    storage: RwLockReadGuard<'a, Storage<K, V>>,
}

impl<K: IndexKey, V: IndexValue> IndexReadGuard<'_, K, V> {
    pub fn get_data(&self, key: &K) -> Result<ValueContainer<V>> {
        self.storage.read(key).map_err(self.core.fault())
    }

    pub fn get_indexed_file_data(&self, file: FileId) -> Result<InputData<K, V>> {
        Ok(self
            .storage
            .read_inputs(file)
            .map_err(self.core.fault())?
            .unwrap_or_default())
    }

    pub fn process_keys(&self, processor: &mut dyn FnMut(&K) -> bool) -> Result<bool> {
        self.storage
            .process_keys(processor)
            .map_err(self.core.fault())
    }
}

/// Exclusive access to one index's storage.
pub struct IndexWriteGuard<'a, K, V> {
    core: &'a IndexCore<K, V>,
    storage: RwLockWriteGuard<'a, Storage<K, V>>,
}

impl<K: IndexKey, V: IndexValue> IndexWriteGuard<'_, K, V> {
    pub fn get_data(&self, key: &K) -> Result<ValueContainer<V>> {
        self.storage.read(key).map_err(self.core.fault())
    }

    pub fn get_indexed_file_data(&self, file: FileId) -> Result<InputData<K, V>> {
        Ok(self
            .storage
            .read_inputs(file)
            .map_err(self.core.fault())?
            .unwrap_or_default())
    }

    /// Apply `diff` to the inverted and forward storage and bump the
    /// modification stamp.
    pub fn update_with(&mut self, diff: &InputDataDiff<K, V>) -> Result<()> {
        let fault = self.core.fault();
        for key in &diff.removed {
            self.storage
                .remove_all_values(key, diff.file)
                .map_err(&fault)?;
        }
        for (key, value) in &diff.added {
            self.storage
                .add_value(key, diff.file, value.clone())
                .map_err(&fault)?;
        }

        let old = self
            .storage
            .read_inputs(diff.file)
            .map_err(&fault)?
            .unwrap_or_default();
        let forward = diff.apply_to(old);
        let forward = (!forward.is_empty()).then_some(forward);
        self.storage
            .write_inputs(diff.file, forward)
            .map_err(&fault)?;

        self.core.bump();
        Ok(())
    }
}

/// Operations the engine needs on an index without knowing its key and
/// value types.
pub trait AnyIndex: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> u32;

    fn input_filter(&self) -> &dyn InputFilter;

    fn index_file(&self, content: &FileContent) -> Result<()>;

    fn remove_file(&self, file: FileId) -> Result<()>;

    fn indexing_state(&self, snapshot: &FileSnapshot) -> FileIndexingState;

    fn invalidate_indexed_state(&self, file: FileId);

    fn set_unindexed_state(&self, file: FileId);

    fn modification_stamp(&self) -> u64;

    fn cleanup_memory_storage(&self) -> Result<()>;

    fn set_buffering(&self, enabled: bool) -> Result<()>;

    fn is_dirty(&self) -> bool;

    fn flush(&self) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<K: IndexKey, V: IndexValue> AnyIndex for IndexCore<K, V> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn input_filter(&self) -> &dyn InputFilter {
        self.input_filter.as_ref()
    }

    fn index_file(&self, content: &FileContent) -> Result<()> {
        self.update_file(content)
    }

    fn remove_file(&self, file: FileId) -> Result<()> {
        IndexCore::remove_file(self, file)
    }

    fn indexing_state(&self, snapshot: &FileSnapshot) -> FileIndexingState {
        IndexCore::indexing_state(self, snapshot)
    }

    fn invalidate_indexed_state(&self, file: FileId) {
        IndexCore::invalidate_indexed_state(self, file);
    }

    fn set_unindexed_state(&self, file: FileId) {
        IndexCore::set_unindexed_state(self, file);
    }

    fn modification_stamp(&self) -> u64 {
        IndexCore::modification_stamp(self)
    }

    fn cleanup_memory_storage(&self) -> Result<()> {
        IndexCore::cleanup_memory_storage(self)
    }

    fn set_buffering(&self, enabled: bool) -> Result<()> {
        IndexCore::set_buffering(self, enabled)
    }

    fn is_dirty(&self) -> bool {
        IndexCore::is_dirty(self)
    }

    fn flush(&self) -> Result<()> {
        IndexCore::flush(self)
    }

    fn clear(&self) -> Result<()> {
        IndexCore::clear(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileType;
    use crate::input_filter::AcceptAll;
    use crate::input_filter::FileTypeFilter;
    use extension::IndexerError;
    use filedex_storage::MemoryIndexStorage;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;

    fn words(content: &FileContent) -> std::result::Result<InputData<String, u32>, IndexerError> {
        let text = content.text().ok_or("binary content")?;
        let mut data = InputData::new();
        for word in text.split_whitespace() {
            *data.entry(word.to_string()).or_insert(0) += 1;
        }
        Ok(data)
    }

    fn core_with(filter: Arc<dyn InputFilter>) -> IndexCore<String, u32> {
        IndexCore::new(
            "words",
            1,
            Box::new(MemoryIndexStorage::new()),
            FileStateTable::in_memory(),
            Arc::new(words),
            filter,
        )
    }

    fn text(id: FileId, body: &str) -> FileContent {
        FileContent::new(id, FileType::new("txt"), body.as_bytes().to_vec())
    }

    #[test]
    fn test_forward_and_inverted_stay_consistent() {
        let core = core_with(Arc::new(AcceptAll));
        core.update_file(&text(1, "a b")).unwrap();
        core.update_file(&text(1, "b c")).unwrap();

        let guard = core.read().unwrap();
        let forward = guard.get_indexed_file_data(1).unwrap();
        let mut keys: Vec<_> = forward.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
        assert!(guard.get_data(&"a".to_string()).unwrap().is_empty());
        assert!(guard.get_data(&"c".to_string()).unwrap().is_associated(&1, 1));
    }

    #[test]
    fn test_states_follow_updates() {
        let core = core_with(Arc::new(AcceptAll));
        let v1 = text(3, "one");
        let v2 = text(3, "two");

        assert_eq!(core.indexing_state(&v1.snapshot()), FileIndexingState::NotIndexed);
        core.update_file(&v1).unwrap();
        assert_eq!(core.indexing_state(&v1.snapshot()), FileIndexingState::UpToDate);
        assert_eq!(core.indexing_state(&v2.snapshot()), FileIndexingState::OutDated);

        core.remove_file(3).unwrap();
        assert_eq!(core.indexing_state(&v1.snapshot()), FileIndexingState::NotIndexed);
        assert!(core.read().unwrap().get_data(&"one".to_string()).unwrap().is_empty());
    }

    #[test]
    fn test_modification_stamp_is_monotonic() {
        let core = core_with(Arc::new(AcceptAll));
        let start = core.modification_stamp();
        core.update_file(&text(1, "x")).unwrap();
        let after_update = core.modification_stamp();
        core.clear().unwrap();
        assert!(start < after_update);
        assert!(after_update < core.modification_stamp());
    }

    #[test]
    fn test_indexer_panic_is_indexer_error() {
        let core = IndexCore::<String, u32>::new(
            "panicky",
            1,
            Box::new(MemoryIndexStorage::new()),
            FileStateTable::in_memory(),
            Arc::new(|_: &FileContent| -> std::result::Result<InputData<String, u32>, IndexerError> {
                panic!("indexer bug")
            }),
            Arc::new(AcceptAll),
        );

        let err = core.update_file(&text(1, "x")).unwrap_err();
        match err {
            IndexError::Indexer { index, file, message } => {
                assert_eq!(index, "panicky");
                assert_eq!(file, 1);
                assert_eq!(message, "indexer bug");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(core.read().is_ok());
    }

    /// Memory storage whose `add_value` panics once armed.
    struct PanickingStorage {
        inner: MemoryIndexStorage<String, u32>,
        armed: Arc<AtomicBool>,
    }

    impl IndexStorage<String, u32> for PanickingStorage {
        fn read(&self, key: &String) -> filedex_storage::Result<ValueContainer<u32>> {
            self.inner.read(key)
        }
        fn add_value(&mut self, key: &String, file: FileId, value: u32) -> filedex_storage::Result<()> {
            if self.armed.load(Ordering::SeqCst) {
                panic!("storage writer crashed");
            }
            self.inner.add_value(key, file, value)
        }
        fn remove_all_values(&mut self, key: &String, file: FileId) -> filedex_storage::Result<()> {
            self.inner.remove_all_values(key, file)
        }
        fn process_keys(&self, processor: &mut dyn FnMut(&String) -> bool) -> filedex_storage::Result<bool> {
            self.inner.process_keys(processor)
        }
        fn read_inputs(&self, file: FileId) -> filedex_storage::Result<Option<InputData<String, u32>>> {
            self.inner.read_inputs(file)
        }
        fn write_inputs(
            &mut self,
            file: FileId,
            data: Option<InputData<String, u32>>,
        ) -> filedex_storage::Result<()> {
            self.inner.write_inputs(file, data)
        }
        fn clear(&mut self) -> filedex_storage::Result<()> {
            self.inner.clear()
        }
        fn flush(&mut self) -> filedex_storage::Result<()> {
            Ok(())
        }
        fn is_dirty(&self) -> bool {
            false
        }
        fn set_buffering(&mut self, _enabled: bool) {}
        fn clear_memory_buffer(&mut self) {}
    }

    #[test]
    fn test_clear_recovers_poisoned_lock() {
        let armed = Arc::new(AtomicBool::new(false));
        let core = IndexCore::new(
            "words",
            1,
            Box::new(PanickingStorage {
                inner: MemoryIndexStorage::new(),
                armed: Arc::clone(&armed),
            }),
            FileStateTable::in_memory(),
            Arc::new(words),
            Arc::new(AcceptAll),
        );
        core.update_file(&text(1, "before")).unwrap();

        armed.store(true, Ordering::SeqCst);
        let crashed = catch_unwind(AssertUnwindSafe(|| core.update_file(&text(2, "crash"))));
        assert!(crashed.is_err());
        assert!(matches!(
            core.read(),
            Err(IndexError::Storage {
                source: StorageError::Poisoned(_),
                ..
            })
        ));
        assert!(core.write().is_err());

        armed.store(false, Ordering::SeqCst);
        core.clear().unwrap();
        assert!(core.read().unwrap().get_data(&"before".to_string()).unwrap().is_empty());
        core.update_file(&text(2, "after")).unwrap();
        assert!(core.read().unwrap().get_data(&"after".to_string()).unwrap().is_associated(&1, 2));
    }

    #[test]
    fn test_rejected_file_contributes_nothing() {
        let core = core_with(Arc::new(FileTypeFilter::new([FileType::new("md")])));
        let content = text(5, "hello");
        core.update_file(&content).unwrap();

        assert!(core.read().unwrap().get_indexed_file_data(5).unwrap().is_empty());
        assert_eq!(core.indexing_state(&content.snapshot()), FileIndexingState::UpToDate);
    }

    #[test]
    fn test_all_keys_memoized_until_modified() {
        let core = core_with(Arc::new(AcceptAll));
        let context = AccessContext::new();
        core.update_file(&text(1, "a b")).unwrap();

        let first = core.all_keys(&context).unwrap();
        let second = core.all_keys(&context).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        core.update_file(&text(2, "c")).unwrap();
        let third = core.all_keys(&context).unwrap();
        assert_eq!(third.len(), 3);
    }
}
