//! Read paths over registered indexes
//!
//! Every query first makes sure the index is current for its scope, then reads
//! under the index's read lock. Two things turn a query into its empty result
//! instead of an error:
//!
//! - the index is waiting for a rebuild, or the scope is empty;
//! - a storage fault that the fault policy maps to a rebuild. The rebuild is
//!   requested and the query returns without waiting for it.
//!
//! Cancellation and indexer failures propagate unchanged.

use crate::access::AccessContext;
use crate::config::FaultPolicy;
use crate::error::IndexError;
use crate::error::Result;
use crate::id::IndexId;
use crate::index::IndexCore;
use crate::index::IndexKey;
use crate::index::IndexValue;
use crate::rebuild::FaultClass;
use crate::rebuild::RebuildCoordinator;
use crate::rebuild::classify_fault;
use crate::registry::IndexRegistry;
use crate::scope::SearchScope;
use filedex_storage::FileId;
use filedex_storage::InputData;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;
use tracing::warn;

/// Brings an index up to date for a scope. Implemented by the updater.
pub trait IndexRefresher: Send + Sync {
    fn refresh(&self, index: &str, scope: &SearchScope, context: &AccessContext) -> Result<()>;
}

pub struct QueryEngine {
    registry: Arc<IndexRegistry>,
    rebuild: Arc<RebuildCoordinator>,
    refresher: Arc<dyn IndexRefresher>,
    policy: FaultPolicy,
}

impl QueryEngine {
    pub fn new(
        registry: Arc<IndexRegistry>,
        rebuild: Arc<RebuildCoordinator>,
        refresher: Arc<dyn IndexRefresher>,
        policy: FaultPolicy,
    ) -> Self {
        Self {
            registry,
            rebuild,
            refresher,
            policy,
        }
    }

    /// Refresh `index` for `scope` unless the context suppresses it. Returns
    /// `false` when the index must not be read: empty scope or pending rebuild.
    ///
    /// A nested call from inside a refresh on the same context returns `true`
    /// without refreshing again.
    pub fn ensure_up_to_date(
        &self,
        index: &str,
        scope: &SearchScope,
        context: &AccessContext,
    ) -> Result<bool> {
        if scope.is_empty() || self.rebuild.requires_rebuild(index) {
            return Ok(false);
        }
        context.check_canceled()?;

        if context.up_to_date_checks_enabled()
            && let Some(_updating) = context.enter_update()
        {
            let refreshed = self.refresher.refresh(index, scope, context);
            self.recover(index, refreshed, || ())?;
        }

        Ok(!self.rebuild.requires_rebuild(index))
    }

    /// Turn a rebuild-class fault into a rebuild request plus `fallback()`.
    fn recover<T>(&self, index: &str, result: Result<T>, fallback: impl FnOnce() -> T) -> Result<T> {
        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        match classify_fault(&error, &self.policy) {
            FaultClass::Rebuild => {
                warn!("Storage fault in index {}, scheduling rebuild: {}", index, error);
                self.rebuild.request_rebuild(index, error.to_string());
                Ok(fallback())
            }
            FaultClass::Cancelled => {
                debug!("Query on index {} cancelled", index);
                Err(error)
            }
            FaultClass::IndexerError | FaultClass::Unrelated => Err(error),
        }
    }

    fn core<K: IndexKey, V: IndexValue>(&self, id: &IndexId<K, V>) -> Result<Arc<IndexCore<K, V>>> {
        self.registry.index(id)
    }

    /// Values stored under `key` by files in `scope`.
    pub fn get_values<K: IndexKey, V: IndexValue>(
        &self,
        id: &IndexId<K, V>,
        key: &K,
        scope: &SearchScope,
        context: &AccessContext,
    ) -> Result<Vec<V>> {
        let mut values: Vec<V> = Vec::new();
        self.process_values(id, key, scope, context, &mut |_, value| {
            if !values.contains(value) {
                values.push(value.clone());
            }
            true
        })?;
        Ok(values)
    }

    /// Feed `(file, value)` pairs for `key` to `processor`, files ascending
    /// per value. Returns `false` when the processor stopped early.
    pub fn process_values<K: IndexKey, V: IndexValue>(
        &self,
        id: &IndexId<K, V>,
        key: &K,
        scope: &SearchScope,
        context: &AccessContext,
        processor: &mut dyn FnMut(FileId, &V) -> bool,
    ) -> Result<bool> {
        let core = self.core(id)?;
        if !self.ensure_up_to_date(id.name(), scope, context)? {
            return Ok(true);
        }

        let result = (|| -> Result<bool> {
            let guard = core.read()?;
            if let Some(file) = scope.single_file() {
                context.check_canceled()?;
                let data = guard.get_indexed_file_data(file)?;
                return Ok(match data.get(key) {
                    Some(value) => processor(file, value),
                    None => true,
                });
            }

            let container = guard.get_data(key)?;
            for (value, files) in container.iter() {
                context.check_canceled()?;
                for &file in files {
                    context.check_canceled()?;
                    if scope.contains(file) && !processor(file, value) {
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        })();
        self.recover(id.name(), result, || true)
    }

    /// Files in `scope` that have any value for `key`, ascending.
    pub fn get_containing_files<K: IndexKey, V: IndexValue>(
        &self,
        id: &IndexId<K, V>,
        key: &K,
        scope: &SearchScope,
        context: &AccessContext,
    ) -> Result<Vec<FileId>> {
        self.files_containing_all_keys(id, std::slice::from_ref(key), scope, context)
    }

    /// Visit every key that at least one in-scope file contributes.
    pub fn process_all_keys<K: IndexKey, V: IndexValue>(
        &self,
        id: &IndexId<K, V>,
        scope: &SearchScope,
        context: &AccessContext,
        processor: &mut dyn FnMut(&K) -> bool,
    ) -> Result<bool> {
        let core = self.core(id)?;
        if !self.ensure_up_to_date(id.name(), scope, context)? {
            return Ok(true);
        }

        let result = (|| -> Result<bool> {
            let guard = core.read()?;
            let mut failure: Option<IndexError> = None;
            let completed = guard.process_keys(&mut |key| {
                if let Err(e) = context.check_canceled() {
                    failure = Some(e);
                    return false;
                }
                if scope.is_everything() {
                    return processor(key);
                }
                match guard.get_data(key) {
                    Ok(container) => {
                        let in_scope = container
                            .iter()
                            .any(|(_, files)| files.iter().any(|&file| scope.contains(file)));
                        !in_scope || processor(key)
                    }
                    Err(e) => {
                        failure = Some(e);
                        false
                    }
                }
            })?;
            match failure {
                Some(error) => Err(error),
                None => Ok(completed),
            }
        })();
        self.recover(id.name(), result, || true)
    }

    /// Every key of the index, memoized per modification stamp while the
    /// context allows memoization.
    pub fn get_all_keys<K: IndexKey, V: IndexValue>(
        &self,
        id: &IndexId<K, V>,
        context: &AccessContext,
    ) -> Result<Vec<K>> {
        let core = self.core(id)?;
        if !self.ensure_up_to_date(id.name(), &SearchScope::everything(), context)? {
            return Ok(Vec::new());
        }
        let result = core.all_keys(context).map(|keys| keys.as_ref().clone());
        self.recover(id.name(), result, Vec::new)
    }

    /// Files in `scope` containing every key in `keys`, ascending.
    pub fn files_containing_all_keys<K: IndexKey, V: IndexValue>(
        &self,
        id: &IndexId<K, V>,
        keys: &[K],
        scope: &SearchScope,
        context: &AccessContext,
    ) -> Result<Vec<FileId>> {
        let mut files = Vec::new();
        self.process_files_containing_all_keys(id, keys, scope, None, context, &mut |file| {
            files.push(file);
            true
        })?;
        Ok(files)
    }

    /// Intersect the in-scope file sets of `keys`, keeping only values the
    /// checker accepts, and feed the result to `processor` in ascending
    /// order. Stops at the first key whose set is empty.
    pub fn process_files_containing_all_keys<K: IndexKey, V: IndexValue>(
        &self,
        id: &IndexId<K, V>,
        keys: &[K],
        scope: &SearchScope,
        value_checker: Option<&dyn Fn(&V) -> bool>,
        context: &AccessContext,
        processor: &mut dyn FnMut(FileId) -> bool,
    ) -> Result<bool> {
        let core = self.core(id)?;
        if keys.is_empty() || !self.ensure_up_to_date(id.name(), scope, context)? {
            return Ok(true);
        }

        let result = (|| -> Result<bool> {
            let files = {
                let guard = core.read()?;
                let mut acc: Option<BTreeSet<FileId>> = None;
                for key in keys {
                    let matched = key_files(&guard.get_data(key)?, scope, value_checker, context)?;
                    let next = match acc {
                        None => matched,
                        Some(prev) => prev.intersection(&matched).copied().collect(),
                    };
                    if next.is_empty() {
                        return Ok(true);
                    }
                    acc = Some(next);
                }
                acc.unwrap_or_default()
            };
            deliver(files, context, processor)
        })();
        self.recover(id.name(), result, || true)
    }

    /// Files in `scope` containing at least one of `keys`, ascending.
    pub fn files_containing_any_key<K: IndexKey, V: IndexValue>(
        &self,
        id: &IndexId<K, V>,
        keys: &[K],
        scope: &SearchScope,
        context: &AccessContext,
    ) -> Result<Vec<FileId>> {
        let core = self.core(id)?;
        if keys.is_empty() || !self.ensure_up_to_date(id.name(), scope, context)? {
            return Ok(Vec::new());
        }

        let result = (|| -> Result<Vec<FileId>> {
            let guard = core.read()?;
            let mut union = BTreeSet::new();
            for key in keys {
                union.extend(key_files(&guard.get_data(key)?, scope, None, context)?);
            }
            Ok(union.into_iter().collect())
        })();
        self.recover(id.name(), result, Vec::new)
    }

    /// What `file` contributed to the index.
    pub fn get_file_data<K: IndexKey, V: IndexValue>(
        &self,
        id: &IndexId<K, V>,
        file: FileId,
        context: &AccessContext,
    ) -> Result<InputData<K, V>> {
        let core = self.core(id)?;
        if !self.ensure_up_to_date(id.name(), &SearchScope::file(file), context)? {
            return Ok(InputData::new());
        }
        let result = core.read().and_then(|guard| guard.get_indexed_file_data(file));
        self.recover(id.name(), result, InputData::new)
    }
}

fn key_files<V>(
    container: &filedex_storage::ValueContainer<V>,
    scope: &SearchScope,
    value_checker: Option<&dyn Fn(&V) -> bool>,
    context: &AccessContext,
) -> Result<BTreeSet<FileId>> {
    let mut files = BTreeSet::new();
    for (value, ids) in container.iter() {
        context.check_canceled()?;
        if value_checker.is_some_and(|accepts| !accepts(value)) {
            continue;
        }
        for &file in ids {
            context.check_canceled()?;
            if scope.contains(file) {
                files.insert(file);
            }
        }
    }
    Ok(files)
}

fn deliver(
    files: BTreeSet<FileId>,
    context: &AccessContext,
    processor: &mut dyn FnMut(FileId) -> bool,
) -> Result<bool> {
    for file in files {
        context.check_canceled()?;
        if !processor(file) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileContent;
    use crate::file::FileType;
    use crate::index::AnyIndex;
    use crate::index::extension::IndexerError;
    use crate::index::state::FileStateTable;
    use crate::input_filter::AcceptAll;
    use crate::registry::IndexRegistryBuilder;
    use filedex_storage::IndexStorage;
    use filedex_storage::MemoryIndexStorage;
    use filedex_storage::StorageError;
    use filedex_storage::ValueContainer;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    const WORDS: IndexId<String, u32> = IndexId::new("words");

    fn words(content: &FileContent) -> std::result::Result<InputData<String, u32>, IndexerError> {
        let mut data = InputData::new();
        for word in content.text().unwrap_or_default().split_whitespace() {
            *data.entry(word.to_string()).or_insert(0) += 1;
        }
        Ok(data)
    }

    /// Memory storage whose reads fail on demand.
    struct FlakyStorage {
        inner: MemoryIndexStorage<String, u32>,
        fail_reads: Arc<AtomicBool>,
    }

    impl IndexStorage<String, u32> for FlakyStorage {
        fn read(&self, key: &String) -> filedex_storage::Result<ValueContainer<u32>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StorageError::CorruptData("bad record".into()));
            }
            self.inner.read(key)
        }
        fn add_value(&mut self, key: &String, file: FileId, value: u32) -> filedex_storage::Result<()> {
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

    #[derive(Default)]
    struct CountingRefresher {
        calls: AtomicUsize,
    }

    impl IndexRefresher for CountingRefresher {
        fn refresh(&self, _: &str, _: &SearchScope, _: &AccessContext) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        engine: QueryEngine,
        core: Arc<IndexCore<String, u32>>,
        refresher: Arc<CountingRefresher>,
        rebuild: Arc<RebuildCoordinator>,
        fail_reads: Arc<AtomicBool>,
    }

    fn fixture(files: &[(FileId, &str)]) -> Fixture {
        let fail_reads = Arc::new(AtomicBool::new(false));
        let storage = FlakyStorage {
            inner: MemoryIndexStorage::new(),
            fail_reads: Arc::clone(&fail_reads),
        };
        let core = Arc::new(IndexCore::new(
            WORDS.name(),
            1,
            Box::new(storage),
            FileStateTable::in_memory(),
            Arc::new(words),
            Arc::new(AcceptAll),
        ));
        for (id, text) in files {
            core.update_file(&FileContent::new(*id, FileType::new("txt"), text.as_bytes().to_vec()))
                .unwrap();
        }

        let mut builder = IndexRegistryBuilder::new();
        builder.register(Arc::clone(&core) as Arc<dyn AnyIndex>).unwrap();
        let registry = Arc::new(builder.freeze());
        let rebuild = Arc::new(RebuildCoordinator::new());
        let refresher = Arc::new(CountingRefresher::default());
        let engine = QueryEngine::new(
            registry,
            Arc::clone(&rebuild),
            Arc::clone(&refresher) as Arc<dyn IndexRefresher>,
            FaultPolicy::default(),
        );
        Fixture {
            engine,
            core,
            refresher,
            rebuild,
            fail_reads,
        }
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_and_or_queries() {
        let f = fixture(&[(1, "foo"), (3, "foo bar"), (5, "bar foo"), (7, "bar")]);
        let context = AccessContext::new();
        let keys = [key("foo"), key("bar")];

        let all = f
            .engine
            .files_containing_all_keys(&WORDS, &keys, &SearchScope::everything(), &context)
            .unwrap();
        assert_eq!(all, vec![3, 5]);

        let any = f
            .engine
            .files_containing_any_key(&WORDS, &keys, &SearchScope::everything(), &context)
            .unwrap();
        assert_eq!(any, vec![1, 3, 5, 7]);

        let scope = SearchScope::files([1, 5, 7].into_iter().collect());
        let scoped = f
            .engine
            .files_containing_any_key(&WORDS, &keys, &scope, &context)
            .unwrap();
        assert_eq!(scoped, vec![1, 5, 7]);
    }

    #[test]
    fn test_and_short_circuits_on_missing_key() {
        let f = fixture(&[(1, "foo bar")]);
        let context = AccessContext::new();
        let result = f
            .engine
            .files_containing_all_keys(
                &WORDS,
                &[key("missing"), key("foo")],
                &SearchScope::everything(),
                &context,
            )
            .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_value_checker_filters() {
        let f = fixture(&[(1, "a a"), (2, "a"), (3, "a a b")]);
        let context = AccessContext::new();
        let twice = |count: &u32| *count == 2;
        let mut files = Vec::new();
        f.engine
            .process_files_containing_all_keys(
                &WORDS,
                &[key("a")],
                &SearchScope::everything(),
                Some(&twice),
                &context,
                &mut |file| {
                    files.push(file);
                    true
                },
            )
            .unwrap();
        assert_eq!(files, vec![1, 3]);
    }

    #[test]
    fn test_single_file_fast_path() {
        let f = fixture(&[(1, "x x"), (2, "x")]);
        let context = AccessContext::new();
        f.fail_reads.store(true, Ordering::SeqCst);

        let values = f
            .engine
            .get_values(&WORDS, &key("x"), &SearchScope::file(1), &context)
            .unwrap();
        assert_eq!(values, vec![2]);
        assert_eq!(f.rebuild.requested_count(), 0);
    }

    #[test]
    fn test_decode_failure_requests_one_rebuild() {
        let f = fixture(&[(1, "foo")]);
        let context = AccessContext::new();
        f.fail_reads.store(true, Ordering::SeqCst);

        let files = f
            .engine
            .get_containing_files(&WORDS, &key("foo"), &SearchScope::everything(), &context)
            .unwrap();
        assert!(files.is_empty());
        assert_eq!(f.rebuild.requested_count(), 1);

        let again = f
            .engine
            .get_containing_files(&WORDS, &key("foo"), &SearchScope::everything(), &context)
            .unwrap();
        assert!(again.is_empty());
        assert_eq!(f.rebuild.requested_count(), 1);
        assert_eq!(f.rebuild.take_rebuild_requests().len(), 1);
    }

    #[test]
    fn test_empty_scope_skips_refresh() {
        let f = fixture(&[(1, "foo")]);
        let context = AccessContext::new();
        let values = f
            .engine
            .get_values(&WORDS, &key("foo"), &SearchScope::empty(), &context)
            .unwrap();
        assert!(values.is_empty());
        assert_eq!(f.refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_skip_up_to_date_checks() {
        let f = fixture(&[(1, "foo")]);
        let context = AccessContext::new();
        {
            let _skip = context.skip_up_to_date_checks();
            f.engine.get_all_keys(&WORDS, &context).unwrap();
        }
        assert_eq!(f.refresher.calls.load(Ordering::SeqCst), 0);
        f.engine.get_all_keys(&WORDS, &context).unwrap();
        assert_eq!(f.refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_scan_is_not_a_fault() {
        let f = fixture(&[(1, "a b c d"), (2, "e f")]);
        let context = AccessContext::new();
        let mut seen = 0;
        let err = f
            .engine
            .process_all_keys(&WORDS, &SearchScope::everything(), &context, &mut |_| {
                seen += 1;
                if seen == 2 {
                    context.cancel();
                }
                true
            })
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(seen, 2);
        assert_eq!(f.rebuild.requested_count(), 0);
    }

    #[test]
    fn test_cancelled_and_or_scans() {
        let f = fixture(&[(1, "hot cold"), (2, "hot"), (3, "hot cold"), (4, "hot")]);
        let context = AccessContext::new();
        let cancel_on_first_value = |_: &u32| {
            context.cancel();
            true
        };
        let mut delivered = Vec::new();
        let err = f
            .engine
            .process_files_containing_all_keys(
                &WORDS,
                &[key("hot"), key("cold")],
                &SearchScope::everything(),
                Some(&cancel_on_first_value),
                &context,
                &mut |file| {
                    delivered.push(file);
                    true
                },
            )
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(delivered.is_empty());

        let cancelled = AccessContext::new();
        cancelled.cancel();
        let err = f
            .engine
            .files_containing_any_key(
                &WORDS,
                &[key("hot"), key("cold")],
                &SearchScope::everything(),
                &cancelled,
            )
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(f.rebuild.requested_count(), 0);
    }

    #[test]
    fn test_process_all_keys_respects_scope() {
        let f = fixture(&[(1, "a b"), (2, "c")]);
        let context = AccessContext::new();
        let mut keys = Vec::new();
        f.engine
            .process_all_keys(&WORDS, &SearchScope::file(2), &context, &mut |k| {
                keys.push(k.clone());
                true
            })
            .unwrap();
        assert_eq!(keys, vec![key("c")]);
    }

    #[test]
    fn test_file_data() {
        let f = fixture(&[(4, "b c c")]);
        let context = AccessContext::new();
        let data = f.engine.get_file_data(&WORDS, 4, &context).unwrap();
        assert_eq!(data, InputData::from([(key("b"), 1), (key("c"), 2)]));
        assert!(f.core.modification_stamp() > 0);
    }
}
