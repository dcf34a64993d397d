//! Index definitions supplied by the embedding application

use crate::file::FileContent;
use crate::id::IndexId;
use crate::index::AnyIndex;
use crate::index::IndexCore;
use crate::index::IndexKey;
use crate::index::IndexValue;
use crate::index::state::FileStateTable;
use crate::input_filter::AcceptAll;
use crate::input_filter::InputFilter;
use filedex_storage::BincodeExternalizer;
use filedex_storage::Compressor;
use filedex_storage::DataExternalizer;
use filedex_storage::IndexLayout;
use filedex_storage::IndexStorage;
use filedex_storage::InputData;
use filedex_storage::KeyDescriptor;
use filedex_storage::MemoryIndexStorage;
use filedex_storage::PersistentIndexStorage;
use filedex_storage::StorageError;
use filedex_storage::StorageRoot;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub type IndexerError = Box<dyn std::error::Error + Send + Sync>;

/// Computes one file's key/value contribution to an index.
pub trait DataIndexer<K, V>: Send + Sync {
    fn map(&self, content: &FileContent) -> Result<InputData<K, V>, IndexerError>;
}

impl<K, V, F> DataIndexer<K, V> for F
where
    F: Fn(&FileContent) -> Result<InputData<K, V>, IndexerError> + Send + Sync,
{
    fn map(&self, content: &FileContent) -> Result<InputData<K, V>, IndexerError> {
        self(content)
    }
}

/// Where and how an index keeps its data.
#[derive(Debug, Clone, Copy)]
pub struct StorageSpec<'a> {
    /// `None` keeps the index in memory only
    pub root: Option<&'a StorageRoot>,
    pub compressor: Compressor,
    pub buffering: bool,
}

/// Type-erased index definition, as the engine consumes it at startup.
pub trait IndexDefinition: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> u32;

    /// Index whose directory hosts this index's version marker.
    fn owner(&self) -> Option<&'static str>;

    fn layout(&self, root: &StorageRoot) -> IndexLayout {
        match self.owner() {
            Some(owner) => root.index_layout_owned_by(self.name(), owner),
            None => root.index_layout(self.name()),
        }
    }

    fn open(&self, spec: &StorageSpec<'_>) -> Result<Arc<dyn AnyIndex>, StorageError>;
}

/// Typed index definition. Keys and values default to bincode externalizers
/// and the input filter to [`AcceptAll`].
pub struct IndexExtension<K, V> {
    id: IndexId<K, V>,
    version: u32,
    indexer: Arc<dyn DataIndexer<K, V>>,
    keys: Arc<dyn KeyDescriptor<K>>,
    values: Arc<dyn DataExternalizer<V>>,
    input_filter: Arc<dyn InputFilter>,
    owner: Option<&'static str>,
}

impl<K, V> IndexExtension<K, V>
where
    K: IndexKey + Serialize + DeserializeOwned,
    V: IndexValue + Serialize + DeserializeOwned,
{
    pub fn new(id: IndexId<K, V>, version: u32, indexer: impl DataIndexer<K, V> + 'static) -> Self {
        Self {
            id,
            version,
            indexer: Arc::new(indexer),
            keys: Arc::new(BincodeExternalizer::<K>::new()),
            values: Arc::new(BincodeExternalizer::<V>::new()),
            input_filter: Arc::new(AcceptAll),
            owner: None,
        }
    }
}

impl<K: IndexKey, V: IndexValue> IndexExtension<K, V> {
    #[must_use]
    pub fn with_key_descriptor(mut self, keys: impl KeyDescriptor<K> + 'static) -> Self {
        self.keys = Arc::new(keys);
        self
    }

    #[must_use]
    pub fn with_value_externalizer(mut self, values: impl DataExternalizer<V> + 'static) -> Self {
        self.values = Arc::new(values);
        self
    }

    #[must_use]
    pub fn with_input_filter(mut self, filter: impl InputFilter + 'static) -> Self {
        self.input_filter = Arc::new(filter);
        self
    }

    /// Nest this index's version marker under `owner`'s directory.
    #[must_use]
    pub fn owned_by(mut self, owner: &'static str) -> Self {
        self.owner = Some(owner);
        self
    }

    pub const fn id(&self) -> IndexId<K, V> {
        self.id
    }

    pub fn boxed(self) -> Box<dyn IndexDefinition> {
        Box::new(self)
    }
}

impl<K: IndexKey, V: IndexValue> IndexDefinition for IndexExtension<K, V> {
    fn name(&self) -> &'static str {
        self.id.name()
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn owner(&self) -> Option<&'static str> {
        self.owner
    }

    fn open(&self, spec: &StorageSpec<'_>) -> Result<Arc<dyn AnyIndex>, StorageError> {
        let (mut storage, states): (Box<dyn IndexStorage<K, V>>, FileStateTable) = match spec.root
        {
            Some(root) => {
                let layout = self.layout(root);
                let states = FileStateTable::open(layout.stamps_file(), spec.compressor)?;
                let storage = PersistentIndexStorage::open(
                    layout,
                    Arc::clone(&self.keys),
                    Arc::clone(&self.values),
                    spec.compressor,
                )?;
                (Box::new(storage), states)
            }
            None => (
                Box::new(MemoryIndexStorage::new()),
                FileStateTable::in_memory(),
            ),
        };
        storage.set_buffering(spec.buffering);
        states.set_buffering(spec.buffering);

        let core = IndexCore::new(
            self.id.name(),
            self.version,
            storage,
            states,
            Arc::clone(&self.indexer),
            Arc::clone(&self.input_filter),
        );
        Ok(Arc::new(core))
    }
}
