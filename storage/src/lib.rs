//! Versioned on-disk storage for filedex indexes
//!
//! This crate owns everything an index persists: the directory layout under
//! the index root, the framed record files, the key/value externalizers and
//! the `IndexStorage` implementations that hold one index's inverted
//! (key → value → files) and forward (file → key → value) data.
//!
//! # Layout
//!
//! ```text
//! <index root>/
//! ├── corruption.marker        (present only when caches are known bad)
//! ├── registered               (names of the indexes registered last run)
//! └── <index name>/
//!     ├── <index name>.ver     (composite version marker)
//!     ├── <index name>.storage (inverted index records)
//!     ├── <index name>_inputs  (forward index records)
//!     └── <index name>.stamps  (per-file indexing stamps)
//! ```

pub mod codec;
pub mod compression;
pub mod container;
pub mod error;
pub mod layout;
pub mod memory;
pub mod persistent;
pub mod record;

#[cfg(test)]
mod tests;

pub use codec::BincodeExternalizer;
pub use codec::DataExternalizer;
pub use codec::KeyDescriptor;
pub use compression::CompressionLevel;
pub use compression::Compressor;
pub use container::FileId;
pub use container::InputData;
pub use container::ValueContainer;
pub use error::FaultKind;
pub use error::Result;
pub use error::StorageError;
pub use layout::CompositeVersion;
pub use layout::IndexLayout;
pub use layout::MarkerOutcome;
pub use layout::StorageRoot;
pub use memory::MemoryIndexStorage;
pub use persistent::PersistentIndexStorage;

/// Magic bytes at the start of every filedex record file
pub const FDIX_MAGIC: &[u8] = b"FDIX";

/// Current record format version. Mixed into every index's composite version,
/// so bumping it discards all persisted indexes.
pub const FORMAT_VERSION: u16 = 2;

/// Storage for one index: inverted data keyed by index key, forward data
/// keyed by file.
///
/// Implementations are not internally synchronized; the owning index wraps
/// them in a read/write lock so readers only ever get `&self` and the single
/// writer gets `&mut self`.
pub trait IndexStorage<K, V>: Send + Sync {
    /// Values and the files that produced them for `key`.
    fn read(&self, key: &K) -> Result<ValueContainer<V>>;

    /// Associate `value` with `file_id` under `key`.
    fn add_value(&mut self, key: &K, file_id: FileId, value: V) -> Result<()>;

    /// Drop every value `file_id` contributed under `key`.
    fn remove_all_values(&mut self, key: &K, file_id: FileId) -> Result<()>;

    /// Visit every key that has at least one value. Returns `false` when the
    /// processor asked to stop.
    fn process_keys(&self, processor: &mut dyn FnMut(&K) -> bool) -> Result<bool>;

    /// Forward-index entry for one file, `None` when the file never
    /// contributed anything.
    fn read_inputs(&self, file_id: FileId) -> Result<Option<InputData<K, V>>>;

    /// Replace (or remove, with `None`) the forward-index entry for a file.
    fn write_inputs(&mut self, file_id: FileId, data: Option<InputData<K, V>>) -> Result<()>;

    /// Discard all data, persisted and buffered.
    fn clear(&mut self) -> Result<()>;

    /// Persist buffered state.
    fn flush(&mut self) -> Result<()>;

    /// Whether there is state not yet persisted.
    fn is_dirty(&self) -> bool;

    /// Route subsequent writes into the in-memory overlay (or stop doing so).
    fn set_buffering(&mut self, enabled: bool);

    /// Drop the in-memory overlay without touching persisted data.
    fn clear_memory_buffer(&mut self);
}
