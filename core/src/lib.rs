//! Incremental file-content indexing engine
//!
//! Applications register index definitions (an indexer mapping one file's
//! content to key/value pairs plus the types it applies to), feed file
//! changes to the updater and query the resulting inverted indexes:
//!
//! ```text
//!  host ──file changes──▶ IndexUpdater ──diffs──▶ IndexCore (per index)
//!                              ▲                      │
//!                              │ refresh(scope)       │ read lock
//!  host ──queries──────▶ QueryEngine ◀────────────────┘
//!                              │ storage faults
//!                              ▼
//!                      RebuildCoordinator
//! ```
//!
//! [`FileBasedIndex`] wires the pieces together at startup and owns the
//! persistent index root.

pub mod access;
pub mod config;
pub mod engine;
pub mod error;
pub mod file;
pub mod id;
pub mod index;
pub mod input_filter;
pub mod query;
pub mod rebuild;
pub mod registry;
pub mod scope;
pub mod updater;

#[cfg(test)]
mod tests;

pub use access::AccessContext;
pub use access::AccessKind;
pub use access::ResultCache;
pub use config::EngineConfig;
pub use config::FaultPolicy;
pub use engine::FileBasedIndex;
pub use error::IndexError;
pub use error::RegistrationError;
pub use error::Result;
pub use file::ContentStamp;
pub use file::FileContent;
pub use file::FileSnapshot;
pub use file::FileType;
pub use file::ProjectId;
pub use id::IndexId;
pub use index::AnyIndex;
pub use index::IndexCore;
pub use index::diff::InputDataDiff;
pub use index::extension::DataIndexer;
pub use index::extension::IndexDefinition;
pub use index::extension::IndexExtension;
pub use index::extension::IndexerError;
pub use index::state::FileIndexingState;
pub use input_filter::AcceptAll;
pub use input_filter::FileTypeFilter;
pub use input_filter::InputFilter;
pub use input_filter::PredicateFilter;
pub use query::IndexRefresher;
pub use query::QueryEngine;
pub use rebuild::FaultClass;
pub use rebuild::RebuildCoordinator;
pub use rebuild::RebuildStatus;
pub use rebuild::classify_fault;
pub use registry::IndexRegistry;
pub use registry::IndexRegistryBuilder;
pub use scope::IdFilter;
pub use scope::RefreshRequest;
pub use scope::SearchScope;
pub use updater::ChangedFilesCollector;
pub use updater::IndexUpdater;

pub use filedex_storage::CompressionLevel;
pub use filedex_storage::FileId;
pub use filedex_storage::InputData;
pub use filedex_storage::ValueContainer;
