//! `FileBasedIndex`: startup and lifecycle of the whole engine
//!
//! Startup order:
//!
//! 1. wipe the index root if a previous run left the corruption marker;
//! 2. open every definition, owners before the indexes nested under them,
//!    wiping indexes whose version marker changed and retrying once an index
//!    whose storage fails to open;
//! 3. delete directories of indexes that were registered last time but are
//!    no longer supplied;
//! 4. freeze the registry and wire the updater into the query engine.

use crate::access::AccessContext;
use crate::config::EngineConfig;
use crate::error::IndexError;
use crate::error::RegistrationError;
use crate::error::Result;
use crate::index::AnyIndex;
use crate::index::extension::IndexDefinition;
use crate::index::extension::StorageSpec;
use crate::query::IndexRefresher;
use crate::query::QueryEngine;
use crate::rebuild::RebuildCoordinator;
use crate::registry::IndexRegistry;
use crate::registry::IndexRegistryBuilder;
use crate::updater::IndexUpdater;
use filedex_storage::CompositeVersion;
use filedex_storage::Compressor;
use filedex_storage::IndexLayout;
use filedex_storage::MarkerOutcome;
use filedex_storage::StorageError;
use filedex_storage::StorageRoot;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

const ROOT: &str = "<root>";

fn root_fault(source: StorageError) -> IndexError {
    IndexError::storage(ROOT, source)
}

pub struct FileBasedIndex {
    config: EngineConfig,
    root: Option<StorageRoot>,
    layouts: HashMap<&'static str, IndexLayout>,
    registry: Arc<IndexRegistry>,
    rebuild: Arc<RebuildCoordinator>,
    updater: Arc<IndexUpdater>,
    query: QueryEngine,
    shutdown: CancellationToken,
}

impl FileBasedIndex {
    pub fn open(config: EngineConfig, definitions: Vec<Box<dyn IndexDefinition>>) -> Result<Self> {
        config.validate()?;

        let root = if config.persistent {
            let root = StorageRoot::new(&config.index_root);
            match root.clear_if_marked().map_err(root_fault)? {
                MarkerOutcome::Absent => {}
                MarkerOutcome::Cleared => info!("Index root {:?} wiped after corruption", root.path()),
                MarkerOutcome::Kept => warn!("Index root {:?} is still marked corrupted", root.path()),
            }
            root.ensure_exists().map_err(root_fault)?;
            Some(root)
        } else {
            None
        };

        let spec = StorageSpec {
            root: root.as_ref(),
            compressor: Compressor::new(config.compression),
            buffering: config.buffering,
        };

        let mut builder = IndexRegistryBuilder::new();
        let mut layouts = HashMap::new();
        let mut supplied: Vec<&'static str> = Vec::with_capacity(definitions.len());
        let mut seen = HashSet::new();
        // An owner's version wipe deletes the markers nested under it.
        let mut ordered: Vec<&dyn IndexDefinition> =
            definitions.iter().map(|definition| &**definition).collect();
        ordered.sort_by_key(|definition| definition.owner().is_some());
        for definition in ordered {
            let name = definition.name();
            if !seen.insert(name) {
                let duplicate = RegistrationError::AlreadyRegistered(name.to_string());
                builder.record_problem(name, &duplicate.to_string());
                continue;
            }
            supplied.push(name);

            match open_definition(definition, &spec) {
                Ok((index, layout)) => {
                    builder.register(index)?;
                    if let Some(layout) = layout {
                        layouts.insert(name, layout);
                    }
                }
                Err(e) => builder.record_problem(name, &e.to_string()),
            }
        }

        if let Some(root) = &root {
            let dropped = root.drop_unregistered(supplied.as_slice()).map_err(root_fault)?;
            if !dropped.is_empty() {
                info!("Dropped storage of {} unregistered indexes: {:?}", dropped.len(), dropped);
            }
        }

        let registry = Arc::new(builder.freeze());
        let rebuild = Arc::new(RebuildCoordinator::new());
        let updater = Arc::new(IndexUpdater::new(
            Arc::clone(&registry),
            Arc::clone(&rebuild),
            config.fault_policy,
            config.foreign_file_cap,
        ));
        let query = QueryEngine::new(
            Arc::clone(&registry),
            Arc::clone(&rebuild),
            Arc::clone(&updater) as Arc<dyn IndexRefresher>,
            config.fault_policy,
        );
        info!(
            "Index engine started with {} indexes ({} problems)",
            registry.ids().len(),
            registry.initialization_problems().len()
        );

        Ok(Self {
            config,
            root,
            layouts,
            registry,
            rebuild,
            updater,
            query,
            shutdown: CancellationToken::new(),
        })
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub const fn query(&self) -> &QueryEngine {
        &self.query
    }

    pub fn updater(&self) -> &IndexUpdater {
        &self.updater
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    pub fn rebuild_coordinator(&self) -> &RebuildCoordinator {
        &self.rebuild
    }

    /// Fresh context for one thread of work, cancelled on shutdown.
    pub fn access_context(&self) -> AccessContext {
        AccessContext::with_cancellation(self.shutdown.child_token())
    }

    /// Definitions can only be supplied to [`FileBasedIndex::open`].
    pub fn register_extension(&self, definition: Box<dyn IndexDefinition>) -> Result<()> {
        let name = definition.name();
        warn!("Rejected late registration of index {}", name);
        Err(RegistrationError::FrozenRegistry(name.to_string()).into())
    }

    /// Clear every index waiting for a rebuild and reset its version marker.
    /// Returns the rebuilt index names. The cleared indexes report every
    /// file as not indexed until the host feeds their contents again.
    ///
    /// An index that fails to clear is requested again; the first such
    /// failure is returned after the remaining requests were processed.
    pub fn process_pending_rebuilds(&self) -> Result<Vec<String>> {
        if !self.rebuild.has_pending_requests() {
            return Ok(Vec::new());
        }
        let mut rebuilt = Vec::new();
        let mut first_error = None;
        for marker in self.rebuild.take_rebuild_requests() {
            if !self.rebuild.begin_rebuild(&marker.index) {
                continue;
            }
            let index = match self.registry.erased(&marker.index) {
                Ok(index) => index,
                Err(e) => {
                    self.rebuild.finish_rebuild(&marker.index);
                    warn!("Dropping rebuild of {}: {}", marker.index, e);
                    continue;
                }
            };

            info!("Rebuilding index {} ({})", marker.index, marker.cause);
            let reset = self.reset(index.as_ref());
            self.rebuild.finish_rebuild(&marker.index);
            match reset {
                Ok(()) => rebuilt.push(marker.index),
                Err(e) => {
                    warn!("Rebuild of index {} failed: {}", marker.index, e);
                    self.rebuild.request_rebuild(&marker.index, e.to_string());
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(rebuilt),
        }
    }

    fn reset(&self, index: &dyn AnyIndex) -> Result<()> {
        index.clear()?;
        if let Some(layout) = self.layouts.get(index.name()) {
            layout
                .rewrite_version(CompositeVersion::current(index.version()))
                .map_err(|e| IndexError::storage(index.name(), e))?;
        }
        Ok(())
    }

    /// Flush every dirty index. Keeps going past a failing index and
    /// returns the first failure.
    pub fn flush_all(&self) -> Result<()> {
        let mut first_error = None;
        for index in self.registry.iter() {
            if !index.is_dirty() {
                continue;
            }
            if let Err(e) = index.flush() {
                warn!("Failed to flush index {}: {}", index.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Sum of every index's modification stamp.
    pub fn modification_count(&self) -> u64 {
        self.registry
            .iter()
            .map(|index| index.modification_stamp())
            .fold(0, u64::wrapping_add)
    }

    /// Periodic flush hook. Flushes only when nothing was modified since the
    /// tick that returned `last_seen`; returns the value for the next tick.
    pub fn flush_if_idle(&self, last_seen: u64) -> Result<u64> {
        let current = self.modification_count();
        if current == last_seen {
            self.flush_all()?;
        } else {
            debug!("Indexes modified since last tick, postponing flush");
        }
        Ok(current)
    }

    /// Leave a marker so the next [`FileBasedIndex::open`] wipes the root.
    pub fn mark_caches_corrupted(&self) -> Result<()> {
        match &self.root {
            Some(root) => {
                info!("Marking index root {:?} as corrupted", root.path());
                root.mark_corrupted().map_err(root_fault)
            }
            None => Ok(()),
        }
    }

    /// Cancel outstanding work handed out through
    /// [`FileBasedIndex::access_context`] and flush everything.
    pub fn shutdown(&self) -> Result<()> {
        info!("Shutting down index engine");
        self.shutdown.cancel();
        self.flush_all()
    }
}

type Opened = (Arc<dyn AnyIndex>, Option<IndexLayout>);

fn open_definition(
    definition: &dyn IndexDefinition,
    spec: &StorageSpec<'_>,
) -> std::result::Result<Opened, StorageError> {
    let Some(root) = spec.root else {
        return Ok((definition.open(spec)?, None));
    };

    let name = definition.name();
    let layout = definition.layout(root);
    let version = CompositeVersion::current(definition.version());
    if layout.version_differs(version) {
        info!("Index {} changed version, discarding its data", name);
        layout.wipe()?;
        layout.rewrite_version(version)?;
    }

    let index = match definition.open(spec) {
        Ok(index) => index,
        Err(e) => {
            warn!("Failed to open index {}, wiping and retrying: {}", name, e);
            layout.wipe()?;
            layout.rewrite_version(version)?;
            definition.open(spec)?
        }
    };
    Ok((index, Some(layout)))
}
