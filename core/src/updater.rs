//! Update path: pending file changes and the refresher that applies them
//!
//! Hosts report changes to the [`ChangedFilesCollector`]. Queries pull them
//! through [`IndexUpdater`] (as their [`IndexRefresher`]) for the scope they
//! are about to read; each batch goes through the foreign-file policy, and
//! files it holds back stay queued for a later refresh.

use crate::access::AccessContext;
use crate::config::FaultPolicy;
use crate::error::IndexError;
use crate::error::Result;
use crate::file::FileContent;
use crate::file::ProjectId;
use crate::index::state::FileIndexingState;
use crate::query::IndexRefresher;
use crate::rebuild::FaultClass;
use crate::rebuild::RebuildCoordinator;
use crate::rebuild::classify_fault;
use crate::registry::IndexRegistry;
use crate::scope::ForeignFilePolicy;
use crate::scope::RefreshKind;
use crate::scope::RefreshRequest;
use crate::scope::SearchScope;
use filedex_storage::FileId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use tracing::debug;
use tracing::warn;

/// Pending refresh requests, at most one per file; a newer request for a
/// file replaces the older one.
#[derive(Debug, Default)]
pub struct ChangedFilesCollector {
    pending: Mutex<BTreeMap<FileId, RefreshRequest>>,
}

impl ChangedFilesCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<FileId, RefreshRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule(&self, request: RefreshRequest) {
        self.lock().insert(request.file, request);
    }

    pub fn file_changed(&self, content: FileContent) {
        self.schedule(RefreshRequest::update(content));
    }

    pub fn file_deleted(&self, file: FileId, project: Option<ProjectId>) {
        self.schedule(RefreshRequest::delete(file, project));
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, file: FileId) -> bool {
        self.lock().contains_key(&file)
    }

    /// Remove and return the requests for files in `scope`, ascending by file.
    pub fn drain_for(&self, scope: &SearchScope) -> Vec<RefreshRequest> {
        let mut pending = self.lock();
        if scope.is_everything() {
            return std::mem::take(&mut *pending).into_values().collect();
        }
        let files: Vec<FileId> = pending
            .keys()
            .copied()
            .filter(|&file| scope.contains(file))
            .collect();
        files
            .into_iter()
            .filter_map(|file| pending.remove(&file))
            .collect()
    }

    /// Put back requests that were drained but not processed, unless a newer
    /// request for the same file arrived meanwhile.
    pub fn requeue(&self, requests: impl IntoIterator<Item = RefreshRequest>) {
        let mut pending = self.lock();
        for request in requests {
            pending.entry(request.file).or_insert(request);
        }
    }

    fn take(&self, file: FileId) -> Option<RefreshRequest> {
        self.lock().remove(&file)
    }
}

pub struct IndexUpdater {
    registry: Arc<IndexRegistry>,
    rebuild: Arc<RebuildCoordinator>,
    changes: ChangedFilesCollector,
    policy: FaultPolicy,
    foreign_file_cap: usize,
    applied: AtomicU64,
}

impl IndexUpdater {
    pub fn new(
        registry: Arc<IndexRegistry>,
        rebuild: Arc<RebuildCoordinator>,
        policy: FaultPolicy,
        foreign_file_cap: usize,
    ) -> Self {
        Self {
            registry,
            rebuild,
            changes: ChangedFilesCollector::new(),
            policy,
            foreign_file_cap,
            applied: AtomicU64::new(0),
        }
    }

    pub const fn changes(&self) -> &ChangedFilesCollector {
        &self.changes
    }

    /// Requests processed since startup.
    pub fn updates_applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    /// Index `content` now, bypassing the pending queue.
    pub fn index_file_content(&self, content: &FileContent) -> Result<()> {
        self.changes.take(content.id);
        self.run_batch(vec![RefreshRequest::update(content.clone())], None)
    }

    /// Drop `file` from every index now.
    pub fn remove_file(&self, file: FileId) -> Result<()> {
        let project = self.changes.take(file).and_then(|request| request.project);
        self.run_batch(vec![RefreshRequest::delete(file, project)], None)
    }

    fn run_batch(&self, requests: Vec<RefreshRequest>, context: Option<&AccessContext>) -> Result<()> {
        let mut indexer_error = None;
        let mut remaining = requests.into_iter();
        while let Some(request) = remaining.next() {
            if let Some(context) = context
                && context.is_cancelled()
            {
                self.changes.requeue(std::iter::once(request).chain(remaining));
                return Err(IndexError::Cancelled);
            }
            if let Err(error) = self.apply(&request, &mut indexer_error) {
                warn!("Update of file {} aborted: {}", request.file, error);
                self.changes.requeue(std::iter::once(request).chain(remaining));
                return Err(error);
            }
            self.applied.fetch_add(1, Ordering::AcqRel);
        }
        match indexer_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn apply(&self, request: &RefreshRequest, indexer_error: &mut Option<IndexError>) -> Result<()> {
        match &request.kind {
            RefreshKind::Update(content) => {
                let snapshot = content.snapshot();
                for &name in self.registry.applicable_indexes(&content.file_type) {
                    if self.rebuild.requires_rebuild(name) {
                        continue;
                    }
                    let index = self.registry.erased(name)?;
                    if index.indexing_state(&snapshot) == FileIndexingState::UpToDate {
                        continue;
                    }
                    if let Err(error) = index.index_file(content) {
                        self.handle_fault(name, error, indexer_error)?;
                    }
                }
            }
            RefreshKind::Delete => {
                for index in self.registry.iter() {
                    if self.rebuild.requires_rebuild(index.name()) {
                        continue;
                    }
                    if let Err(error) = index.remove_file(request.file) {
                        self.handle_fault(index.name(), error, indexer_error)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_fault(
        &self,
        index: &str,
        error: IndexError,
        indexer_error: &mut Option<IndexError>,
    ) -> Result<()> {
        match classify_fault(&error, &self.policy) {
            FaultClass::Rebuild => {
                warn!("Storage fault while updating index {}: {}", index, error);
                self.rebuild.request_rebuild(index, error.to_string());
                Ok(())
            }
            FaultClass::IndexerError => {
                warn!("{}", error);
                indexer_error.get_or_insert(error);
                Ok(())
            }
            FaultClass::Cancelled | FaultClass::Unrelated => Err(error),
        }
    }
}

impl IndexRefresher for IndexUpdater {
    fn refresh(&self, index: &str, scope: &SearchScope, context: &AccessContext) -> Result<()> {
        let drained = self.changes.drain_for(scope);
        if drained.is_empty() {
            return Ok(());
        }

        let mut policy = ForeignFilePolicy::new(scope.project_id().cloned(), self.foreign_file_cap);
        let (admitted, deferred): (Vec<_>, Vec<_>) =
            drained.into_iter().partition(|request| policy.admit(request));
        debug!(
            "Refreshing {} files for index {} ({} deferred)",
            admitted.len(),
            index,
            deferred.len()
        );
        self.changes.requeue(deferred);
        self.run_batch(admitted, Some(context))
    }
}
