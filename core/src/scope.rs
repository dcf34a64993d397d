//! Query scopes and the foreign-file admission policy
//!
//! An [`IdFilter`] is a bitset over the closed range `[min, max]` of the file
//! ids it was built from, so membership is one shift and one mask no matter
//! how many files a project holds. [`SearchScope`] wraps it with the special
//! cases queries care about: everything, nothing, and exactly one file (which
//! enables the forward-index fast path).

use crate::file::FileContent;
use crate::file::ProjectId;
use filedex_storage::FileId;
use std::fmt;
use tracing::debug;

const SHIFT: u32 = 6;
const MASK: u32 = (1 << SHIFT) - 1;

/// Set of file ids stored as 64-bit words offset by the smallest id.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IdFilter {
    min: FileId,
    max: FileId,
    words: Vec<u64>,
    len: usize,
}

impl IdFilter {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, id: FileId) -> bool {
        if self.len == 0 || id < self.min || id > self.max {
            return false;
        }
        let offset = id - self.min;
        let word = (offset >> SHIFT) as usize;
        self.words[word] & (1u64 << (offset & MASK)) != 0
    }

    /// Ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = FileId> + '_ {
        self.words.iter().enumerate().flat_map(move |(index, &word)| {
            let base = self.min + ((index as u32) << SHIFT);
            (0..64u32)
                .filter(move |bit| word & (1u64 << bit) != 0)
                .map(move |bit| base + bit)
        })
    }
}

impl FromIterator<FileId> for IdFilter {
    fn from_iter<I: IntoIterator<Item = FileId>>(iter: I) -> Self {
        let ids: Vec<FileId> = iter.into_iter().collect();
        let (Some(&min), Some(&max)) = (ids.iter().min(), ids.iter().max()) else {
            return Self::empty();
        };

        let span = (max - min) as usize + 1;
        let mut words = vec![0u64; span.div_ceil(64)];
        let mut len = 0;
        for id in ids {
            let offset = id - min;
            let word = &mut words[(offset >> SHIFT) as usize];
            let bit = 1u64 << (offset & MASK);
            if *word & bit == 0 {
                *word |= bit;
                len += 1;
            }
        }
        Self {
            min,
            max,
            words,
            len,
        }
    }
}

impl fmt::Debug for IdFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ScopeKind {
    Everything,
    Empty,
    File(FileId),
    Files(IdFilter),
    Project(ProjectId, IdFilter),
}

/// Which files may appear in a query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchScope {
    kind: ScopeKind,
}

impl SearchScope {
    pub const fn everything() -> Self {
        Self {
            kind: ScopeKind::Everything,
        }
    }

    pub const fn empty() -> Self {
        Self {
            kind: ScopeKind::Empty,
        }
    }

    pub const fn file(id: FileId) -> Self {
        Self {
            kind: ScopeKind::File(id),
        }
    }

    pub fn files(filter: IdFilter) -> Self {
        Self {
            kind: ScopeKind::Files(filter),
        }
    }

    /// Files of one project. `files` is the project's containment filter.
    pub fn project(project: ProjectId, files: IdFilter) -> Self {
        Self {
            kind: ScopeKind::Project(project, files),
        }
    }

    pub fn contains(&self, id: FileId) -> bool {
        match &self.kind {
            ScopeKind::Everything => true,
            ScopeKind::Empty => false,
            ScopeKind::File(file) => *file == id,
            ScopeKind::Files(filter) | ScopeKind::Project(_, filter) => filter.contains(id),
        }
    }

    /// The one file this scope denotes, if it denotes exactly one.
    pub fn single_file(&self) -> Option<FileId> {
        match &self.kind {
            ScopeKind::File(file) => Some(*file),
            ScopeKind::Files(filter) | ScopeKind::Project(_, filter) if filter.len() == 1 => {
                filter.iter().next()
            }
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.kind {
            ScopeKind::Empty => true,
            ScopeKind::Files(filter) | ScopeKind::Project(_, filter) => filter.is_empty(),
            ScopeKind::Everything | ScopeKind::File(_) => false,
        }
    }

    pub fn is_everything(&self) -> bool {
        matches!(self.kind, ScopeKind::Everything)
    }

    pub fn project_id(&self) -> Option<&ProjectId> {
        match &self.kind {
            ScopeKind::Project(project, _) => Some(project),
            _ => None,
        }
    }
}

/// What a refresh request asks of the indexes.
#[derive(Debug, Clone)]
pub enum RefreshKind {
    Update(FileContent),
    Delete,
}

/// One changed file waiting to be reindexed.
#[derive(Debug, Clone)]
pub struct RefreshRequest {
    pub file: FileId,
    pub project: Option<ProjectId>,
    pub kind: RefreshKind,
}

impl RefreshRequest {
    pub fn update(content: FileContent) -> Self {
        Self {
            file: content.id,
            project: content.project.clone(),
            kind: RefreshKind::Update(content),
        }
    }

    pub const fn delete(file: FileId, project: Option<ProjectId>) -> Self {
        Self {
            file,
            project,
            kind: RefreshKind::Delete,
        }
    }

    pub const fn is_delete(&self) -> bool {
        matches!(self.kind, RefreshKind::Delete)
    }
}

/// Admits at most `cap` files of other projects into one refresh batch.
/// Deletions and files without a known project are always admitted.
#[derive(Debug)]
pub struct ForeignFilePolicy {
    own_project: Option<ProjectId>,
    cap: usize,
    admitted: usize,
}

impl ForeignFilePolicy {
    pub const fn new(own_project: Option<ProjectId>, cap: usize) -> Self {
        Self {
            own_project,
            cap,
            admitted: 0,
        }
    }

    pub fn admit(&mut self, request: &RefreshRequest) -> bool {
        if request.is_delete() {
            return true;
        }
        let (Some(own), Some(project)) = (&self.own_project, &request.project) else {
            return true;
        };
        if own == project {
            return true;
        }
        if self.admitted < self.cap {
            self.admitted += 1;
            return true;
        }
        debug!(
            "Rejecting foreign file {} of project {} (cap {} reached)",
            request.file, project, self.cap
        );
        false
    }

    pub const fn admitted_foreign(&self) -> usize {
        self.admitted
    }
}
