use crate::file::FileContent;
use crate::file::FileType;
use crate::file::ProjectId;

/// Decides which files an index looks at.
pub trait InputFilter: Send + Sync {
    fn accept(&self, file: &FileContent, project: Option<&ProjectId>) -> bool;

    /// The concrete file types this filter can accept, when it knows them.
    /// Declaring them lets the registry skip the index for other types.
    fn file_types(&self) -> Option<&[FileType]> {
        None
    }
}

/// Accepts every file.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl InputFilter for AcceptAll {
    fn accept(&self, _file: &FileContent, _project: Option<&ProjectId>) -> bool {
        true
    }
}

/// Accepts files of the listed types.
#[derive(Debug, Clone)]
pub struct FileTypeFilter {
    types: Vec<FileType>,
}

impl FileTypeFilter {
    pub fn new(types: impl IntoIterator<Item = FileType>) -> Self {
        Self {
            types: types.into_iter().collect(),
        }
    }
}

impl InputFilter for FileTypeFilter {
    fn accept(&self, file: &FileContent, _project: Option<&ProjectId>) -> bool {
        self.types.contains(&file.file_type)
    }

    fn file_types(&self) -> Option<&[FileType]> {
        Some(&self.types)
    }
}

/// Filter backed by a closure; declares no file types.
pub struct PredicateFilter<F>(pub F);

impl<F> InputFilter for PredicateFilter<F>
where
    F: Fn(&FileContent, Option<&ProjectId>) -> bool + Send + Sync,
{
    fn accept(&self, file: &FileContent, project: Option<&ProjectId>) -> bool {
        (self.0)(file, project)
    }
}
