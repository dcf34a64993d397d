//! Index registry: a builder during startup, an immutable lookup afterwards
//!
//! Registration happens on [`IndexRegistryBuilder`]; [`IndexRegistryBuilder::freeze`]
//! consumes it and yields the [`IndexRegistry`] every query path uses. A frozen
//! registry has no way to add indexes.

use crate::error::IndexError;
use crate::error::RegistrationError;
use crate::error::Result;
use crate::file::FileType;
use crate::id::IndexId;
use crate::index::AnyIndex;
use crate::index::IndexCore;
use crate::index::IndexKey;
use crate::index::IndexValue;
use crate::input_filter::InputFilter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Default)]
pub struct IndexRegistryBuilder {
    order: Vec<&'static str>,
    indexes: HashMap<&'static str, Arc<dyn AnyIndex>>,
    by_type: HashMap<FileType, Vec<&'static str>>,
    catch_all: Vec<&'static str>,
    problems: Vec<(String, String)>,
}

impl IndexRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an index. A duplicate name is rejected, recorded as an
    /// initialization problem and left out of the frozen registry.
    pub fn register(&mut self, index: Arc<dyn AnyIndex>) -> std::result::Result<(), RegistrationError> {
        let name = index.name();
        if self.indexes.contains_key(name) {
            let error = RegistrationError::AlreadyRegistered(name.to_string());
            self.record_problem(name, &error.to_string());
            return Err(error);
        }

        match index.input_filter().file_types() {
            Some(types) => {
                for file_type in types {
                    let bucket = self.by_type.entry(file_type.clone()).or_default();
                    if !bucket.contains(&name) {
                        bucket.push(name);
                    }
                }
            }
            None => self.catch_all.push(name),
        }
        self.order.push(name);
        self.indexes.insert(name, index);
        Ok(())
    }

    /// Record that `name` could not be set up; it stays unregistered.
    pub fn record_problem(&mut self, name: &str, problem: &str) {
        warn!("Index {} failed to initialize: {}", name, problem);
        self.problems.push((name.to_string(), problem.to_string()));
    }

    pub fn freeze(self) -> IndexRegistry {
        let mut by_type = HashMap::with_capacity(self.by_type.len());
        for (file_type, names) in self.by_type {
            let mut applicable: Vec<&'static str> = self
                .order
                .iter()
                .copied()
                .filter(|name| names.contains(name) || self.catch_all.contains(name))
                .collect();
            applicable.dedup();
            by_type.insert(file_type, applicable);
        }

        IndexRegistry {
            order: self.order,
            indexes: self.indexes,
            by_type,
            catch_all: self.catch_all,
            problems: self.problems,
        }
    }
}

/// Immutable set of registered indexes.
pub struct IndexRegistry {
    order: Vec<&'static str>,
    indexes: HashMap<&'static str, Arc<dyn AnyIndex>>,
    by_type: HashMap<FileType, Vec<&'static str>>,
    catch_all: Vec<&'static str>,
    problems: Vec<(String, String)>,
}

impl IndexRegistry {
    /// Typed handle to a registered index.
    pub fn index<K: IndexKey, V: IndexValue>(
        &self,
        id: &IndexId<K, V>,
    ) -> Result<Arc<IndexCore<K, V>>> {
        let erased = self.erased(id.name())?;
        Arc::clone(erased)
            .into_any()
            .downcast::<IndexCore<K, V>>()
            .map_err(|_| RegistrationError::TypeMismatch(id.name().to_string()).into())
    }

    pub fn erased(&self, name: &str) -> Result<&Arc<dyn AnyIndex>> {
        self.indexes
            .get(name)
            .ok_or_else(|| IndexError::UnknownIndex(name.to_string()))
    }

    pub fn input_filter(&self, name: &str) -> Result<&dyn InputFilter> {
        Ok(self.erased(name)?.input_filter())
    }

    pub fn version(&self, name: &str) -> Result<u32> {
        Ok(self.erased(name)?.version())
    }

    /// Indexes to run on files of `file_type`: those declaring the type,
    /// together with those declaring no types, in registration order.
    pub fn applicable_indexes(&self, file_type: &FileType) -> &[&'static str] {
        self.by_type
            .get(file_type)
            .map_or(self.catch_all.as_slice(), Vec::as_slice)
    }

    /// Registered names in registration order.
    pub fn ids(&self) -> &[&'static str] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn AnyIndex>> + '_ {
        self.order.iter().filter_map(|name| self.indexes.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indexes.contains_key(name)
    }

    /// `(index name, problem)` for every definition left out at startup.
    pub fn initialization_problems(&self) -> &[(String, String)] {
        &self.problems
    }
}
