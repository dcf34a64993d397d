use filedex_storage::FileId;
use filedex_storage::InputData;
use std::hash::Hash;

/// Change of one file's contribution between two indexing runs. A key whose
/// value changed appears in both halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDataDiff<K, V> {
    pub file: FileId,
    pub removed: Vec<K>,
    pub added: Vec<(K, V)>,
}

impl<K, V> InputDataDiff<K, V>
where
    K: Eq + Hash + Clone,
    V: PartialEq + Clone,
{
    pub fn compute(file: FileId, old: &InputData<K, V>, new: &InputData<K, V>) -> Self {
        let removed = old
            .iter()
            .filter(|(key, value)| new.get(*key) != Some(*value))
            .map(|(key, _)| key.clone())
            .collect();
        let added = new
            .iter()
            .filter(|(key, value)| old.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Self {
            file,
            removed,
            added,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }

    /// Forward-index entry after the diff is applied to `old`.
    pub fn apply_to(&self, mut old: InputData<K, V>) -> InputData<K, V> {
        for key in &self.removed {
            old.remove(key);
        }
        for (key, value) in &self.added {
            old.insert(key.clone(), value.clone());
        }
        old
    }
}
