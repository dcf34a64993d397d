//! Heap-only index storage

use crate::IndexStorage;
use crate::container::FileId;
use crate::container::InputData;
use crate::container::ValueContainer;
use crate::error::Result;
use std::collections::HashMap;
use std::hash::Hash;

/// Index storage that never touches the disk. Used for non-persistent
/// engines and tests; it is never dirty and buffering is a no-op.
#[derive(Debug)]
pub struct MemoryIndexStorage<K, V> {
    inverted: HashMap<K, ValueContainer<V>>,
    forward: HashMap<FileId, InputData<K, V>>,
}

impl<K, V> Default for MemoryIndexStorage<K, V> {
    fn default() -> Self {
        Self {
            inverted: HashMap::new(),
            forward: HashMap::new(),
        }
    }
}

impl<K, V> MemoryIndexStorage<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_count(&self) -> usize {
        self.inverted.len()
    }
}

impl<K, V> IndexStorage<K, V> for MemoryIndexStorage<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: PartialEq + Clone + Send + Sync,
{
    fn read(&self, key: &K) -> Result<ValueContainer<V>> {
        Ok(self.inverted.get(key).cloned().unwrap_or_default())
    }

    fn add_value(&mut self, key: &K, file_id: FileId, value: V) -> Result<()> {
        self.inverted
            .entry(key.clone())
            .or_default()
            .add_value(file_id, value);
        Ok(())
    }

    fn remove_all_values(&mut self, key: &K, file_id: FileId) -> Result<()> {
        if let Some(container) = self.inverted.get_mut(key)
            && container.remove_file(file_id)
            && container.is_empty()
        {
            self.inverted.remove(key);
        }
        Ok(())
    }

    fn process_keys(&self, processor: &mut dyn FnMut(&K) -> bool) -> Result<bool> {
        for key in self.inverted.keys() {
            if !processor(key) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn read_inputs(&self, file_id: FileId) -> Result<Option<InputData<K, V>>> {
        Ok(self.forward.get(&file_id).cloned())
    }

    fn write_inputs(&mut self, file_id: FileId, data: Option<InputData<K, V>>) -> Result<()> {
        match data {
            Some(data) if !data.is_empty() => {
                self.forward.insert(file_id, data);
            }
            _ => {
                self.forward.remove(&file_id);
            }
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.inverted.clear();
        self.forward.clear();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        false
    }

    fn set_buffering(&mut self, _enabled: bool) {}

    fn clear_memory_buffer(&mut self) {}
}
