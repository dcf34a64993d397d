//! File-backed index storage
//!
//! The persisted state of an index is loaded whole on open and written back
//! whole on flush, each file through the framed record format:
//!
//! ```text
//! <name>.storage   generation │ one record per key:  key │ n │ (value │ m │ file_id*m)*n
//! <name>_inputs    generation │ one record per file: file_id │ n │ (key │ value)*n
//! ```
//!
//! Both files lead with the flush generation that wrote them. The two are
//! replaced one after the other, so a load that finds different generations
//! (or only one of the files) reports the index as corrupt.
//!
//! While buffering is enabled, writes land in an in-memory overlay that
//! shadows the persisted state and is never flushed; dropping the overlay
//! restores the persisted view.

use crate::IndexStorage;
use crate::codec::DataExternalizer;
use crate::codec::KeyDescriptor;
use crate::compression::Compressor;
use crate::container::FileId;
use crate::container::InputData;
use crate::container::ValueContainer;
use crate::error::Result;
use crate::error::StorageError;
use crate::layout::IndexLayout;
use crate::record::RecordReader;
use crate::record::RecordWriter;
use std::collections::HashMap;
use std::fs;
use std::hash::Hash;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Writes shadowed by buffering mode. `None` in `forward` records a removal.
struct Overlay<K, V> {
    inverted: HashMap<K, ValueContainer<V>>,
    forward: HashMap<FileId, Option<InputData<K, V>>>,
}

impl<K, V> Default for Overlay<K, V> {
    fn default() -> Self {
        Self {
            inverted: HashMap::new(),
            forward: HashMap::new(),
        }
    }
}

pub struct PersistentIndexStorage<K, V> {
    layout: IndexLayout,
    keys: Arc<dyn KeyDescriptor<K>>,
    values: Arc<dyn DataExternalizer<V>>,
    compressor: Compressor,
    inverted: HashMap<K, ValueContainer<V>>,
    forward: HashMap<FileId, InputData<K, V>>,
    overlay: Option<Overlay<K, V>>,
    generation: u64,
    dirty: bool,
}

impl<K, V> PersistentIndexStorage<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: PartialEq + Clone + Send + Sync,
{
    /// Load the index files described by `layout`. Missing files mean an
    /// empty index; anything unreadable is a storage fault.
    pub fn open(
        layout: IndexLayout,
        keys: Arc<dyn KeyDescriptor<K>>,
        values: Arc<dyn DataExternalizer<V>>,
        compressor: Compressor,
    ) -> Result<Self> {
        fs::create_dir_all(layout.dir())?;
        let mut storage = Self {
            layout,
            keys,
            values,
            compressor,
            inverted: HashMap::new(),
            forward: HashMap::new(),
            overlay: None,
            generation: 0,
            dirty: false,
        };
        storage.load()?;
        debug!(
            "Opened index storage {} with {} keys and {} files",
            storage.layout.name(),
            storage.inverted.len(),
            storage.forward.len()
        );
        Ok(storage)
    }

    pub const fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    fn load(&mut self) -> Result<()> {
        let storage = self.read_records(&self.layout.storage_file())?;
        let inputs = self.read_records(&self.layout.inputs_file())?;
        self.generation = match (&storage, &inputs) {
            (None, None) => return Ok(()),
            (Some((stored, _)), Some((forward, _))) if stored == forward => *stored,
            _ => {
                return Err(StorageError::CorruptData(format!(
                    "index {} files are from different flushes ({:?} vs {:?})",
                    self.layout.name(),
                    storage.as_ref().map(|(generation, _)| *generation),
                    inputs.as_ref().map(|(generation, _)| *generation),
                )));
            }
        };

        if let Some((_, records)) = storage {
            for record in records {
                let mut input = record.as_slice();
                let key = self.keys.read(&mut input)?;
                let container = self.read_container(&mut input)?;
                ensure_consumed(input)?;
                if !container.is_empty() {
                    self.inverted.insert(key, container);
                }
            }
        }

        if let Some((_, records)) = inputs {
            for record in records {
                let mut input = record.as_slice();
                let file_id = take_u32(&mut input)?;
                let count = take_u32(&mut input)?;
                let mut data = InputData::with_capacity((count as usize).min(input.len()));
                for _ in 0..count {
                    let key = self.keys.read(&mut input)?;
                    let value = self.values.read(&mut input)?;
                    if data.insert(key, value).is_some() {
                        return Err(StorageError::CorruptData(format!(
                            "file {file_id} lists a key twice"
                        )));
                    }
                }
                ensure_consumed(input)?;
                self.forward.insert(file_id, data);
            }
        }
        Ok(())
    }

    /// Records of one file with its leading generation split off.
    fn read_records(&self, path: &Path) -> Result<Option<(u64, Vec<Vec<u8>>)>> {
        let Some(reader) = RecordReader::open(path, self.compressor)? else {
            return Ok(None);
        };
        let mut records = reader.read_all()?.into_iter();
        let generation = records
            .next()
            .and_then(|record| <[u8; 8]>::try_from(record.as_slice()).ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| StorageError::CorruptData(format!("{path:?} has no generation record")))?;
        Ok(Some((generation, records.collect())))
    }

    /// Flush generation of the persisted files, 0 before the first flush.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    fn read_container(&self, input: &mut &[u8]) -> Result<ValueContainer<V>> {
        let mut container = ValueContainer::new();
        let value_count = take_u32(input)?;
        for _ in 0..value_count {
            let value = self.values.read(input)?;
            let file_count = take_u32(input)?;
            for _ in 0..file_count {
                container.add_value(take_u32(input)?, value.clone());
            }
        }
        Ok(container)
    }

    fn write_container(&self, out: &mut Vec<u8>, container: &ValueContainer<V>) -> Result<()> {
        put_len(out, container.value_count())?;
        for (value, files) in container.iter() {
            self.values.save(out, value)?;
            put_len(out, files.len())?;
            for file in files {
                out.extend_from_slice(&file.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Container for `key` as the overlay sees it, copied up from the
    /// persisted state on first touch.
    fn overlay_container(&mut self, key: &K) -> Option<&mut ValueContainer<V>> {
        let overlay = self.overlay.as_mut()?;
        let container = overlay
            .inverted
            .entry(key.clone())
            .or_insert_with(|| self.inverted.get(key).cloned().unwrap_or_default());
        Some(container)
    }
}

impl<K, V> IndexStorage<K, V> for PersistentIndexStorage<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: PartialEq + Clone + Send + Sync,
{
    fn read(&self, key: &K) -> Result<ValueContainer<V>> {
        if let Some(overlay) = &self.overlay
            && let Some(container) = overlay.inverted.get(key)
        {
            return Ok(container.clone());
        }
        Ok(self.inverted.get(key).cloned().unwrap_or_default())
    }

    fn add_value(&mut self, key: &K, file_id: FileId, value: V) -> Result<()> {
        if let Some(container) = self.overlay_container(key) {
            container.add_value(file_id, value);
            return Ok(());
        }
        self.inverted
            .entry(key.clone())
            .or_default()
            .add_value(file_id, value);
        self.dirty = true;
        Ok(())
    }

    fn remove_all_values(&mut self, key: &K, file_id: FileId) -> Result<()> {
        if let Some(container) = self.overlay_container(key) {
            container.remove_file(file_id);
            return Ok(());
        }
        if let Some(container) = self.inverted.get_mut(key)
            && container.remove_file(file_id)
        {
            if container.is_empty() {
                self.inverted.remove(key);
            }
            self.dirty = true;
        }
        Ok(())
    }

    fn process_keys(&self, processor: &mut dyn FnMut(&K) -> bool) -> Result<bool> {
        if let Some(overlay) = &self.overlay {
            for (key, container) in &overlay.inverted {
                if !container.is_empty() && !processor(key) {
                    return Ok(false);
                }
            }
            for key in self.inverted.keys() {
                if !overlay.inverted.contains_key(key) && !processor(key) {
                    return Ok(false);
                }
            }
            return Ok(true);
        }

        for key in self.inverted.keys() {
            if !processor(key) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn read_inputs(&self, file_id: FileId) -> Result<Option<InputData<K, V>>> {
        if let Some(overlay) = &self.overlay
            && let Some(shadowed) = overlay.forward.get(&file_id)
        {
            return Ok(shadowed.clone());
        }
        Ok(self.forward.get(&file_id).cloned())
    }

    fn write_inputs(&mut self, file_id: FileId, data: Option<InputData<K, V>>) -> Result<()> {
        let data = data.filter(|data| !data.is_empty());
        if let Some(overlay) = self.overlay.as_mut() {
            overlay.forward.insert(file_id, data);
            return Ok(());
        }
        match data {
            Some(data) => {
                self.forward.insert(file_id, data);
            }
            None => {
                self.forward.remove(&file_id);
            }
        }
        self.dirty = true;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.inverted.clear();
        self.forward.clear();
        if let Some(overlay) = self.overlay.as_mut() {
            *overlay = Overlay::default();
        }
        remove_if_exists(&self.layout.storage_file())?;
        remove_if_exists(&self.layout.inputs_file())?;
        self.generation = 0;
        self.dirty = false;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let generation = self.generation.wrapping_add(1);
        let mut storage = RecordWriter::new(self.compressor);
        storage.push(&generation.to_le_bytes())?;
        let mut record = Vec::new();
        for (key, container) in &self.inverted {
            record.clear();
            self.keys.save(&mut record, key)?;
            self.write_container(&mut record, container)?;
            storage.push(&record)?;
        }

        let mut inputs = RecordWriter::new(self.compressor);
        inputs.push(&generation.to_le_bytes())?;
        for (file_id, data) in &self.forward {
            record.clear();
            record.extend_from_slice(&file_id.to_le_bytes());
            put_len(&mut record, data.len())?;
            for (key, value) in data {
                self.keys.save(&mut record, key)?;
                self.values.save(&mut record, value)?;
            }
            inputs.push(&record)?;
        }

        debug!(
            "Flushing index {} generation {}: {} keys, {} files",
            self.layout.name(),
            generation,
            storage.record_count() - 1,
            inputs.record_count() - 1
        );
        storage.commit(&self.layout.storage_file())?;
        inputs.commit(&self.layout.inputs_file())?;
        self.generation = generation;
        self.dirty = false;
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn set_buffering(&mut self, enabled: bool) {
        match (enabled, self.overlay.is_some()) {
            (true, false) => self.overlay = Some(Overlay::default()),
            (false, true) => self.overlay = None,
            _ => {}
        }
    }

    fn clear_memory_buffer(&mut self) {
        if let Some(overlay) = self.overlay.as_mut() {
            *overlay = Overlay::default();
        }
    }
}

fn put_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| StorageError::InvalidArgument(format!("length {len} exceeds u32")))?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn take_u32(input: &mut &[u8]) -> Result<u32> {
    let Some((head, rest)) = input.split_first_chunk::<4>() else {
        return Err(StorageError::CorruptData(format!(
            "expected 4 bytes, {} left in record",
            input.len()
        )));
    };
    *input = rest;
    Ok(u32::from_le_bytes(*head))
}

fn ensure_consumed(input: &[u8]) -> Result<()> {
    if input.is_empty() {
        Ok(())
    } else {
        Err(StorageError::CorruptData(format!(
            "{} trailing bytes in record",
            input.len()
        )))
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
