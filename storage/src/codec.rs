//! Pluggable (de)serialization of index keys and values

use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Writes values of `T` into a byte buffer and reads them back.
///
/// `read` consumes exactly the bytes `save` produced and advances `input`
/// past them, so several values can be laid out back to back in one record.
pub trait DataExternalizer<T>: Send + Sync {
    fn save(&self, out: &mut Vec<u8>, value: &T) -> Result<()>;

    fn read(&self, input: &mut &[u8]) -> Result<T>;
}

/// Externalizer for index keys. Key identity comes from `Eq + Hash` on the
/// key type itself.
pub trait KeyDescriptor<K: Eq + Hash>: DataExternalizer<K> {}

impl<K: Eq + Hash, D: DataExternalizer<K>> KeyDescriptor<K> for D {}

/// Externalizer for any serde type, using bincode's standard configuration.
pub struct BincodeExternalizer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeExternalizer<T> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeExternalizer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeExternalizer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BincodeExternalizer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BincodeExternalizer")
    }
}

impl<T> DataExternalizer<T> for BincodeExternalizer<T>
where
    T: Serialize + DeserializeOwned,
{
    fn save(&self, out: &mut Vec<u8>, value: &T) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
        out.extend_from_slice(&bytes);
        Ok(())
    }

    fn read(&self, input: &mut &[u8]) -> Result<T> {
        let (value, used) =
            bincode::serde::decode_from_slice::<T, _>(input, bincode::config::standard())?;
        *input = &input[used..];
        Ok(value)
    }
}
