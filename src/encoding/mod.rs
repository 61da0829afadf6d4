//! Value encodings for data stored by transactions.
//!
//! The scheduler and multi-version store treat keys and values as opaque
//! byte strings. Transactions typically store structured values, which are
//! encoded with Bincode via the Value trait.

pub mod bincode;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Adds automatic Bincode encode/decode methods to value types.
pub trait Value: Serialize + DeserializeOwned {
    /// Decodes a value from a byte slice using Bincode.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Encodes a value to a byte vector using Bincode.
    fn encode(&self) -> Vec<u8> {
        bincode::serialize(self)
    }

    /// Decodes an optional value, e.g. as returned by a key lookup.
    fn maybe_decode(bytes: Option<Vec<u8>>) -> Result<Option<Self>> {
        bytes.map(|b| Self::decode(&b)).transpose()
    }
}

impl Value for u64 {}
impl Value for i64 {}
impl Value for String {}
impl<V: Value> Value for Option<V> {}
impl<V: Value> Value for Vec<V> {}
impl<V1: Value, V2: Value> Value for (V1, V2) {}
