//! Bincode value encoding. This wraps the bincode crate to always use
//! DefaultOptions, i.e. variable-length integers, rather than the fixed-length
//! options used by the top-level bincode::(de)serialize functions.

use bincode::Options as _;

use crate::error::Result;

/// Returns the shared Bincode options.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Deserializes a value using Bincode.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}

/// Serializes a value using Bincode.
pub fn serialize<T: serde::Serialize>(value: &T) -> Vec<u8> {
    // Panic on failure, as this is a problem with the data structure.
    bincode().serialize(value).expect("value must be serializable")
}
