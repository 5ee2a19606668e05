use coalesce_base::{malformed, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Encode any serde value as field-named MessagePack. Named fields cost a
/// little space but let old readers skip fields they don't know.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    match rmp_serde::to_vec_named(value) {
        Ok(bytes) => Ok(bytes),
        Err(e) => Err(malformed(format!("encode failed: {e}"))),
    }
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    match rmp_serde::from_slice(bytes) {
        Ok(value) => Ok(value),
        Err(e) => Err(malformed(format!("decode failed: {e}"))),
    }
}
