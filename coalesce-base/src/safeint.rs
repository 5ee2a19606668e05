// All counters and indices in the system are 53-bit safe integers, so that
// any peer decoding them into an IEEE double sees exact values. Values
// arriving in a blob are checked at the decode boundary and rejected as
// malformed input, never wrapped.

use crate::{malformed, Result};

#[cfg(test)]
use test_log::test;

pub const MAX_SAFE_INT: u64 = (1 << 53) - 1;

/// Modulus for counter accumulation: (MAX_SAFE_INT - 1) / 2, so that the
/// sum or difference of two in-range values never leaves the safe range.
pub const COUNTER_MODULUS: u64 = (MAX_SAFE_INT - 1) / 2;

pub fn safe_u64(x: u64) -> Result<u64> {
    if x > MAX_SAFE_INT {
        return Err(malformed(format!(
            "integer {x} exceeds the 53-bit safe range"
        )));
    }
    Ok(x)
}

pub fn safe_len(x: usize) -> Result<u64> {
    safe_u64(x as u64)
}

pub fn safe_index(x: u64) -> Result<usize> {
    safe_u64(x)?;
    Ok(x as usize)
}

#[test]
fn test_safe_bounds() {
    assert_eq!(COUNTER_MODULUS, (1 << 52) - 1);
    assert!(safe_u64(MAX_SAFE_INT).is_ok());
    assert!(safe_u64(MAX_SAFE_INT + 1).is_err());
    assert_eq!(safe_len(7).unwrap(), 7);
}
