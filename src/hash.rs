//! Deterministic 32-bit identifier hashing.

/// Multiplier of the 65599 polynomial hash.
const HASH_CONSTANT: u32 = 65599;

/// Hash a name to a stable 32-bit identifier.
///
/// Both sides of a connection compute the same service and method IDs
/// from names alone, so no name strings ever travel on the wire. The
/// hash runs over UTF-16 code units with the unit count as the seed,
/// which keeps the value identical across host languages regardless of
/// their native string representation.
pub fn hash(name: &str) -> u32 {
    let mut value = name.encode_utf16().count() as u32;
    let mut coefficient = HASH_CONSTANT;
    for unit in name.encode_utf16() {
        value = value.wrapping_add(coefficient.wrapping_mul(u32::from(unit)));
        coefficient = coefficient.wrapping_mul(HASH_CONSTANT);
    }
    value
}
