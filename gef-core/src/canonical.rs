//! RFC 8785 JSON Canonicalization Scheme (JCS) over serde-serializable
//! values, and the SHA-256 hash of that canonical form.
//!
//! This is the only sanctioned bytes-from-structure path in the crate.
//! Every signature and every chain hash is computed over the output of
//! [`canonical`]. Do not reach for `serde_json::to_vec` for anything that
//! ends up signed or hashed — key ordering and number formatting are not
//! guaranteed there the way they are here.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize `value` as RFC 8785 canonical JSON bytes.
///
/// # Panics
///
/// Panics if `value` cannot be serialized to JSON at all (not if it
/// contains non-canonicalizable types — `serde_json_canonicalizer` handles
/// the full JSON value space). Every caller in this crate serializes
/// well-formed envelope surfaces, so this should never happen in practice.
pub fn canonical<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json_canonicalizer::to_vec(value).expect("canonical encoding of a well-formed envelope surface")
}

/// SHA-256 hex digest of the canonical encoding of `value`.
pub fn canonical_hash<T: Serialize>(value: &T) -> String {
    let bytes = canonical(value);
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_bytes_are_independent_of_key_insertion_order() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical(&a), canonical(&b));
    }

    #[test]
    fn canonical_bytes_are_deterministic_across_calls() {
        let v = json!({"nested": {"z": 1, "a": [1, 2, 3]}, "s": "hello"});
        assert_eq!(canonical(&v), canonical(&v));
    }

    #[test]
    fn canonical_hash_is_sha256_hex_of_canonical_bytes() {
        let v = json!({"x": 1});
        let expected = hex::encode(Sha256::digest(canonical(&v)));
        assert_eq!(canonical_hash(&v), expected);
    }
}
