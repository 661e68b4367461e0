//! Envelope construction, signing, and verification.
//!
//! `gef_spec::Envelope` owns the data model and the schema checks that
//! don't need a concrete crypto stack. Everything here closes the loop:
//! building a fresh envelope from a predecessor, signing it, and verifying
//! both its signature and its place in the chain.

use gef_spec::{Envelope, SchemaError, GENESIS_HASH};
use rand_core::{OsRng, RngCore};
use uuid::Uuid;

use crate::canonical::{canonical, canonical_hash};
use crate::crypto::{verify_detached, Ed25519KeyManager};
use crate::time::gef_timestamp;

/// Build a fresh, unsigned envelope.
///
/// Validates `record_type`, `payload`, `agent_id`, and `signer_public_key`
/// up front (see `gef_spec::Envelope::validate_inputs`), then stamps a new
/// `record_id`, a random `nonce`, the current timestamp, and the
/// `causal_hash` derived from `prev`'s chaining surface.
pub fn create(
    record_type: &str,
    agent_id: &str,
    signer_public_key: &str,
    sequence: u64,
    payload: serde_json::Value,
    prev: Option<&Envelope>,
) -> Result<Envelope, SchemaError> {
    Envelope::validate_inputs(record_type, agent_id, signer_public_key, &payload)?;

    Ok(Envelope {
        gef_version: gef_spec::GEF_VERSION.to_string(),
        record_id: format!("gef-{}", Uuid::new_v4()),
        record_type: record_type.to_string(),
        agent_id: agent_id.to_string(),
        signer_public_key: signer_public_key.to_string(),
        sequence,
        nonce: random_nonce_hex(),
        timestamp: gef_timestamp(),
        causal_hash: causal_hash_from(prev),
        payload,
        signature: None,
    })
}

fn random_nonce_hex() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The `causal_hash` a new entry following `prev` must carry:
/// `GENESIS_HASH` if there is no predecessor, else the SHA-256 hex of the
/// canonical encoding of `prev`'s chaining surface.
pub fn causal_hash_from(prev: Option<&Envelope>) -> String {
    match prev {
        None => GENESIS_HASH.to_string(),
        Some(prev) => canonical_hash(&prev.chaining_surface()),
    }
}

/// Sign `envelope` in place with `key`, computing the canonical signing
/// bytes and storing the result as a base64url signature. Re-signing
/// silently replaces any prior signature.
pub fn sign(envelope: &mut Envelope, key: &Ed25519KeyManager) {
    let bytes = canonical(&envelope.signing_surface());
    envelope.signature = Some(key.sign(&bytes));
}

/// Verify `envelope`'s signature, optionally against a public key other
/// than its own `signer_public_key`. Returns `false` for an absent
/// signature or any verification failure; never panics.
pub fn verify_signature(envelope: &Envelope, override_public_key: Option<&str>) -> bool {
    let Some(signature) = envelope.signature.as_deref() else {
        return false;
    };
    let bytes = canonical(&envelope.signing_surface());
    let key_hex = override_public_key.unwrap_or(&envelope.signer_public_key);
    verify_detached(&bytes, signature, key_hex)
}

/// The `causal_hash` `envelope` is expected to carry, given `prev`.
pub fn expected_causal_hash_from(prev: Option<&Envelope>) -> String {
    causal_hash_from(prev)
}

/// Whether `envelope.causal_hash` matches the hash expected from `prev`.
pub fn verify_chain(envelope: &Envelope, prev: Option<&Envelope>) -> bool {
    envelope.causal_hash == expected_causal_hash_from(prev)
}

/// Compute the signing-surface canonical bytes for `envelope` directly.
/// Exposed for cross-implementation reproducibility checks (§8.2 S6) and
/// for the verification API, which needs the raw bytes alongside the
/// boolean verdict.
pub fn canonical_bytes_for_signing(envelope: &Envelope) -> Vec<u8> {
    canonical(&envelope.signing_surface())
}

/// The SHA-256 hex commitment to the entire ledger: the hash a
/// hypothetical next entry would use as its `causal_hash`. Must always be
/// computed over the unfiltered ledger.
pub fn head_hash(last_envelope: Option<&Envelope>) -> String {
    causal_hash_from(last_envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key() -> Ed25519KeyManager {
        Ed25519KeyManager::generate()
    }

    #[test]
    fn create_then_sign_produces_a_verifiable_envelope() {
        let key = key();
        let mut env = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            0,
            json!({"step": 0}),
            None,
        )
        .unwrap();
        sign(&mut env, &key);
        assert!(env.is_signed());
        assert!(verify_signature(&env, None));
    }

    #[test]
    fn genesis_entry_has_all_zero_causal_hash() {
        let key = key();
        let env = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            0,
            json!({}),
            None,
        )
        .unwrap();
        assert_eq!(env.causal_hash, GENESIS_HASH);
    }

    #[test]
    fn chain_continuation_matches_canonical_hash_of_predecessor() {
        let key = key();
        let mut prev = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            0,
            json!({"step": 0}),
            None,
        )
        .unwrap();
        sign(&mut prev, &key);

        let curr = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            1,
            json!({"step": 1}),
            Some(&prev),
        )
        .unwrap();
        assert!(verify_chain(&curr, Some(&prev)));
        assert_eq!(curr.causal_hash, canonical_hash(&prev.chaining_surface()));
    }

    #[test]
    fn mutating_prev_signature_does_not_break_chain_link() {
        let key = key();
        let mut prev = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            0,
            json!({}),
            None,
        )
        .unwrap();
        sign(&mut prev, &key);
        let curr = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            1,
            json!({}),
            Some(&prev),
        )
        .unwrap();
        assert!(verify_chain(&curr, Some(&prev)));

        prev.signature = Some("tampered-signature-value".to_string());
        assert!(verify_chain(&curr, Some(&prev)));
    }

    #[test]
    fn mutating_prev_payload_breaks_chain_link() {
        let key = key();
        let mut prev = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            0,
            json!({"step": 0}),
            None,
        )
        .unwrap();
        sign(&mut prev, &key);
        let curr = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            1,
            json!({}),
            Some(&prev),
        )
        .unwrap();
        assert!(verify_chain(&curr, Some(&prev)));

        prev.payload = json!({"step": 99});
        assert!(!verify_chain(&curr, Some(&prev)));
    }

    #[test]
    fn any_single_field_mutation_invalidates_the_signature() {
        let key = key();
        let mut env = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            0,
            json!({"step": 0}),
            None,
        )
        .unwrap();
        sign(&mut env, &key);
        assert!(verify_signature(&env, None));

        let mut tampered = env.clone();
        tampered.payload = json!({"step": 1});
        assert!(!verify_signature(&tampered, None));

        let mut tampered = env.clone();
        tampered.agent_id = "someone-else".to_string();
        assert!(!verify_signature(&tampered, None));

        let mut tampered = env.clone();
        tampered.sequence = 1;
        assert!(!verify_signature(&tampered, None));

        let mut tampered = env.clone();
        tampered.nonce = "0".repeat(32);
        assert!(!verify_signature(&tampered, None));

        env.signature = None;
        assert!(!verify_signature(&env, None));
    }

    #[test]
    fn verify_signature_rejects_wrong_key() {
        let key = key();
        let other = key();
        let mut env = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            0,
            json!({}),
            None,
        )
        .unwrap();
        sign(&mut env, &key);
        assert!(!verify_signature(&env, Some(other.public_key_hex())));
    }

    #[test]
    fn unsigned_envelope_never_verifies() {
        let key = key();
        let env = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            0,
            json!({}),
            None,
        )
        .unwrap();
        assert!(!verify_signature(&env, None));
    }

    #[test]
    fn one_hundred_envelopes_have_distinct_nonces() {
        let key = key();
        let nonces: std::collections::HashSet<String> = (0..100)
            .map(|_| {
                create(
                    "execution",
                    "agent-1",
                    key.public_key_hex(),
                    0,
                    json!({}),
                    None,
                )
                .unwrap()
                .nonce
            })
            .collect();
        assert_eq!(nonces.len(), 100);
    }

    #[test]
    fn canonical_signing_bytes_are_deterministic() {
        let key = key();
        let mut env = create(
            "execution",
            "agent-1",
            key.public_key_hex(),
            0,
            json!({"step": 0}),
            None,
        )
        .unwrap();
        sign(&mut env, &key);
        assert_eq!(
            canonical_bytes_for_signing(&env),
            canonical_bytes_for_signing(&env)
        );
    }
}
