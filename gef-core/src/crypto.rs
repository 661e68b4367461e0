//! Ed25519 key management: generate, load, sign, and detached-verify.
//!
//! `verify_detached` is the one true verification entrypoint — it needs
//! only a hex-encoded public key, never a key manager instance, which is
//! exactly what `Envelope::verify_signature` has available.

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use thiserror::Error;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Failures loading or constructing an [`Ed25519KeyManager`].
#[derive(Debug, Error)]
pub enum KeyError {
    /// The file did not exist.
    #[error("key file not found: {0}")]
    NotFound(String),
    /// The file existed but could not be parsed as a 32-byte seed.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
    /// A seed of the wrong length was supplied.
    #[error("Ed25519 seed must be 32 bytes, got {0}")]
    WrongSeedLength(usize),
    /// Writing the key to disk failed.
    #[error("failed to save key: {0}")]
    Io(#[from] std::io::Error),
}

/// An Ed25519 signing key paired with its cached, hex-encoded public key.
pub struct Ed25519KeyManager {
    signing_key: SigningKey,
    public_key_hex: String,
}

impl Ed25519KeyManager {
    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key_hex = hex::encode(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            public_key_hex,
        }
    }

    /// Generate a new random Ed25519 key pair.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Load an Ed25519 key from a raw 32-byte seed.
    pub fn from_private_bytes(seed: &[u8]) -> Result<Self, KeyError> {
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| KeyError::WrongSeedLength(seed.len()))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    /// Load an Ed25519 private key seed from a hex-encoded file on disk.
    pub fn from_file(path: &std::path::Path) -> Result<Self, KeyError> {
        if !path.exists() {
            return Err(KeyError::NotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        let seed = hex::decode(contents.trim())
            .map_err(|e| KeyError::InvalidKeyMaterial(e.to_string()))?;
        Self::from_private_bytes(&seed)
    }

    /// 64-character lowercase hex encoding of the public key (32 bytes).
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// Sign `data`, returning a base64url string without padding.
    pub fn sign(&self, data: &[u8]) -> String {
        let signature = self.signing_key.sign(data);
        B64.encode(signature.to_bytes())
    }

    /// Verify `signature_b64` over `data` using this key manager's own
    /// public key, or `public_key_hex` if given as an override.
    pub fn verify(&self, data: &[u8], signature_b64: &str, public_key_hex: Option<&str>) -> bool {
        let key_hex = public_key_hex.unwrap_or(&self.public_key_hex);
        verify_detached(data, signature_b64, key_hex)
    }

    /// Write the raw 32-byte seed to `path`, hex-encoded.
    pub fn save(&self, path: &std::path::Path) -> Result<(), KeyError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(self.private_bytes_raw()))?;
        Ok(())
    }

    /// The raw 32-byte private key seed. Use only for secure backup.
    pub fn private_bytes_raw(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl std::fmt::Debug for Ed25519KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519KeyManager")
            .field("public_key_hex", &self.public_key_hex)
            .finish()
    }
}

/// Verify an Ed25519 signature using only a public key hex string.
///
/// Never panics: any malformed input (wrong key length, bad encoding, bad
/// signature length) returns `false`, never an error.
pub fn verify_detached(data: &[u8], signature_b64: &str, public_key_hex: &str) -> bool {
    let Some(raw_pub) = hex_to_32(public_key_hex) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&raw_pub) else {
        return false;
    };
    let Some(raw_sig) = decode_signature(signature_b64) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&raw_sig);
    verifying_key.verify(data, &signature).is_ok()
}

fn hex_to_32(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

fn decode_signature(signature_b64: &str) -> Option<[u8; 64]> {
    let raw = B64.decode(signature_b64).ok()?;
    raw.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_detached_round_trips() {
        let key = Ed25519KeyManager::generate();
        let sig = key.sign(b"hello world");
        assert!(verify_detached(b"hello world", &sig, key.public_key_hex()));
    }

    #[test]
    fn verify_detached_rejects_wrong_key() {
        let key = Ed25519KeyManager::generate();
        let other = Ed25519KeyManager::generate();
        let sig = key.sign(b"hello world");
        assert!(!verify_detached(b"hello world", &sig, other.public_key_hex()));
    }

    #[test]
    fn verify_detached_rejects_tampered_data() {
        let key = Ed25519KeyManager::generate();
        let sig = key.sign(b"hello world");
        assert!(!verify_detached(b"goodbye world", &sig, key.public_key_hex()));
    }

    #[test]
    fn verify_detached_never_panics_on_garbage_input() {
        assert!(!verify_detached(b"data", "not-base64!!", "short"));
        assert!(!verify_detached(b"data", "", &"a".repeat(64)));
    }

    #[test]
    fn from_private_bytes_rejects_wrong_length_seed() {
        let err = Ed25519KeyManager::from_private_bytes(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, KeyError::WrongSeedLength(16)));
    }

    #[test]
    fn public_key_hex_is_64_lowercase_hex_chars() {
        let key = Ed25519KeyManager::generate();
        let hex_str = key.public_key_hex();
        assert_eq!(hex_str.len(), 64);
        assert!(hex_str.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }
}
