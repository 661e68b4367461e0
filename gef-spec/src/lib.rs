//! GEF envelope schema and validation primitives.
//!
//! This crate defines the single ledger record type — the envelope — its
//! closed record-type vocabulary, and the schema checks applied both at
//! construction and at replay. It does not perform canonicalization,
//! signing, or hashing; those live in `gef-core` where the concrete crypto
//! and encoding dependencies are pulled in.
#![deny(missing_docs)]

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current protocol version. Must be uniform across a ledger.
pub const GEF_VERSION: &str = "1.0";

/// `causal_hash` of the first entry in a chain: 64 ASCII zero characters.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const NONCE_HEX_LENGTH: usize = 32;
const PUBLIC_KEY_HEX_LENGTH: usize = 64;
const HASH_HEX_LENGTH: usize = 64;

static TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{3}Z$").expect("static regex is valid")
});

/// The closed vocabulary of record types an envelope may carry.
///
/// Any value outside this set is rejected at creation and flagged as a
/// schema violation at replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordType {
    /// Ledger genesis marker.
    Genesis,
    /// An agent's public key being registered.
    AgentRegistration,
    /// A declared intent to perform an action.
    Intent,
    /// Execution of an action.
    Execution,
    /// Outcome of an execution.
    Result,
    /// A recorded failure.
    Failure,
    /// Delegation of authority between agents.
    Delegation,
    /// Liveness signal.
    Heartbeat,
    /// Invocation of a tool.
    ToolCall,
    /// Terminal marker for an agent or capability.
    Tombstone,
    /// Administrative action outside normal agent flow.
    AdminAction,
}

impl RecordType {
    const ALL: [RecordType; 11] = [
        RecordType::Genesis,
        RecordType::AgentRegistration,
        RecordType::Intent,
        RecordType::Execution,
        RecordType::Result,
        RecordType::Failure,
        RecordType::Delegation,
        RecordType::Heartbeat,
        RecordType::ToolCall,
        RecordType::Tombstone,
        RecordType::AdminAction,
    ];

    /// The wire representation of this record type.
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::Genesis => "genesis",
            RecordType::AgentRegistration => "agent_registration",
            RecordType::Intent => "intent",
            RecordType::Execution => "execution",
            RecordType::Result => "result",
            RecordType::Failure => "failure",
            RecordType::Delegation => "delegation",
            RecordType::Heartbeat => "heartbeat",
            RecordType::ToolCall => "tool_call",
            RecordType::Tombstone => "tombstone",
            RecordType::AdminAction => "admin_action",
        }
    }

    /// Parse a wire string into a record type, if it belongs to the closed
    /// vocabulary.
    pub fn parse(s: &str) -> Option<RecordType> {
        RecordType::ALL.into_iter().find(|rt| rt.as_str() == s)
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised validating inputs at envelope construction time.
///
/// These are the "invalid argument" family from the error handling design:
/// they are always a caller bug, never a runtime condition to route around.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// `record_type` was not a member of the closed vocabulary.
    #[error("unknown record type: {0}")]
    UnknownRecordType(String),
    /// `payload` was not a JSON object at the top level.
    #[error("payload must be a JSON object")]
    PayloadNotAMapping,
    /// `signer_public_key` was not exactly 64 valid hex characters.
    #[error("signer_public_key must be exactly 64 hex characters")]
    InvalidPublicKeyHex,
    /// `agent_id` was empty.
    #[error("agent_id must not be empty")]
    EmptyAgentId,
}

/// Result of validating an envelope's fields against the §3.1 constraints.
///
/// Returned, never raised or panicked — callers choose between treating it
/// as fatal (ledger restore, replay load) or as a soft report (CLI
/// inspection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaValidationResult {
    /// Whether every field satisfied its constraint.
    pub valid: bool,
    /// Human-readable descriptions of each violation found, if any.
    pub errors: Vec<String>,
}

impl SchemaValidationResult {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }
}

/// The single ledger record type.
///
/// Constructed unsigned via `gef_core::Ledger::emit`'s envelope builder,
/// signed exactly once, then treated as immutable. Mutating any field after
/// signing invalidates the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version; must be uniform across a ledger.
    pub gef_version: String,
    /// `"gef-" + UUIDv4`, unique per entry.
    pub record_id: String,
    /// Category, from the closed vocabulary in [`RecordType`].
    pub record_type: String,
    /// Logical actor this entry attributes to.
    pub agent_id: String,
    /// Raw Ed25519 public key, 64 lowercase hex characters.
    pub signer_public_key: String,
    /// Entry index within this ledger, starting at 0.
    pub sequence: u64,
    /// 128-bit per-entry uniqueness token, 32 lowercase hex characters.
    pub nonce: String,
    /// UTC timestamp, `YYYY-MM-DDTHH:MM:SS.mmmZ`.
    pub timestamp: String,
    /// SHA-256 hex of the canonical encoding of the previous entry's
    /// chaining surface; all-zero for the first entry.
    pub causal_hash: String,
    /// Application data. Must be a JSON object at the top level.
    pub payload: serde_json::Value,
    /// Ed25519 signature, base64url without padding. Absent until signed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
}

/// The subset of envelope fields used as the pre-image for signing, for
/// chaining, and (with `signature` appended) for on-disk serialization.
///
/// Signing and chaining are exposed as two named operations over an
/// identical field set — deliberately: one contract is "what is signed",
/// the other "what binds the chain", and both are separately tested even
/// though today they coincide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalSurface<'a> {
    gef_version: &'a str,
    record_id: &'a str,
    record_type: &'a str,
    agent_id: &'a str,
    signer_public_key: &'a str,
    sequence: u64,
    nonce: &'a str,
    timestamp: &'a str,
    causal_hash: &'a str,
    payload: &'a serde_json::Value,
}

impl Envelope {
    /// Validate the shape of a caller-supplied `record_type` / `payload` /
    /// `agent_id` / `signer_public_key` quadruple before constructing an
    /// envelope from them.
    ///
    /// This is the gate `gef-core`'s envelope builder calls before it is
    /// willing to stamp a `record_id`, `nonce`, and `timestamp`.
    pub fn validate_inputs(
        record_type: &str,
        agent_id: &str,
        signer_public_key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), SchemaError> {
        if RecordType::parse(record_type).is_none() {
            return Err(SchemaError::UnknownRecordType(record_type.to_string()));
        }
        if !payload.is_object() {
            return Err(SchemaError::PayloadNotAMapping);
        }
        if agent_id.is_empty() {
            return Err(SchemaError::EmptyAgentId);
        }
        if !is_hex_of_length(signer_public_key, PUBLIC_KEY_HEX_LENGTH) {
            return Err(SchemaError::InvalidPublicKeyHex);
        }
        Ok(())
    }

    /// The signing surface: every field except `signature`.
    pub fn signing_surface(&self) -> CanonicalSurface<'_> {
        self.chaining_surface()
    }

    /// The chaining surface: field-identical to the signing surface.
    pub fn chaining_surface(&self) -> CanonicalSurface<'_> {
        CanonicalSurface {
            gef_version: &self.gef_version,
            record_id: &self.record_id,
            record_type: &self.record_type,
            agent_id: &self.agent_id,
            signer_public_key: &self.signer_public_key,
            sequence: self.sequence,
            nonce: &self.nonce,
            timestamp: &self.timestamp,
            causal_hash: &self.causal_hash,
            payload: &self.payload,
        }
    }

    /// `true` once a signature has been attached.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// `self.sequence == expected`.
    pub fn verify_sequence(&self, expected: u64) -> bool {
        self.sequence == expected
    }

    /// Check every field against the §3.1 constraints plus the record-type
    /// vocabulary. Never panics; always returns a result the caller
    /// inspects.
    pub fn validate_schema(&self) -> SchemaValidationResult {
        let mut errors = Vec::new();

        if self.gef_version != GEF_VERSION {
            errors.push(format!(
                "gef_version must be '{GEF_VERSION}', got '{}'",
                self.gef_version
            ));
        }
        if !self.record_id.starts_with("gef-") {
            errors.push(format!(
                "record_id must start with 'gef-', got '{}'",
                self.record_id
            ));
        }
        if RecordType::parse(&self.record_type).is_none() {
            errors.push(format!("unknown record_type '{}'", self.record_type));
        }
        if self.agent_id.is_empty() {
            errors.push("agent_id must not be empty".to_string());
        }
        if !is_hex_of_length(&self.signer_public_key, PUBLIC_KEY_HEX_LENGTH) {
            errors.push("signer_public_key must be exactly 64 hex characters".to_string());
        }
        if !is_hex_of_length(&self.nonce, NONCE_HEX_LENGTH) {
            errors.push("nonce must be exactly 32 hex characters".to_string());
        }
        if !TIMESTAMP_RE.is_match(&self.timestamp) {
            errors.push(format!(
                "timestamp '{}' does not match YYYY-MM-DDTHH:MM:SS.mmmZ",
                self.timestamp
            ));
        }
        if !is_hex_of_length(&self.causal_hash, HASH_HEX_LENGTH) {
            errors.push("causal_hash must be exactly 64 hex characters".to_string());
        }
        if !self.payload.is_object() {
            errors.push("payload must be a JSON object".to_string());
        }

        if errors.is_empty() {
            SchemaValidationResult::ok()
        } else {
            SchemaValidationResult {
                valid: false,
                errors,
            }
        }
    }
}

fn is_hex_of_length(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Tally of record types seen across a ledger, keyed by wire string so an
/// unrecognized value (should never occur post-validation) still displays.
pub type RecordTypeCounts = BTreeMap<String, u64>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_envelope() -> Envelope {
        Envelope {
            gef_version: GEF_VERSION.to_string(),
            record_id: "gef-00000000-0000-4000-8000-000000000000".to_string(),
            record_type: RecordType::Execution.as_str().to_string(),
            agent_id: "agent-1".to_string(),
            signer_public_key: "a".repeat(64),
            sequence: 0,
            nonce: "b".repeat(32),
            timestamp: "2026-02-25T12:34:56.789Z".to_string(),
            causal_hash: GENESIS_HASH.to_string(),
            payload: json!({"step": 0}),
            signature: None,
        }
    }

    #[test]
    fn record_type_round_trips_through_wire_strings() {
        for rt in RecordType::ALL {
            assert_eq!(RecordType::parse(rt.as_str()), Some(rt));
        }
        assert_eq!(RecordType::parse("not_a_record_type"), None);
    }

    #[test]
    fn validate_schema_accepts_a_well_formed_envelope() {
        let env = sample_envelope();
        let result = env.validate_schema();
        assert!(result.valid, "errors: {:?}", result.errors);
    }

    #[test]
    fn validate_schema_flags_unknown_record_type() {
        let mut env = sample_envelope();
        env.record_type = "not_a_real_type".to_string();
        let result = env.validate_schema();
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("record_type")));
    }

    #[test]
    fn validate_schema_flags_malformed_timestamp() {
        let mut env = sample_envelope();
        env.timestamp = "2026-02-25 12:34:56".to_string();
        let result = env.validate_schema();
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("timestamp")));
    }

    #[test]
    fn validate_schema_flags_wrong_length_nonce() {
        let mut env = sample_envelope();
        env.nonce = "abc".to_string();
        let result = env.validate_schema();
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("nonce")));
    }

    #[test]
    fn validate_inputs_rejects_unknown_record_type() {
        let err =
            Envelope::validate_inputs("bogus", "agent-1", &"a".repeat(64), &json!({})).unwrap_err();
        assert_eq!(err, SchemaError::UnknownRecordType("bogus".to_string()));
    }

    #[test]
    fn validate_inputs_rejects_non_object_payload() {
        let err = Envelope::validate_inputs(
            "execution",
            "agent-1",
            &"a".repeat(64),
            &json!([1, 2, 3]),
        )
        .unwrap_err();
        assert_eq!(err, SchemaError::PayloadNotAMapping);
    }

    #[test]
    fn validate_inputs_rejects_malformed_public_key() {
        let err =
            Envelope::validate_inputs("execution", "agent-1", "too-short", &json!({})).unwrap_err();
        assert_eq!(err, SchemaError::InvalidPublicKeyHex);
    }

    #[test]
    fn signing_and_chaining_surfaces_are_field_identical() {
        let env = sample_envelope();
        let signing = serde_json::to_value(env.signing_surface()).unwrap();
        let chaining = serde_json::to_value(env.chaining_surface()).unwrap();
        assert_eq!(signing, chaining);
    }
}
