//! The verification API: thin, stateless wrappers over `envelope` and
//! `replay` for callers that want a single-question answer rather than a
//! full replay session.

use std::path::Path;

use gef_spec::Envelope;
use serde::Serialize;

use crate::envelope;
use crate::replay::{Replay, ReplayError, ReplaySummary};

/// The verdict for a single envelope, independent of its place in a chain.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    /// `true` iff the signature is present and verifies.
    pub signature_valid: bool,
    /// `record_id` this verdict pertains to, for correlating with logs.
    pub record_id: String,
}

/// Verify one envelope's signature in isolation — no chain context.
pub fn verify_envelope(env: &Envelope) -> VerificationResult {
    VerificationResult {
        signature_valid: envelope::verify_signature(env, None),
        record_id: env.record_id.clone(),
    }
}

/// Parse `json` as an [`Envelope`] and verify its signature. Returns
/// `Ok(None)` signature-valid=false rather than an error when the JSON is
/// well-formed but fails schema validation, matching
/// [`gef_spec::Envelope::validate_schema`]'s report-don't-raise contract.
pub fn verify_envelope_from_json(json: &serde_json::Value) -> Result<VerificationResult, serde_json::Error> {
    let env: Envelope = serde_json::from_value(json.clone())?;
    if !env.validate_schema().valid {
        return Ok(VerificationResult {
            signature_valid: false,
            record_id: env.record_id,
        });
    }
    Ok(verify_envelope(&env))
}

/// Verify that `curr` correctly follows `prev` in the chain: its
/// `causal_hash` matches and its `sequence` is exactly one past `prev`'s
/// (or zero, if `prev` is `None`).
pub fn verify_chain_link(curr: &Envelope, prev: Option<&Envelope>) -> bool {
    let expected_sequence = prev.map(|p| p.sequence + 1).unwrap_or(0);
    curr.verify_sequence(expected_sequence) && envelope::verify_chain(curr, prev)
}

/// Load and fully verify the ledger file at `path`, returning the same
/// [`ReplaySummary`] the CLI's `verify` subcommand builds. `parallel`
/// enables the Phase 2 worker-pool path for large ledgers.
pub fn verify_ledger_file(path: &Path, parallel: bool) -> Result<ReplaySummary, ReplayError> {
    let mut replay = Replay::new(parallel, true);
    replay.load(path)?;
    Ok(replay.verify())
}
