//! The replay engine: load a ledger file, then verify it in two phases.
//!
//! Phase 1 (sequence, chain, nonce uniqueness) is inherently sequential —
//! entry *i*'s expected `causal_hash` depends on entry *i-1*. Phase 2
//! (signature verification) is embarrassingly parallel: each signature is
//! independent of every other. Below a size threshold the parallel path
//! isn't worth its own overhead, so it stays sequential; above it, and
//! only if the worker pool can actually be built and run, batches go to a
//! `rayon` thread pool sized `min(cpu_count, 8)`.

use std::collections::{BTreeMap, HashSet};
use std::io::BufRead;
use std::path::{Path, PathBuf};

use gef_spec::{Envelope, RecordTypeCounts, GEF_VERSION};
use thiserror::Error;
use tracing::{debug, info_span};

use crate::envelope;

const PARALLEL_THRESHOLD: usize = 2_000;
const BATCH_SIZE_PER_WORKER_MULTIPLIER: usize = 4;
const MAX_WORKERS: usize = 8;

/// Failures that abort loading a ledger file outright — these are the
/// "fatal" path of the error design: a replay that can't even establish a
/// well-formed envelope list must not silently produce a partial summary.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The ledger file could not be opened.
    #[error("failed to open ledger file {path}: {source}")]
    Open {
        /// Path that failed to open.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A line was not valid JSON.
    #[error("malformed JSON at line {line}: {source}")]
    MalformedJson {
        /// 1-indexed line number.
        line: usize,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// A line parsed as JSON but failed schema validation.
    #[error("schema violation at line {line} (record_id={record_id}): {errors:?}")]
    SchemaViolation {
        /// 1-indexed line number.
        line: usize,
        /// `record_id` of the offending envelope.
        record_id: String,
        /// The field-level errors reported by `validate_schema`.
        errors: Vec<String>,
    },
    /// More than one distinct `gef_version` was found across the ledger.
    #[error("ledger contains mixed gef_version values: {0:?}")]
    VersionMismatch(Vec<String>),
}

/// One defect discovered during [`Replay::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainViolation {
    /// The `sequence` this violation pertains to.
    pub at_sequence: u64,
    /// `record_id` of the offending envelope.
    pub record_id: String,
    /// Which of the four violation categories this is.
    pub violation_type: ViolationType,
    /// Human-readable detail.
    pub detail: String,
}

/// The closed set of defects a replay can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationType {
    /// `causal_hash` did not match the predecessor's chaining surface.
    ChainBreak,
    /// `sequence` did not match its position in the ledger.
    SequenceGap,
    /// Ed25519 verification failed.
    InvalidSignature,
    /// A structural defect: today, only duplicate nonces (INV-29).
    Schema,
}

impl ViolationType {
    /// The wire string used in CLI/JSON output.
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationType::ChainBreak => "chain_break",
            ViolationType::SequenceGap => "sequence_gap",
            ViolationType::InvalidSignature => "invalid_signature",
            ViolationType::Schema => "schema",
        }
    }
}

/// The outcome of verifying a whole ledger.
#[derive(Debug, Clone)]
pub struct ReplaySummary {
    /// Number of envelopes loaded.
    pub total_entries: usize,
    /// `true` iff `violations` is empty.
    pub chain_valid: bool,
    /// Every defect found, chain violations before signature violations.
    pub violations: Vec<ChainViolation>,
    /// Count of envelopes whose signature verified.
    pub valid_signatures: usize,
    /// Count of envelopes whose signature did not verify.
    pub invalid_signatures: usize,
    /// Tally of record types seen.
    pub record_type_counts: RecordTypeCounts,
    /// Sorted, deduplicated list of `agent_id`s seen.
    pub agents_seen: Vec<String>,
    /// The uniform `gef_version` across the ledger, if any entries exist.
    pub gef_version: Option<String>,
    /// `timestamp` of the first entry (by sequence), if any.
    pub first_timestamp: Option<String>,
    /// `timestamp` of the last entry (by sequence), if any.
    pub last_timestamp: Option<String>,
}

fn empty_summary() -> ReplaySummary {
    ReplaySummary {
        total_entries: 0,
        chain_valid: true,
        violations: Vec::new(),
        valid_signatures: 0,
        invalid_signatures: 0,
        record_type_counts: RecordTypeCounts::new(),
        agents_seen: Vec::new(),
        gef_version: None,
        first_timestamp: None,
        last_timestamp: None,
    }
}

/// Loads a ledger file and verifies it. Pure read-side: never mutates the
/// file, and owns its envelope list only for the duration of a load/verify
/// cycle.
pub struct Replay {
    parallel: bool,
    silent: bool,
    envelopes: Vec<Envelope>,
}

impl Replay {
    /// `parallel` enables the Phase 2 worker-pool path once the ledger is
    /// large enough to benefit; `silent` suppresses the load confirmation
    /// log line (used by the CLI, which prints its own summary).
    pub fn new(parallel: bool, silent: bool) -> Self {
        Self {
            parallel,
            silent,
            envelopes: Vec::new(),
        }
    }

    /// The loaded envelopes, in sequence order. Empty until [`Self::load`]
    /// succeeds. Exposed so the CLI can filter by `--agent`/`--range`
    /// before calling [`Self::verify`] — the head hash must be captured
    /// from the unfiltered list first.
    pub fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }

    /// Filter the loaded envelopes in place, keeping only the ones
    /// `keep` returns `true` for.
    pub fn retain(&mut self, keep: impl FnMut(&Envelope) -> bool) {
        self.envelopes.retain(keep);
    }

    /// Stream-parse `path` line by line into `self.envelopes`, then sort
    /// by sequence and enforce `gef_version` homogeneity.
    pub fn load(&mut self, path: &Path) -> Result<(), ReplayError> {
        let span = info_span!("replay_load", path = %path.display());
        let _enter = span.enter();

        let file = std::fs::File::open(path).map_err(|source| ReplayError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let mut envelopes = Vec::new();
        for (idx, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(|source| ReplayError::Open {
                path: path.to_path_buf(),
                source,
            })?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let env: Envelope = serde_json::from_str(line)
                .map_err(|source| ReplayError::MalformedJson { line: line_no, source })?;

            let schema = env.validate_schema();
            if !schema.valid {
                return Err(ReplayError::SchemaViolation {
                    line: line_no,
                    record_id: env.record_id,
                    errors: schema.errors,
                });
            }

            envelopes.push(env);
        }

        envelopes.sort_by_key(|e| e.sequence);

        let versions: HashSet<&str> = envelopes.iter().map(|e| e.gef_version.as_str()).collect();
        if versions.len() > 1 {
            let mut versions: Vec<String> = versions.into_iter().map(str::to_string).collect();
            versions.sort();
            return Err(ReplayError::VersionMismatch(versions));
        }

        if !self.silent {
            tracing::info!(count = envelopes.len(), path = %path.display(), "loaded GEF envelopes");
        }
        debug!(count = envelopes.len(), "replay: load complete");

        self.envelopes = envelopes;
        Ok(())
    }

    /// Run the two-phase verification pass and build a [`ReplaySummary`].
    pub fn verify(&self) -> ReplaySummary {
        let span = info_span!("replay_verify", total_entries = self.envelopes.len());
        let _enter = span.enter();

        if self.envelopes.is_empty() {
            return empty_summary();
        }

        let chain_violations = self.verify_chain_sequential();

        let use_parallel = self.parallel && self.envelopes.len() >= PARALLEL_THRESHOLD;
        let signature_results = if use_parallel {
            self.verify_signatures_parallel()
        } else {
            self.verify_signatures_sequential()
        };

        let mut valid_signatures = 0;
        let mut invalid_signatures = 0;
        let mut signature_violations = Vec::new();
        let mut record_type_counts = RecordTypeCounts::new();

        for env in &self.envelopes {
            *record_type_counts.entry(env.record_type.clone()).or_insert(0) += 1;

            let is_valid = signature_results.get(&env.sequence).copied().unwrap_or(false);
            if is_valid {
                valid_signatures += 1;
            } else {
                invalid_signatures += 1;
                signature_violations.push(ChainViolation {
                    at_sequence: env.sequence,
                    record_id: env.record_id.clone(),
                    violation_type: ViolationType::InvalidSignature,
                    detail: format!(
                        "signature invalid (signer: {}...)",
                        &env.signer_public_key[..16.min(env.signer_public_key.len())]
                    ),
                });
            }
        }

        let mut agents_seen: Vec<String> =
            self.envelopes.iter().map(|e| e.agent_id.clone()).collect();
        agents_seen.sort();
        agents_seen.dedup();

        let mut violations = chain_violations;
        violations.extend(signature_violations);

        debug!(
            valid_signatures,
            invalid_signatures,
            violations = violations.len(),
            used_parallel = use_parallel,
            "replay: verify complete"
        );

        ReplaySummary {
            total_entries: self.envelopes.len(),
            chain_valid: violations.is_empty(),
            violations,
            valid_signatures,
            invalid_signatures,
            record_type_counts,
            agents_seen,
            gef_version: self.envelopes.first().map(|e| e.gef_version.clone()),
            first_timestamp: self.envelopes.first().map(|e| e.timestamp.clone()),
            last_timestamp: self.envelopes.last().map(|e| e.timestamp.clone()),
        }
    }

    fn verify_chain_sequential(&self) -> Vec<ChainViolation> {
        let mut violations = Vec::new();
        let mut seen_nonces: HashSet<&str> = HashSet::new();

        for (i, env) in self.envelopes.iter().enumerate() {
            let prev = i.checked_sub(1).and_then(|j| self.envelopes.get(j));

            if !env.verify_sequence(i as u64) {
                violations.push(ChainViolation {
                    at_sequence: env.sequence,
                    record_id: env.record_id.clone(),
                    violation_type: ViolationType::SequenceGap,
                    detail: format!("expected sequence {i}, got {}", env.sequence),
                });
            }

            if !envelope::verify_chain(env, prev) {
                let expected = envelope::expected_causal_hash_from(prev);
                violations.push(ChainViolation {
                    at_sequence: env.sequence,
                    record_id: env.record_id.clone(),
                    violation_type: ViolationType::ChainBreak,
                    detail: format!(
                        "expected causal_hash ...{}, got ...{}",
                        tail(&expected),
                        tail(&env.causal_hash)
                    ),
                });
            }

            if seen_nonces.contains(env.nonce.as_str()) {
                violations.push(ChainViolation {
                    at_sequence: env.sequence,
                    record_id: env.record_id.clone(),
                    violation_type: ViolationType::Schema,
                    detail: format!(
                        "duplicate nonce '{}' at sequence {} — nonces MUST be unique per ledger (INV-29)",
                        env.nonce, env.sequence
                    ),
                });
            }
            seen_nonces.insert(env.nonce.as_str());
        }

        violations
    }

    fn verify_signatures_sequential(&self) -> BTreeMap<u64, bool> {
        self.envelopes
            .iter()
            .map(|e| (e.sequence, envelope::verify_signature(e, None)))
            .collect()
    }

    /// Extract primitives only (no envelope objects) and hand them to a
    /// `rayon` thread pool sized `min(cpu_count, 8)`. On any failure to
    /// build or run the pool, silently falls back to the sequential path.
    fn verify_signatures_parallel(&self) -> BTreeMap<u64, bool> {
        let tuples: Vec<(Vec<u8>, Option<String>, String, u64)> = self
            .envelopes
            .iter()
            .map(|e| {
                (
                    envelope::canonical_bytes_for_signing(e),
                    e.signature.clone(),
                    e.signer_public_key.clone(),
                    e.sequence,
                )
            })
            .collect();

        let n_workers = num_cpus::get().clamp(1, MAX_WORKERS);
        let batch_size = (tuples.len() / (n_workers * BATCH_SIZE_PER_WORKER_MULTIPLIER)).max(1);

        let pool = match rayon::ThreadPoolBuilder::new().num_threads(n_workers).build() {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(error = %e, "replay: failed to build worker pool, falling back to sequential");
                return self.verify_signatures_sequential();
            }
        };

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.install(|| {
                use rayon::prelude::*;
                tuples
                    .par_chunks(batch_size)
                    .flat_map_iter(|batch| {
                        batch.iter().map(|(data, sig, pubkey_hex, seq)| {
                            let valid = match sig {
                                None => false,
                                Some(sig) => crate::crypto::verify_detached(data, sig, pubkey_hex),
                            };
                            (*seq, valid)
                        })
                    })
                    .collect::<BTreeMap<u64, bool>>()
            })
        }));

        match outcome {
            Ok(results) => results,
            Err(_) => {
                tracing::warn!("replay: worker pool panicked, falling back to sequential");
                self.verify_signatures_sequential()
            }
        }
    }

    /// Verify, then write the full audit report (everything in
    /// [`ReplaySummary`] plus the source path) as JSON to `output_path`.
    pub fn export_json(&self, output_path: &Path) -> std::io::Result<ReplaySummary> {
        let summary = self.verify();
        let report = serde_json::json!({
            "gef_replay_report": {
                "gef_version": summary.gef_version,
                "total_entries": summary.total_entries,
                "chain_valid": summary.chain_valid,
                "valid_signatures": summary.valid_signatures,
                "invalid_signatures": summary.invalid_signatures,
                "first_timestamp": summary.first_timestamp,
                "last_timestamp": summary.last_timestamp,
                "agents_seen": summary.agents_seen,
                "record_type_counts": summary.record_type_counts,
                "violations": summary.violations.iter().map(|v| serde_json::json!({
                    "at_sequence": v.at_sequence,
                    "record_id": v.record_id,
                    "violation_type": v.violation_type.as_str(),
                    "detail": v.detail,
                })).collect::<Vec<_>>(),
            }
        });
        std::fs::write(output_path, serde_json::to_string_pretty(&report)?)?;
        if !self.silent {
            tracing::info!(path = %output_path.display(), "wrote GEF replay report");
        }
        Ok(summary)
    }
}

/// The external anchoring commitment: SHA-256 hex of the canonical
/// encoding of the last envelope's chaining surface. Must always be
/// computed on the unfiltered ledger — callers that filter
/// [`Replay::envelopes`] for display must capture this first.
pub fn head_hash(envelopes: &[Envelope]) -> String {
    envelope::head_hash(envelopes.iter().max_by_key(|e| e.sequence))
}

fn tail(s: &str) -> String {
    let n = s.len().saturating_sub(12);
    s[n..].to_string()
}
