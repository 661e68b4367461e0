//! The append-only ledger writer.
//!
//! One `Ledger` owns one JSONL file. All state mutation and file writing is
//! serialized through a single lock per instance: thread-safe within a
//! process, not safe across processes sharing a file (that is a documented
//! non-goal).

use std::fs::OpenOptions;
use std::io::{BufRead, Read as _, Write as _};
use std::path::{Path, PathBuf};

use gef_spec::Envelope;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::crypto::Ed25519KeyManager;
use crate::envelope;

/// Construction-time options for a [`Ledger`].
#[derive(Debug, Clone, Copy)]
pub struct LedgerOptions {
    /// Whether `emit` fsyncs the ledger file after every append.
    ///
    /// Defaults to `true`: this is an evidence ledger, and silently losing
    /// the last entries on power failure defeats the tamper-evidence
    /// claim. Set to `false` to trade durability for throughput.
    pub fsync: bool,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self { fsync: true }
    }
}

/// Fatal failures from ledger construction or `emit`.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// `emit` built an envelope whose sequence didn't match the writer's
    /// expected next sequence. Should be unreachable outside concurrent
    /// misuse of the lock.
    #[error("chain invariant violated — sequence mismatch: expected={expected}, got={got}")]
    SequenceMismatch {
        /// Expected sequence.
        expected: u64,
        /// Sequence found on the envelope.
        got: u64,
    },
    /// `emit` built an envelope whose `causal_hash` didn't match the one
    /// expected from the writer's `last_envelope`.
    #[error("chain invariant violated — causal_hash mismatch: expected=...{expected}, got=...{got}")]
    CausalHashMismatch {
        /// Last 12 characters of the expected hash.
        expected: String,
        /// Last 12 characters of the actual hash.
        got: String,
    },
    /// Appending the signed envelope to the ledger file failed.
    #[error("ledger write failed: {0}")]
    Io(#[from] std::io::Error),
    /// Serializing the envelope to JSON failed (should be unreachable for
    /// a well-formed envelope).
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The caller-supplied `record_type`/`payload`/`agent_id`/
    /// `signer_public_key` failed validation.
    #[error("invalid envelope inputs: {0}")]
    InvalidInput(#[from] gef_spec::SchemaError),
}

struct State {
    next_sequence: u64,
    last_envelope: Option<Envelope>,
}

/// Stateful, single-writer, append-only GEF ledger.
pub struct Ledger {
    key: Ed25519KeyManager,
    agent_id: String,
    path: PathBuf,
    options: LedgerOptions,
    state: Mutex<State>,
}

/// A read-only snapshot of the writer's current chain state.
#[derive(Debug, Clone)]
pub struct LedgerStats {
    /// The ledger's configured default agent id.
    pub agent_id: String,
    /// The sequence the next `emit` will use.
    pub next_sequence: u64,
    /// `record_id` of the last appended envelope, if any.
    pub last_record_id: Option<String>,
    /// `causal_hash` a hypothetical next entry would carry.
    pub last_causal_hash: String,
    /// Path to the ledger file on disk.
    pub ledger_file: PathBuf,
    /// Protocol version this ledger writes.
    pub gef_version: String,
}

impl Ledger {
    /// Open a ledger at `path`, restoring `next_sequence` and
    /// `last_envelope` from the file's tail if it already exists.
    ///
    /// If the file is missing, state starts at genesis. If the last line
    /// is malformed or fails schema validation, a diagnostic is logged and
    /// state *still* starts at genesis — construction never fails because
    /// of a corrupted tail; callers should run full replay verification
    /// before trusting the ledger.
    pub fn open(
        key: Ed25519KeyManager,
        agent_id: impl Into<String>,
        path: impl Into<PathBuf>,
        options: LedgerOptions,
    ) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let state = Mutex::new(Self::restore_state(&path));
        Self {
            key,
            agent_id: agent_id.into(),
            path,
            options,
            state,
        }
    }

    fn restore_state(path: &Path) -> State {
        let genesis = State {
            next_sequence: 0,
            last_envelope: None,
        };

        let Ok(file) = std::fs::File::open(path) else {
            return genesis;
        };
        let last_line = std::io::BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .last();

        let Some(last_line) = last_line else {
            return genesis;
        };

        match serde_json::from_str::<Envelope>(&last_line) {
            Ok(env) => {
                let schema = env.validate_schema();
                if !schema.valid {
                    warn!(
                        errors = ?schema.errors,
                        path = %path.display(),
                        "ledger: last line failed schema validation during restore; \
                         starting from genesis defaults — run full verification before emitting"
                    );
                    return genesis;
                }
                debug!(next_sequence = env.sequence + 1, "ledger: restored state from tail");
                State {
                    next_sequence: env.sequence + 1,
                    last_envelope: Some(env),
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "ledger: last line is not valid JSON during restore; starting from genesis defaults"
                );
                genesis
            }
        }
    }

    /// Build, sign, and append one envelope. Returns the signed envelope
    /// with a guaranteed non-empty `signature`.
    ///
    /// In order: build → sign → assert chain invariants → append (flush,
    /// fsync if configured) → advance state. A failure at any step before
    /// the write leaves state unchanged; a failure during the write also
    /// leaves state unchanged.
    pub fn emit(
        &self,
        record_type: &str,
        payload: serde_json::Value,
        agent_id_override: Option<&str>,
    ) -> Result<Envelope, LedgerError> {
        let mut state = self.state.lock();
        let agent_id = agent_id_override.unwrap_or(&self.agent_id);

        let span = tracing::info_span!(
            "ledger_emit",
            agent_id = %agent_id,
            record_type = %record_type,
            sequence = state.next_sequence,
        );
        let _enter = span.enter();

        let mut env = envelope::create(
            record_type,
            agent_id,
            self.key.public_key_hex(),
            state.next_sequence,
            payload,
            state.last_envelope.as_ref(),
        )
        .inspect_err(|e| error!(error = %e, "ledger: invalid envelope inputs"))?;

        envelope::sign(&mut env, &self.key);

        self.assert_chain_invariants(&env, &state)?;

        if let Err(e) = self.append_to_ledger(&env) {
            error!(error = %e, "ledger: append failed, state not advanced");
            return Err(e);
        }

        state.next_sequence += 1;
        debug!(record_id = %env.record_id, "ledger: emitted");
        state.last_envelope = Some(env.clone());

        Ok(env)
    }

    fn assert_chain_invariants(&self, env: &Envelope, state: &State) -> Result<(), LedgerError> {
        if !env.verify_sequence(state.next_sequence) {
            return Err(LedgerError::SequenceMismatch {
                expected: state.next_sequence,
                got: env.sequence,
            });
        }
        if !envelope::verify_chain(env, state.last_envelope.as_ref()) {
            let expected = envelope::expected_causal_hash_from(state.last_envelope.as_ref());
            return Err(LedgerError::CausalHashMismatch {
                expected: tail(&expected),
                got: tail(&env.causal_hash),
            });
        }
        Ok(())
    }

    fn append_to_ledger(&self, env: &Envelope) -> Result<(), LedgerError> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut line = serde_json::to_string(env)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;
        if self.options.fsync {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Re-derive the entire chain from disk and check every envelope's
    /// sequence, causal hash, and signature. A read-side self-check,
    /// distinct from the full `Replay` engine: it never builds a
    /// `ReplaySummary`, just a boolean.
    pub fn verify_chain(&self) -> bool {
        let Ok(mut file) = std::fs::File::open(&self.path) else {
            return true;
        };
        let mut contents = String::new();
        if file.read_to_string(&mut contents).is_err() {
            return false;
        }

        let mut envelopes = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(env) = serde_json::from_str::<Envelope>(line) else {
                return false;
            };
            envelopes.push(env);
        }

        for (i, env) in envelopes.iter().enumerate() {
            let prev = i.checked_sub(1).and_then(|j| envelopes.get(j));
            if !env.verify_sequence(i as u64) {
                return false;
            }
            if !envelope::verify_chain(env, prev) {
                return false;
            }
            if !envelope::verify_signature(env, None) {
                return false;
            }
        }
        true
    }

    /// A snapshot of the writer's current chain state.
    pub fn stats(&self) -> LedgerStats {
        let state = self.state.lock();
        LedgerStats {
            agent_id: self.agent_id.clone(),
            next_sequence: state.next_sequence,
            last_record_id: state.last_envelope.as_ref().map(|e| e.record_id.clone()),
            last_causal_hash: envelope::head_hash(state.last_envelope.as_ref()),
            ledger_file: self.path.clone(),
            gef_version: gef_spec::GEF_VERSION.to_string(),
        }
    }
}

fn tail(s: &str) -> String {
    let n = s.len().saturating_sub(12);
    s[n..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_ledger(dir: &TempDir, key: Ed25519KeyManager) -> Ledger {
        Ledger::open(key, "agent-1", dir.path().join("ledger.jsonl"), LedgerOptions::default())
    }

    #[test]
    fn emit_produces_a_signed_envelope_whose_signature_is_present_on_return() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir, Ed25519KeyManager::generate());
        let env = ledger.emit("execution", json!({"step": 0}), None).unwrap();
        assert!(env.signature.is_some());
        assert_eq!(env.sequence, 0);
    }

    #[test]
    fn sequential_emits_advance_sequence_and_chain() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir, Ed25519KeyManager::generate());
        for i in 0..3u64 {
            let env = ledger.emit("execution", json!({"step": i}), None).unwrap();
            assert_eq!(env.sequence, i);
        }
        assert!(ledger.verify_chain());
        let contents = std::fs::read_to_string(dir.path().join("ledger.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn reopening_a_ledger_restores_next_sequence() {
        let dir = TempDir::new().unwrap();
        let key = Ed25519KeyManager::generate();
        let path = dir.path().join("ledger.jsonl");
        {
            let ledger = Ledger::open(
                Ed25519KeyManager::from_private_bytes(&key.private_bytes_raw()).unwrap(),
                "agent-1",
                &path,
                LedgerOptions::default(),
            );
            ledger.emit("execution", json!({"step": 0}), None).unwrap();
            ledger.emit("execution", json!({"step": 1}), None).unwrap();
        }
        let reopened = Ledger::open(
            Ed25519KeyManager::from_private_bytes(&key.private_bytes_raw()).unwrap(),
            "agent-1",
            &path,
            LedgerOptions::default(),
        );
        let stats = reopened.stats();
        assert_eq!(stats.next_sequence, 2);
        let env = reopened.emit("execution", json!({"step": 2}), None).unwrap();
        assert_eq!(env.sequence, 2);
    }

    #[test]
    fn corrupted_tail_line_does_not_fail_construction_but_is_detectable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        std::fs::write(&path, "{not valid json\n").unwrap();

        let ledger = open_ledger(&dir, Ed25519KeyManager::generate());
        let stats = ledger.stats();
        assert_eq!(stats.next_sequence, 0);
        assert!(!ledger.verify_chain());
    }

    #[test]
    fn missing_ledger_file_starts_at_genesis() {
        let dir = TempDir::new().unwrap();
        let ledger = open_ledger(&dir, Ed25519KeyManager::generate());
        let stats = ledger.stats();
        assert_eq!(stats.next_sequence, 0);
        assert_eq!(stats.last_record_id, None);
    }

    #[test]
    fn concurrent_emits_produce_a_dense_gap_free_sequence() {
        use std::sync::Arc;
        use std::thread;

        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(open_ledger(&dir, Ed25519KeyManager::generate()));

        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 25;

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        ledger
                            .emit("heartbeat", json!({"thread": t, "i": i}), None)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let contents = std::fs::read_to_string(dir.path().join("ledger.jsonl")).unwrap();
        let mut sequences: Vec<u64> = contents
            .lines()
            .map(|l| serde_json::from_str::<Envelope>(l).unwrap().sequence)
            .collect();
        sequences.sort_unstable();

        let expected: Vec<u64> = (0..THREADS * PER_THREAD).collect();
        assert_eq!(sequences, expected);
        assert!(ledger.verify_chain());
    }
}
