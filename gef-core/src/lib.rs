//! Canonical encoding, key management, the append-only ledger writer, and
//! the replay/verification engine for the GuardClaw Evidence Format.
//!
//! `gef-spec` owns the envelope data model; this crate supplies everything
//! that needs a concrete crypto, hashing, and I/O stack to act on it.

#![deny(missing_docs)]

pub mod canonical;
pub mod crypto;
pub mod envelope;
pub mod ledger;
pub mod replay;
pub mod time;
pub mod verification;

pub use canonical::{canonical, canonical_hash};
pub use crypto::{Ed25519KeyManager, KeyError};
pub use envelope::head_hash;
pub use ledger::{Ledger, LedgerError, LedgerOptions, LedgerStats};
pub use replay::{ChainViolation, Replay, ReplayError, ReplaySummary, ViolationType};
pub use time::gef_timestamp;
pub use verification::{
    verify_chain_link, verify_envelope, verify_envelope_from_json, verify_ledger_file,
    VerificationResult,
};

pub use gef_spec::{Envelope, RecordType, SchemaError, GEF_VERSION, GENESIS_HASH};
