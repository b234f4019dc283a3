//! Ledger record model.
//!
//! A [`Record`] is the atomic ledger entry: created once by the writer under
//! an active fencing lease, never updated or deleted, read forever. Every
//! record carries both a writer signature and a witness signature over the
//! same content hash; no record is ever durable without its witness.

use serde::{Deserialize, Serialize};

use crate::canonical::{CanonicalError, canonical_record_bytes};
use crate::crypto::{
    Hash, RECORD_COMMIT_PREFIX, SIGNATURE_SIZE, Signature, SignerError, VerifyingKey,
    WITNESS_ATTESTATION_PREFIX, verify_with_domain,
};

/// Record type names reserved for the ledger's own operational records.
///
/// These are bootstrap-registered in the schema catalog; collaborators may
/// not register types under the `ledger.` prefix.
pub mod system_types {
    /// A fencing lease was granted to a writer.
    pub const LEASE_GRANTED: &str = "ledger.lease_granted";

    /// A fencing lease was handed off to a new holder.
    pub const LEASE_HANDOFF: &str = "ledger.lease_handoff";

    /// A fencing lease was released by its holder.
    pub const LEASE_RELEASED: &str = "ledger.lease_released";

    /// The monitor declared a halt after detecting a fork or gap.
    pub const HALT_DECLARED: &str = "ledger.halt_declared";

    /// A completed recovery decision re-opened the ledger for writes.
    pub const RECOVERY_DECIDED: &str = "ledger.recovery_decided";

    /// Prefix reserved for all system record types.
    pub const RESERVED_PREFIX: &str = "ledger.";
}

/// A candidate record submitted to the writer.
///
/// Collaborators own payload interpretation; the ledger treats the payload
/// as opaque bytes validated only against the schema catalog declaration
/// for `(record_type, schema_version)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRecord {
    /// Record type name, declared in the schema catalog.
    pub record_type: String,

    /// Schema version of the payload, declared in the schema catalog.
    pub schema_version: u32,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl CandidateRecord {
    /// Creates a new candidate record.
    #[must_use]
    pub fn new(record_type: impl Into<String>, schema_version: u32, payload: Vec<u8>) -> Self {
        Self {
            record_type: record_type.into(),
            schema_version,
            payload,
        }
    }
}

/// A committed ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Strictly monotonic sequence number, assigned at write time.
    pub sequence: u64,

    /// Record type name.
    pub record_type: String,

    /// Schema version of the payload.
    pub schema_version: u32,

    /// Opaque payload bytes.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    /// Content hash of the immediately preceding record (genesis constant
    /// for `sequence == 1`).
    #[serde(with = "serde_bytes")]
    pub prior_hash: Hash,

    /// Hash over the canonical encoding of
    /// (`record_type`, `schema_version`, `payload`, `prior_hash`).
    #[serde(with = "serde_bytes")]
    pub content_hash: Hash,

    /// Identifier of the hash algorithm used for `content_hash`.
    pub hash_algorithm: String,

    /// Identity of the producing writer lease-holder.
    pub writer_id: String,

    /// Writer signature over `content_hash` (domain `RECORD_COMMIT:`).
    #[serde(with = "serde_bytes")]
    pub writer_signature: [u8; SIGNATURE_SIZE],

    /// Identity of the attesting witness.
    pub witness_id: String,

    /// Witness signature over `content_hash` (domain `WITNESS_ATTESTATION:`).
    #[serde(with = "serde_bytes")]
    pub witness_signature: [u8; SIGNATURE_SIZE],

    /// Writer-local wall-clock timestamp, milliseconds since epoch.
    ///
    /// Informational ordering aid only; `sequence` is authoritative.
    pub local_time_ms: u64,

    /// Median of the configured independent authority time sources, when at
    /// least two responded. Informational only.
    pub authority_time_ms: Option<u64>,
}

impl Record {
    /// Recomputes this record's canonical bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`CanonicalError`] if the stored fields are malformed.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical_record_bytes(
            &self.record_type,
            self.schema_version,
            &self.payload,
            &self.prior_hash,
        )
    }

    /// Verifies the writer signature over this record's content hash.
    ///
    /// # Errors
    ///
    /// Returns `VerificationFailed` if the signature does not verify.
    pub fn verify_writer_signature(&self, key: &VerifyingKey) -> Result<(), SignerError> {
        let signature = Signature::from_bytes(&self.writer_signature);
        verify_with_domain(key, RECORD_COMMIT_PREFIX, &self.content_hash, &signature)
    }

    /// Verifies the witness signature over this record's content hash.
    ///
    /// # Errors
    ///
    /// Returns `VerificationFailed` if the signature does not verify.
    pub fn verify_witness_signature(&self, key: &VerifyingKey) -> Result<(), SignerError> {
        let signature = Signature::from_bytes(&self.witness_signature);
        verify_with_domain(
            key,
            WITNESS_ATTESTATION_PREFIX,
            &self.content_hash,
            &signature,
        )
    }

    /// Returns true if this record is one of the ledger's own operational
    /// record types.
    #[must_use]
    pub fn is_system_record(&self) -> bool {
        self.record_type.starts_with(system_types::RESERVED_PREFIX)
    }
}
