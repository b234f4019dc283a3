//! Checkpoint anchors and inclusion proofs.
//!
//! A checkpoint anchor is a periodic signed commitment to a prefix of the
//! chain, enabling light verification without downloading every record. The
//! commitment is a running fold of content hashes:
//!
//! ```text
//! cum[0] = GENESIS_PRIOR_HASH
//! cum[n] = blake3(cum[n-1] || content_hash[n])
//! ```
//!
//! An inclusion proof for record `k` relative to an anchor at `N >= k` is
//! `{cum[k-1], content_hash[k+1..=N]}`. The verifier refolds from the
//! prefix through the record's own content hash and the suffix hashes and
//! compares against the signed anchor — only locally-held data, no trust in
//! the server.
//!
//! Anchors are immutable once published and are not finality: a fork can
//! still be discovered spanning two checkpoints, which is the monitor's
//! job, not this module's.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{
    CHECKPOINT_ANCHOR_PREFIX, ChainHasher, Hash, SIGNATURE_SIZE, Signature, Signer, VerifyingKey,
    sign_with_domain, verify_with_domain,
};
use crate::record::Record;
use crate::store::{LedgerStore, StoreError};

/// Default cadence: an anchor every this many records.
pub const DEFAULT_CHECKPOINT_CADENCE: u64 = 128;

/// Checkpoint service configuration.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Create an anchor once the head is this many records past the last
    /// anchor.
    pub cadence_records: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            cadence_records: DEFAULT_CHECKPOINT_CADENCE,
        }
    }
}

/// A periodic signed commitment to a chain prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointAnchor {
    /// The sequence this anchor commits up to (inclusive).
    pub sequence_at_checkpoint: u64,

    /// The cumulative hash fold at that sequence.
    #[serde(with = "serde_bytes")]
    pub cumulative_hash: Hash,

    /// Identity of the signing service.
    pub signer_id: String,

    /// Signature over the canonical anchor bytes (domain
    /// `CHECKPOINT_ANCHOR:`).
    #[serde(with = "serde_bytes")]
    pub signature: [u8; SIGNATURE_SIZE],

    /// When the anchor was created, milliseconds since epoch.
    pub created_at_ms: u64,
}

impl CheckpointAnchor {
    /// Canonical bytes covered by the anchor signature.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // signer_id length bounded in practice
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 32 + 4 + self.signer_id.len() + 8);
        bytes.extend_from_slice(&self.sequence_at_checkpoint.to_be_bytes());
        bytes.extend_from_slice(&self.cumulative_hash);
        bytes.extend_from_slice(&(self.signer_id.len() as u32).to_be_bytes());
        bytes.extend_from_slice(self.signer_id.as_bytes());
        bytes.extend_from_slice(&self.created_at_ms.to_be_bytes());
        bytes
    }

    /// Verifies the anchor signature.
    ///
    /// # Errors
    ///
    /// Returns `AnchorSignatureInvalid` if the signature does not verify.
    pub fn verify_signature(&self, key: &VerifyingKey) -> Result<(), ProofError> {
        let signature = Signature::from_bytes(&self.signature);
        verify_with_domain(key, CHECKPOINT_ANCHOR_PREFIX, &self.canonical_bytes(), &signature)
            .map_err(|_| ProofError::AnchorSignatureInvalid)
    }
}

/// An inclusion proof tying one record to a checkpoint anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    /// The sequence the proof covers.
    pub sequence: u64,

    /// The cumulative fold immediately before the proven record.
    #[serde(with = "serde_bytes")]
    pub prefix_cumulative: Hash,

    /// Content hashes of the records after the proven one, up to and
    /// including the anchor sequence.
    pub suffix_hashes: Vec<serde_bytes::ByteArray<32>>,

    /// The anchor the proof folds into.
    pub anchor: CheckpointAnchor,
}

/// Errors from checkpoint creation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CheckpointError {
    /// The chain is empty; there is nothing to anchor.
    #[error("cannot checkpoint an empty chain")]
    EmptyChain,

    /// No anchor at or after the requested sequence exists yet.
    #[error("no checkpoint covers sequence {sequence}")]
    NoAnchorCovering {
        /// The uncovered sequence.
        sequence: u64,
    },

    /// The requested sequence does not exist.
    #[error("sequence {sequence} is beyond the chain head {head}")]
    BeyondHead {
        /// The requested sequence.
        sequence: u64,
        /// The current head sequence.
        head: u64,
    },

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Errors from proof verification. All verification happens locally.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProofError {
    /// The anchor signature does not verify.
    #[error("anchor signature invalid")]
    AnchorSignatureInvalid,

    /// The proof covers a different sequence than the record.
    #[error("proof covers sequence {proof_sequence}, record is {record_sequence}")]
    SequenceMismatch {
        /// The sequence named by the proof.
        proof_sequence: u64,
        /// The record's sequence.
        record_sequence: u64,
    },

    /// The suffix length does not reach the anchor sequence.
    #[error("proof suffix length {actual} does not reach the anchor (expected {expected})")]
    SuffixLengthMismatch {
        /// Expected suffix length.
        expected: u64,
        /// Actual suffix length.
        actual: u64,
    },

    /// Refolding did not reproduce the anchor's cumulative hash.
    #[error("cumulative hash fold does not reach the anchor commitment")]
    FoldMismatch,
}

/// Creates anchors and inclusion proofs.
pub struct CheckpointService {
    store: Arc<LedgerStore>,
    signer: Signer,
    signer_id: String,
    config: CheckpointConfig,
}

impl CheckpointService {
    /// Creates a checkpoint service.
    #[must_use]
    pub fn new(
        store: Arc<LedgerStore>,
        signer: Signer,
        signer_id: impl Into<String>,
        config: CheckpointConfig,
    ) -> Self {
        Self {
            store,
            signer,
            signer_id: signer_id.into(),
            config,
        }
    }

    /// Verifying key for this service's anchor signatures.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signer.verifying_key()
    }

    /// Creates and persists an anchor at the current head.
    ///
    /// # Errors
    ///
    /// Returns `EmptyChain` when there is nothing to anchor, or a storage
    /// error.
    pub fn create_checkpoint(&self, now_ms: u64) -> Result<CheckpointAnchor, CheckpointError> {
        let head = self.store.head()?;
        if head.sequence == 0 {
            return Err(CheckpointError::EmptyChain);
        }

        let anchor = self.commitment_at(head.sequence, now_ms)?;
        self.store.insert_checkpoint(&anchor)?;
        tracing::info!(
            sequence = anchor.sequence_at_checkpoint,
            "checkpoint anchor published"
        );
        Ok(anchor)
    }

    /// Creates an anchor if the head has advanced a full cadence past the
    /// last one.
    ///
    /// # Errors
    ///
    /// Returns a storage error; an empty or not-yet-due chain returns
    /// `Ok(None)`.
    pub fn checkpoint_if_due(&self, now_ms: u64) -> Result<Option<CheckpointAnchor>, CheckpointError> {
        let head = self.store.head()?;
        if head.sequence == 0 {
            return Ok(None);
        }
        let last = self
            .store
            .latest_checkpoint()?
            .map_or(0, |a| a.sequence_at_checkpoint);
        if head.sequence < last + self.config.cadence_records {
            return Ok(None);
        }
        self.create_checkpoint(now_ms).map(Some)
    }

    /// Returns a signed, unstored commitment at the current head.
    ///
    /// Used by "as of sequence N" query views so the result carries a proof
    /// tied to the head the server answered from.
    ///
    /// # Errors
    ///
    /// Returns `EmptyChain` when the chain is empty.
    pub fn head_commitment(&self, now_ms: u64) -> Result<CheckpointAnchor, CheckpointError> {
        let head = self.store.head()?;
        if head.sequence == 0 {
            return Err(CheckpointError::EmptyChain);
        }
        self.commitment_at(head.sequence, now_ms)
    }

    /// Builds an inclusion proof for `sequence` relative to the nearest
    /// stored anchor at or after it.
    ///
    /// # Errors
    ///
    /// Returns `NoAnchorCovering` when no stored anchor reaches the
    /// sequence yet.
    pub fn prove_inclusion(&self, sequence: u64) -> Result<InclusionProof, CheckpointError> {
        let anchor = self
            .store
            .checkpoint_at_or_after(sequence)?
            .ok_or(CheckpointError::NoAnchorCovering { sequence })?;
        self.prove_against(sequence, anchor)
    }

    /// Builds an inclusion proof for `sequence` against a caller-supplied
    /// anchor (stored or a head commitment).
    ///
    /// # Errors
    ///
    /// Returns `BeyondHead` if the anchor does not cover the sequence.
    pub fn prove_against(
        &self,
        sequence: u64,
        anchor: CheckpointAnchor,
    ) -> Result<InclusionProof, CheckpointError> {
        if sequence == 0 || sequence > anchor.sequence_at_checkpoint {
            return Err(CheckpointError::BeyondHead {
                sequence,
                head: anchor.sequence_at_checkpoint,
            });
        }

        let prefix_cumulative = self.cumulative_at(sequence - 1)?;
        let suffix_hashes = self
            .store
            .content_hashes_in_range(sequence + 1, anchor.sequence_at_checkpoint)?
            .into_iter()
            .map(|(_, hash)| serde_bytes::ByteArray::new(hash))
            .collect();

        Ok(InclusionProof {
            sequence,
            prefix_cumulative,
            suffix_hashes,
            anchor,
        })
    }

    /// Computes the cumulative fold at `sequence` (0 yields the genesis
    /// constant), folding forward from the nearest prior anchor.
    fn cumulative_at(&self, sequence: u64) -> Result<Hash, CheckpointError> {
        let (mut cumulative, base) = match self.store.checkpoint_at_or_before(sequence)? {
            Some(anchor) => (anchor.cumulative_hash, anchor.sequence_at_checkpoint),
            None => (ChainHasher::GENESIS_PRIOR_HASH, 0),
        };
        if base < sequence {
            for (_, content_hash) in self.store.content_hashes_in_range(base + 1, sequence)? {
                cumulative = ChainHasher::fold(&cumulative, &content_hash);
            }
        }
        Ok(cumulative)
    }

    fn commitment_at(&self, sequence: u64, now_ms: u64) -> Result<CheckpointAnchor, CheckpointError> {
        let cumulative_hash = self.cumulative_at(sequence)?;
        let mut anchor = CheckpointAnchor {
            sequence_at_checkpoint: sequence,
            cumulative_hash,
            signer_id: self.signer_id.clone(),
            signature: [0u8; SIGNATURE_SIZE],
            created_at_ms: now_ms,
        };
        anchor.signature =
            sign_with_domain(&self.signer, CHECKPOINT_ANCHOR_PREFIX, &anchor.canonical_bytes())
                .to_bytes();
        Ok(anchor)
    }
}

/// Verifies an inclusion proof using only locally-held data.
///
/// # Errors
///
/// See [`ProofError`].
pub fn verify_inclusion(
    record: &Record,
    proof: &InclusionProof,
    anchor_key: &VerifyingKey,
) -> Result<(), ProofError> {
    if record.sequence != proof.sequence {
        return Err(ProofError::SequenceMismatch {
            proof_sequence: proof.sequence,
            record_sequence: record.sequence,
        });
    }

    proof.anchor.verify_signature(anchor_key)?;

    let expected_suffix = proof.anchor.sequence_at_checkpoint - proof.sequence;
    if proof.suffix_hashes.len() as u64 != expected_suffix {
        return Err(ProofError::SuffixLengthMismatch {
            expected: expected_suffix,
            actual: proof.suffix_hashes.len() as u64,
        });
    }

    let mut cumulative = ChainHasher::fold(&proof.prefix_cumulative, &record.content_hash);
    for hash in &proof.suffix_hashes {
        cumulative = ChainHasher::fold(&cumulative, hash);
    }
    if cumulative != proof.anchor.cumulative_hash {
        return Err(ProofError::FoldMismatch);
    }
    Ok(())
}
