//! The event writer: the single path by which records enter the ledger.
//!
//! # Pipeline
//!
//! [`EventWriter::append`] checks its preconditions in a fixed order:
//!
//! 1. the halt transport reports not-halted (both channels, OR-combined);
//! 2. the presented lease is the currently valid lease;
//! 3. the candidate's `(record_type, schema_version)` is declared in the
//!    schema catalog;
//! 4. the candidate canonicalizes, hashes, and is signed by the writer;
//! 5. a witness attestation over the content hash is collected;
//! 6. the compare-and-append commit re-validates the lease, re-checks the
//!    durable halt flag inside the write transaction, and verifies the
//!    candidate's prior hash still names the chain head.
//!
//! The attestation is collected *before* the write transaction — a witness
//! can take tens of seconds, and the database is never held open across
//! that wait. Because the witness signs the content hash and the content
//! hash covers the prior hash, the attestation is bound to one exact chain
//! position: if the head moves after attestation, the commit fails with a
//! retryable [`AppendError::ChainContinuityViolation`] and both the record
//! and its attestation evaporate. Nothing partial ever persists.

use std::sync::Arc;

use thiserror::Error;

use crate::canonical::{CanonicalError, canonical_record_bytes};
use crate::catalog::{SchemaCatalog, StakesClass};
use crate::crypto::{
    ChainHasher, HASH_ALGORITHM, Hash, RECORD_COMMIT_PREFIX, Signer, VerifyingKey,
    sign_with_domain,
};
use crate::halt::{HaltError, HaltTransport};
use crate::lease::{LeaseError, LeaseManager};
use crate::record::{CandidateRecord, Record};
use crate::store::{CommitError, LedgerStore, PreparedRecord, StoreError};
use crate::time::{AuthorityClock, SystemClock, TimeSource};
use crate::witness::{WitnessCoordinator, WitnessError};

/// Errors from the append path.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppendError {
    /// The system is halted; all writes are rejected, including by the
    /// holder of an otherwise-valid lease.
    #[error("system halted: {reason}")]
    SystemHalted {
        /// The declared halt reason, when known.
        reason: String,
    },

    /// The presented lease is stale, superseded, expired, or unknown.
    #[error("stale or superseded lease: {0}")]
    StaleOrSupersededLease(#[from] LeaseError),

    /// The candidate's prior hash lost a race against a concurrent append.
    /// Retryable: re-read the head and resubmit.
    #[error("chain continuity violation: head moved to sequence {current_sequence}")]
    ChainContinuityViolation {
        /// Content hash of the current head.
        current_head: Hash,
        /// Sequence of the current head.
        current_sequence: u64,
    },

    /// The attestation step could not complete; the write was aborted with
    /// no partial state. Retryable once the witness pool recovers.
    #[error("no witness available: {0}")]
    NoWitnessAvailable(#[from] WitnessError),

    /// The candidate references an undeclared record type or schema version.
    #[error("undeclared schema: {record_type} v{schema_version}")]
    UndeclaredSchema {
        /// The undeclared record type.
        record_type: String,
        /// The undeclared schema version.
        schema_version: u32,
    },

    /// The candidate failed canonicalization (fail-closed, nothing hashed).
    #[error("invalid candidate: {0}")]
    InvalidCandidate(#[from] CanonicalError),

    /// The halt transport could not be consulted. Treated as halted.
    #[error("halt channel unavailable; treating as halted: {0}")]
    HaltChannelUnavailable(#[from] HaltError),

    /// Underlying storage failure.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

/// A token authorizing one halt-exempt append.
///
/// Only the recovery coordinator can construct one, which makes the
/// halt-exempt write path unreachable from outside the crate.
pub(crate) struct RecoveryWriteTicket(pub(crate) ());

/// Appends records to the ledger.
pub struct EventWriter {
    store: Arc<LedgerStore>,
    catalog: Arc<SchemaCatalog>,
    leases: Arc<LeaseManager>,
    witnesses: Arc<WitnessCoordinator>,
    halt: Arc<HaltTransport>,
    signer: Signer,
    writer_id: String,
    clock: Arc<dyn TimeSource>,
    authority: Arc<AuthorityClock>,
}

impl EventWriter {
    /// Creates a writer.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<LedgerStore>,
        catalog: Arc<SchemaCatalog>,
        leases: Arc<LeaseManager>,
        witnesses: Arc<WitnessCoordinator>,
        halt: Arc<HaltTransport>,
        signer: Signer,
        writer_id: impl Into<String>,
        authority: Arc<AuthorityClock>,
    ) -> Self {
        Self {
            store,
            catalog,
            leases,
            witnesses,
            halt,
            signer,
            writer_id: writer_id.into(),
            clock: Arc::new(SystemClock),
            authority,
        }
    }

    /// Replaces the local clock. Used by tests to pin time.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Identity of this writer.
    #[must_use]
    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    /// Verifying key for this writer's record signatures.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signer.verifying_key()
    }

    /// Appends a candidate record under the given lease.
    ///
    /// On success the record is durably committed with its witness
    /// attestation and the assigned sequence. On any failure nothing is
    /// persisted.
    ///
    /// # Errors
    ///
    /// See [`AppendError`]. `ChainContinuityViolation` and
    /// `NoWitnessAvailable` are retryable; the caller must re-read the head
    /// before retrying a continuity violation.
    pub fn append(&self, lease_id: u64, candidate: &CandidateRecord) -> Result<Record, AppendError> {
        let now_ms = self.clock.now_ms();

        // Halt gate: both channels, fail-closed.
        let status = self.halt.status(now_ms)?;
        if status.halted {
            return Err(AppendError::SystemHalted {
                reason: status
                    .state
                    .reason
                    .unwrap_or_else(|| "halt reason unavailable".to_string()),
            });
        }

        // Lease gate.
        self.leases.validate(lease_id, &self.writer_id, now_ms)?;

        // Schema gate: undeclared types are rejected, never best-effort
        // parsed.
        if !self
            .catalog
            .is_declared(&candidate.record_type, candidate.schema_version)
        {
            return Err(AppendError::UndeclaredSchema {
                record_type: candidate.record_type.clone(),
                schema_version: candidate.schema_version,
            });
        }
        let stakes = self
            .catalog
            .stakes_of(&candidate.record_type)
            .unwrap_or(StakesClass::High);

        // Canonicalize against the current head and sign.
        let head = self.store.head()?;
        let prepared = self.prepare(candidate, head.content_hash, stakes, now_ms)?;

        // Atomic compare-and-append. The store re-checks the durable
        // halt flag and the head inside the transaction; the fast channel
        // is consulted once more here, immediately before the durable
        // commit, to shrink the race window with an in-flight halt.
        if self.halt.status(self.clock.now_ms())?.halted {
            return Err(AppendError::SystemHalted {
                reason: "halt declared during append".to_string(),
            });
        }
        self.leases
            .validate(lease_id, &self.writer_id, self.clock.now_ms())?;

        let record = self.store.commit(&prepared).map_err(map_commit_error)?;
        tracing::info!(
            sequence = record.sequence,
            record_type = %record.record_type,
            witness_id = %record.witness_id,
            "record committed"
        );
        Ok(record)
    }

    /// Halt-exempt append used by the recovery coordinator to write the
    /// recovery decision record while the ledger is still halted.
    pub(crate) fn append_for_recovery(
        &self,
        _ticket: RecoveryWriteTicket,
        candidate: &CandidateRecord,
    ) -> Result<Record, AppendError> {
        let now_ms = self.clock.now_ms();
        let head = self.store.head()?;
        let stakes = self
            .catalog
            .stakes_of(&candidate.record_type)
            .unwrap_or(StakesClass::High);
        let prepared = self.prepare(candidate, head.content_hash, stakes, now_ms)?;

        let record = self
            .store
            .commit_halt_exempt(&prepared)
            .map_err(map_commit_error)?;
        tracing::info!(
            sequence = record.sequence,
            record_type = %record.record_type,
            "recovery record committed"
        );
        Ok(record)
    }

    /// Builds the fully signed and witnessed [`PreparedRecord`] for a
    /// candidate at a specific chain position.
    fn prepare(
        &self,
        candidate: &CandidateRecord,
        prior_hash: Hash,
        stakes: StakesClass,
        now_ms: u64,
    ) -> Result<PreparedRecord, AppendError> {
        let canonical = canonical_record_bytes(
            &candidate.record_type,
            candidate.schema_version,
            &candidate.payload,
            &prior_hash,
        )?;
        let content_hash = ChainHasher::content_hash(&canonical);

        let writer_signature =
            sign_with_domain(&self.signer, RECORD_COMMIT_PREFIX, &content_hash).to_bytes();

        // Witness attestation, bounded by the coordinator's timeout.
        // If this fails, nothing has touched storage.
        let attestation = self.witnesses.attest(
            &prior_hash,
            &content_hash,
            stakes,
            &self.writer_id,
            now_ms,
        )?;

        Ok(PreparedRecord {
            record_type: candidate.record_type.clone(),
            schema_version: candidate.schema_version,
            payload: candidate.payload.clone(),
            prior_hash,
            content_hash,
            hash_algorithm: HASH_ALGORITHM.to_string(),
            writer_id: self.writer_id.clone(),
            writer_signature,
            witness_id: attestation.witness_id,
            witness_signature: attestation.signature,
            local_time_ms: now_ms,
            authority_time_ms: self.authority.authority_now_ms(),
        })
    }
}

fn map_commit_error(e: CommitError) -> AppendError {
    match e {
        CommitError::Halted => AppendError::SystemHalted {
            reason: "halt declared during append".to_string(),
        },
        CommitError::HeadMoved {
            current_head,
            current_sequence,
        } => AppendError::ChainContinuityViolation {
            current_head,
            current_sequence,
        },
        CommitError::Storage(e) => AppendError::Storage(e),
    }
}
