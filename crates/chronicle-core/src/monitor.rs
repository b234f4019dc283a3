//! Continuous sequence and fork monitoring.
//!
//! The monitor scans storage for three shapes of divergence:
//!
//! - **fork**: two persisted records sharing a `prior_hash` (with differing
//!   content, two branches grew from the same prior state);
//! - **sequence gap**: a non-consecutive sequence number — a gap means an
//!   unknown branch may exist, so it is treated identically to a fork;
//! - **link mismatch**: a record whose `prior_hash` does not equal its
//!   predecessor's `content_hash`.
//!
//! On any detection the monitor (a) constructs a halt declaration naming
//! the conflicting records, (b) best-effort submits it through the normal
//! lease/witness/writer path while that path still works, then (c) sets the
//! halt through the transport **regardless** of whether (b) succeeded.
//! Log-then-stop, but stop-even-if-log-fails: a logging failure must never
//! leave the system silently running on a forked chain. If even the durable
//! halt write fails, the fast channel is still raised so in-process writers
//! stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::crypto::{Hash, hex};
use crate::halt::{HaltDeclarationPayload, HaltState, HaltTransport};
use crate::lease::LeaseManager;
use crate::record::{CandidateRecord, system_types};
use crate::store::{LedgerStore, StoreError};
use crate::time::{SystemClock, TimeSource};
use crate::writer::EventWriter;

/// Default poll interval between scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Ceiling on the poll interval; the monitor must run at least this often.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Batch size for the chain walk.
const SCAN_BATCH: u64 = 1024;

/// TTL of the short-lived lease the monitor takes to write the halt record.
const HALT_RECORD_LEASE_TTL_MS: u64 = 30_000;

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between scans. Ceiling-enforced by `CoreConfig::validate`.
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A detected chain violation. Every variant is fork-equivalent: fatal,
/// never retryable, resolved only through recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainViolation {
    /// Two or more persisted records share the same prior hash.
    Fork {
        /// The shared prior hash.
        prior_hash: Hash,
        /// The (sequence, content hash) members of the divergent group.
        records: Vec<(u64, Hash)>,
    },

    /// A sequence number was skipped.
    SequenceGap {
        /// The expected next sequence.
        expected: u64,
        /// The sequence actually found.
        found: u64,
    },

    /// A record's prior hash does not match its predecessor's content hash.
    LinkMismatch {
        /// The sequence with the broken link.
        sequence: u64,
    },
}

impl ChainViolation {
    /// Human-readable halt reason.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Fork { prior_hash, records } => format!(
                "fork: {} records diverge from prior hash {}",
                records.len(),
                hex::encode(prior_hash)
            ),
            Self::SequenceGap { expected, found } => {
                format!("sequence gap: expected {expected}, found {found}")
            }
            Self::LinkMismatch { sequence } => {
                format!("link mismatch at sequence {sequence}")
            }
        }
    }

    /// Sequences of the records implicated in the violation.
    #[must_use]
    pub fn triggering_records(&self) -> Vec<u64> {
        match self {
            Self::Fork { records, .. } => records.iter().map(|(seq, _)| *seq).collect(),
            Self::SequenceGap { expected, found } => vec![*expected, *found],
            Self::LinkMismatch { sequence } => vec![*sequence],
        }
    }
}

/// Outcome of a single scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// No divergence found.
    Clean,
    /// A violation was found and the halt was raised.
    Halted(ChainViolation),
}

/// The lease/writer path the monitor uses for the best-effort halt record.
pub struct HaltRecordPath {
    /// Writer configured with the monitor's identity and signing key.
    pub writer: Arc<EventWriter>,
    /// The lease manager to take a short-lived lease from.
    pub leases: Arc<LeaseManager>,
}

/// The background sequence and fork monitor.
pub struct ChainMonitor {
    store: Arc<LedgerStore>,
    halt: Arc<HaltTransport>,
    halt_record_path: Option<HaltRecordPath>,
    clock: Arc<dyn TimeSource>,
    config: MonitorConfig,
}

impl ChainMonitor {
    /// Creates a monitor.
    ///
    /// `halt_record_path` is optional: without it the monitor still halts
    /// the system, it just cannot write the witnessed halt record first.
    #[must_use]
    pub fn new(
        store: Arc<LedgerStore>,
        halt: Arc<HaltTransport>,
        halt_record_path: Option<HaltRecordPath>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            halt,
            halt_record_path,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replaces the clock. Used by tests to pin time.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs one scan. Returns the outcome; raising the halt already
    /// happened by the time a [`ScanOutcome::Halted`] is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    pub fn scan_once(&self) -> Result<ScanOutcome, StoreError> {
        if let Some(violation) = self.detect()? {
            self.raise_halt(&violation);
            return Ok(ScanOutcome::Halted(violation));
        }
        Ok(ScanOutcome::Clean)
    }

    /// Runs the poll loop until `shutdown` flips to `true`.
    ///
    /// Storage errors are logged and the loop keeps polling: a read failure
    /// must not stop fork detection.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.scan_once() {
                        Ok(ScanOutcome::Clean) => {}
                        Ok(ScanOutcome::Halted(violation)) => {
                            tracing::error!(reason = %violation.describe(), "monitor halted the ledger");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "monitor scan failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Looks for a violation. Fork groups are checked first (the canonical
    /// divergence shape), then a sequence walk catches gaps and broken
    /// links.
    ///
    /// Violations entirely at or below the most recent recovery decision
    /// record are adjudicated: the completed recovery blessed the chain
    /// state it was written on, and re-halting on the same divergence would
    /// make recovery impossible. Anything newer still halts.
    fn detect(&self) -> Result<Option<ChainViolation>, StoreError> {
        let adjudicated_up_to = self.store.latest_recovery_sequence()?;

        let groups = self.store.find_fork_groups()?;
        for group in groups {
            let newest = group.members.iter().map(|(seq, _)| *seq).max().unwrap_or(0);
            if newest > adjudicated_up_to {
                return Ok(Some(ChainViolation::Fork {
                    prior_hash: group.prior_hash,
                    records: group.members,
                }));
            }
        }

        let mut expected_next = 1u64;
        let mut previous_content: Option<Hash> = None;
        let mut cursor = 0u64;
        loop {
            let rows = self.store.chain_rows_after(cursor, SCAN_BATCH)?;
            if rows.is_empty() {
                break;
            }
            for row in &rows {
                if row.sequence != expected_next && row.sequence > adjudicated_up_to {
                    return Ok(Some(ChainViolation::SequenceGap {
                        expected: expected_next,
                        found: row.sequence,
                    }));
                }
                if let Some(previous) = previous_content {
                    if row.prior_hash != previous && row.sequence > adjudicated_up_to {
                        return Ok(Some(ChainViolation::LinkMismatch {
                            sequence: row.sequence,
                        }));
                    }
                }
                expected_next = row.sequence + 1;
                previous_content = Some(row.content_hash);
            }
            cursor = expected_next - 1;
        }
        Ok(None)
    }

    /// Steps (a)-(c): build the declaration, best-effort write it through
    /// the normal witnessed path, then halt unconditionally.
    fn raise_halt(&self, violation: &ChainViolation) {
        let now_ms = self.clock.now_ms();
        let reason = violation.describe();
        let triggering = violation.triggering_records();

        if self.halt.status(now_ms).map(|s| s.halted).unwrap_or(false) {
            // Already halted; nothing further to declare.
            return;
        }

        self.try_write_halt_record(&reason, &triggering, now_ms);

        if let Err(e) = self.halt.declare(&reason, &triggering, now_ms) {
            // The durable channel is failing. Raise the fast channel anyway:
            // in-process writers must stop even when storage is down.
            tracing::error!(error = %e, "durable halt write failed; raising fast channel only");
            self.halt.inject_fast_signal(HaltState {
                is_halted: true,
                reason: Some(reason),
                triggering_records: triggering,
                declared_at_ms: Some(now_ms),
            });
        }
    }

    /// Best-effort witnessed halt record through the normal append path.
    /// Failure is logged and never blocks the halt itself.
    fn try_write_halt_record(&self, reason: &str, triggering: &[u64], now_ms: u64) {
        let Some(path) = &self.halt_record_path else {
            return;
        };

        let payload = HaltDeclarationPayload {
            reason: reason.to_string(),
            triggering_records: triggering.to_vec(),
            declared_at_ms: now_ms,
        };
        let Ok(payload_bytes) = serde_json::to_vec(&payload) else {
            tracing::warn!("halt declaration payload failed to encode; skipping halt record");
            return;
        };

        let lease = match path
            .leases
            .acquire(path.writer.writer_id(), HALT_RECORD_LEASE_TTL_MS, now_ms)
        {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(error = %e, "could not take lease for halt record; halting without it");
                return;
            }
        };

        let candidate = CandidateRecord::new(system_types::HALT_DECLARED, 1, payload_bytes);
        match path.writer.append(lease.lease_id, &candidate) {
            Ok(record) => {
                tracing::info!(sequence = record.sequence, "halt declaration recorded");
            }
            Err(e) => {
                tracing::warn!(error = %e, "halt record append failed; halting without it");
            }
        }
        if let Err(e) = path.leases.release(lease.lease_id) {
            tracing::debug!(error = %e, "halt record lease release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::params;

    use super::*;
    use crate::canonical::canonical_record_bytes;
    use crate::catalog::SchemaCatalog;
    use crate::crypto::{ChainHasher, HASH_ALGORITHM, Signer};
    use crate::store::PreparedRecord;
    use crate::time::AuthorityClock;
    use crate::witness::{LocalWitness, WitnessConfig, WitnessCoordinator};

    struct FixedClock(u64);

    impl TimeSource for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0
        }

        fn source_id(&self) -> &str {
            "fixed"
        }
    }

    struct Harness {
        store: Arc<LedgerStore>,
        halt: Arc<HaltTransport>,
        leases: Arc<LeaseManager>,
        monitor: ChainMonitor,
    }

    fn harness() -> Harness {
        let store = Arc::new(LedgerStore::in_memory().unwrap());
        let catalog = Arc::new(SchemaCatalog::new());
        catalog.register_system_schemas(0).unwrap();
        let leases = Arc::new(LeaseManager::new());
        let witnesses = Arc::new(WitnessCoordinator::new(WitnessConfig::default()));
        witnesses.register(Arc::new(LocalWitness::generate("witness-0")));
        witnesses.register(Arc::new(LocalWitness::generate("witness-1")));
        let halt = Arc::new(HaltTransport::new(Arc::clone(&store)).unwrap());

        let writer = Arc::new(
            EventWriter::new(
                Arc::clone(&store),
                catalog,
                Arc::clone(&leases),
                witnesses,
                Arc::clone(&halt),
                Signer::generate(),
                "chain-monitor",
                Arc::new(AuthorityClock::empty()),
            )
            .with_clock(Arc::new(FixedClock(5_000))),
        );

        let monitor = ChainMonitor::new(
            Arc::clone(&store),
            Arc::clone(&halt),
            Some(HaltRecordPath {
                writer,
                leases: Arc::clone(&leases),
            }),
            MonitorConfig::default(),
        )
        .with_clock(Arc::new(FixedClock(5_000)));

        Harness {
            store,
            halt,
            leases,
            monitor,
        }
    }

    fn append_direct(store: &LedgerStore, sequence: u64, payload: &[u8], prior: Hash) -> Hash {
        append_typed(store, sequence, "test.event", payload, prior)
    }

    fn append_typed(
        store: &LedgerStore,
        sequence: u64,
        record_type: &str,
        payload: &[u8],
        prior: Hash,
    ) -> Hash {
        let canonical = canonical_record_bytes(record_type, 1, payload, &prior).unwrap();
        let content_hash = ChainHasher::content_hash(&canonical);
        let conn_record = PreparedRecord {
            record_type: record_type.to_string(),
            schema_version: 1,
            payload: payload.to_vec(),
            prior_hash: prior,
            content_hash,
            hash_algorithm: HASH_ALGORITHM.to_string(),
            writer_id: "writer-1".to_string(),
            writer_signature: [0u8; 64],
            witness_id: "witness-0".to_string(),
            witness_signature: [0u8; 64],
            local_time_ms: 0,
            authority_time_ms: None,
        };
        raw_insert(store, sequence, &conn_record);
        content_hash
    }

    fn raw_insert(store: &LedgerStore, sequence: u64, rec: &PreparedRecord) {
        // Direct insert, as a compromised secondary would do.
        let conn = store_conn(store);
        conn.execute(
            "INSERT INTO records (sequence, record_type, schema_version, payload, prior_hash,
                                  content_hash, hash_algorithm, writer_id, writer_signature,
                                  witness_id, witness_signature, local_time_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                i64::try_from(sequence).unwrap(),
                rec.record_type,
                rec.schema_version,
                rec.payload,
                rec.prior_hash.as_slice(),
                rec.content_hash.as_slice(),
                rec.hash_algorithm,
                rec.writer_id,
                rec.writer_signature.as_slice(),
                rec.witness_id,
                rec.witness_signature.as_slice(),
                0i64,
            ],
        )
        .unwrap();
    }

    fn store_conn(store: &LedgerStore) -> std::sync::MutexGuard<'_, rusqlite::Connection> {
        // Test-only access to the underlying connection.
        store.raw_connection()
    }

    #[test]
    fn clean_chain_scans_clean() {
        let h = harness();
        let h1 = append_direct(&h.store, 1, b"one", ChainHasher::GENESIS_PRIOR_HASH);
        append_direct(&h.store, 2, b"two", h1);

        assert_eq!(h.monitor.scan_once().unwrap(), ScanOutcome::Clean);
        assert!(!h.halt.status(1).unwrap().halted);
    }

    #[test]
    fn fork_triggers_halt_and_writes_halt_record() {
        let h = harness();
        let h1 = append_direct(&h.store, 1, b"one", ChainHasher::GENESIS_PRIOR_HASH);
        append_direct(&h.store, 2, b"two", h1);
        // Divergent second child of record 1.
        append_direct(&h.store, 3, b"two-prime", h1);

        let outcome = h.monitor.scan_once().unwrap();
        assert!(matches!(outcome, ScanOutcome::Halted(ChainViolation::Fork { .. })));

        let status = h.halt.status(1).unwrap();
        assert!(status.halted);
        assert_eq!(status.state.triggering_records, vec![2, 3]);

        // The halt declaration went through the witnessed writer path
        // before the halt flag flipped.
        let halt_records = h
            .store
            .read_after(0, 100)
            .unwrap()
            .into_iter()
            .filter(|r| r.record_type == system_types::HALT_DECLARED)
            .count();
        assert_eq!(halt_records, 1);

        // And the monitor's short lease was released again.
        assert!(h.leases.current().is_none());
    }

    #[test]
    fn gap_triggers_halt_like_a_fork() {
        let h = harness();
        let h1 = append_direct(&h.store, 1, b"one", ChainHasher::GENESIS_PRIOR_HASH);
        // Sequence 2 is missing.
        append_direct(&h.store, 3, b"three", h1);

        let outcome = h.monitor.scan_once().unwrap();
        assert_eq!(
            outcome,
            ScanOutcome::Halted(ChainViolation::SequenceGap {
                expected: 2,
                found: 3
            })
        );
        assert!(h.halt.status(1).unwrap().halted);
    }

    #[test]
    fn link_mismatch_triggers_halt() {
        let h = harness();
        append_direct(&h.store, 1, b"one", ChainHasher::GENESIS_PRIOR_HASH);
        // Record 2 claims a prior that is not record 1's content hash.
        append_direct(&h.store, 2, b"two", [9u8; 32]);

        let outcome = h.monitor.scan_once().unwrap();
        assert_eq!(
            outcome,
            ScanOutcome::Halted(ChainViolation::LinkMismatch { sequence: 2 })
        );
        assert!(h.halt.status(1).unwrap().halted);
    }

    #[test]
    fn scan_is_idempotent_once_halted() {
        let h = harness();
        let h1 = append_direct(&h.store, 1, b"one", ChainHasher::GENESIS_PRIOR_HASH);
        append_direct(&h.store, 2, b"two", h1);
        append_direct(&h.store, 3, b"two-prime", h1);

        h.monitor.scan_once().unwrap();
        let first_declared = h.halt.status(1).unwrap().state.declared_at_ms;

        h.monitor.scan_once().unwrap();
        assert_eq!(h.halt.status(2).unwrap().state.declared_at_ms, first_declared);

        // Only one halt record was written.
        let halt_records = h
            .store
            .read_after(0, 100)
            .unwrap()
            .into_iter()
            .filter(|r| r.record_type == system_types::HALT_DECLARED)
            .count();
        assert_eq!(halt_records, 1);
    }

    #[test]
    fn adjudicated_fork_does_not_rehalt_but_new_fork_does() {
        let h = harness();
        let h1 = append_direct(&h.store, 1, b"one", ChainHasher::GENESIS_PRIOR_HASH);
        let h2 = append_direct(&h.store, 2, b"two", h1);
        // The old, adjudicated fork: a divergent second child of record 1.
        append_direct(&h.store, 3, b"two-prime", h1);
        // A completed recovery wrote its decision on top of the forked
        // state; everything at or below it is adjudicated.
        let h4 = append_typed(
            &h.store,
            4,
            system_types::RECOVERY_DECIDED,
            br#"{"canonical_head":2}"#,
            h2,
        );

        // The link break at 3 and the fork {2,3} are both blessed, but the
        // recovery record's own link (prior = content of 2, skipping the
        // forged 3) is also below adjudication. Clean scan.
        assert_eq!(h.monitor.scan_once().unwrap(), ScanOutcome::Clean);
        assert!(!h.halt.status(1).unwrap().halted);

        // A fresh divergence after the recovery still halts.
        append_direct(&h.store, 5, b"five", h4);
        append_direct(&h.store, 6, b"five-prime", h4);
        assert!(matches!(
            h.monitor.scan_once().unwrap(),
            ScanOutcome::Halted(ChainViolation::Fork { .. })
        ));
        assert!(h.halt.status(2).unwrap().halted);
    }

    #[test]
    fn halt_still_raised_when_lease_is_held_elsewhere() {
        let h = harness();
        let h1 = append_direct(&h.store, 1, b"one", ChainHasher::GENESIS_PRIOR_HASH);
        append_direct(&h.store, 2, b"two", h1);
        append_direct(&h.store, 3, b"two-prime", h1);

        // Another writer holds the lease; the monitor cannot take it.
        h.leases.acquire("other-writer", 600_000, 4_000).unwrap();

        let outcome = h.monitor.scan_once().unwrap();
        assert!(matches!(outcome, ScanOutcome::Halted(_)));
        assert!(h.halt.status(1).unwrap().halted);

        // No halt record could be written, but the halt took effect anyway.
        let halt_records = h
            .store
            .read_after(0, 100)
            .unwrap()
            .into_iter()
            .filter(|r| r.record_type == system_types::HALT_DECLARED)
            .count();
        assert_eq!(halt_records, 0);
    }
}
