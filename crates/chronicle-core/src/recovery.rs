//! Recovery coordination: the only way out of a halt.
//!
//! Recovery is a constitutional crisis procedure, not an incident-response
//! shortcut. The state machine is:
//!
//! ```text
//! HALTED -> INVESTIGATING -> AWAITING_UNANIMOUS_APPROVAL -> WAITING_PERIOD -> RECOVERED
//! ```
//!
//! - Advancing past approval requires **every** registered authority;
//!   partial approval holds state. No majority override exists.
//! - The waiting period has a floor measured in days. Configuration can
//!   lengthen it, never shorten it, and the coordinator clamps again at
//!   transition time.
//! - During the waiting period the pending decision is publicly visible and
//!   no writes occur (the system is still halted).
//! - Completing the recovery writes a witnessed recovery record through a
//!   halt-exempt path, begins a new fencing-lease epoch, and clears the
//!   halt — one authorized transition, never a direct flag mutation.
//! - The waiting-period timer is not cancellable by any single actor. Only
//!   a unanimous abandonment vote restarts the investigation, and the
//!   abandonment is itself logged.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::halt::{HaltError, HaltTransport};
use crate::lease::LeaseManager;
use crate::record::{CandidateRecord, Record, system_types};
use crate::writer::{AppendError, EventWriter, RecoveryWriteTicket};

/// Floor on the recovery waiting period: 48 hours.
pub const MIN_WAITING_PERIOD_FLOOR_MS: u64 = 48 * 60 * 60 * 1000;

/// Recovery coordinator configuration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Waiting period between unanimous approval and completion.
    ///
    /// Floor-enforced: values below [`MIN_WAITING_PERIOD_FLOOR_MS`] are
    /// rejected by `CoreConfig::validate` and clamped again here.
    pub waiting_period_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            waiting_period_ms: MIN_WAITING_PERIOD_FLOOR_MS,
        }
    }
}

/// Phases of the recovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPhase {
    /// Halted with no open investigation.
    Halted,
    /// An investigation is open.
    Investigating,
    /// A canonical branch was proposed; approvals are being collected.
    AwaitingUnanimousApproval,
    /// Unanimity reached; the mandatory delay is running.
    WaitingPeriod,
    /// The recovery record was written and the halt cleared.
    Recovered,
}

/// The investigation artifact referencing the conflicting records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkAnalysis {
    /// Human-readable analysis summary.
    pub summary: String,

    /// Sequences of the conflicting records.
    pub conflicting_records: Vec<u64>,
}

/// A proposal naming one branch as canonical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchProposal {
    /// The sequence proposed as the canonical head.
    pub canonical_head: u64,

    /// Why this branch was chosen.
    pub rationale: String,
}

/// Payload of the `ledger.recovery_decided` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDecisionPayload {
    /// The canonical head the recovery settled on.
    pub canonical_head: u64,

    /// Every authority that approved.
    pub approved_by: Vec<String>,

    /// The waiting period that was actually served.
    pub waiting_period_ms: u64,

    /// When the recovery completed, milliseconds since epoch.
    pub decided_at_ms: u64,
}

/// One entry in the coordinator's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryAuditEntry {
    /// When the event happened, milliseconds since epoch.
    pub at_ms: u64,

    /// What happened.
    pub event: String,
}

/// Publicly visible view of the pending recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecovery {
    /// Current phase.
    pub phase: RecoveryPhase,

    /// The open analysis, if any.
    pub analysis: Option<ForkAnalysis>,

    /// The open proposal, if any.
    pub proposal: Option<BranchProposal>,

    /// Authorities that have approved so far.
    pub approvals: Vec<String>,

    /// Authorities that have voted to abandon so far.
    pub abandon_votes: Vec<String>,

    /// When the waiting period ends, if it is running.
    pub waiting_period_ends_at_ms: Option<u64>,
}

/// Errors from recovery operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecoveryError {
    /// The system is not halted; there is nothing to recover from.
    #[error("system is not halted")]
    NotHalted,

    /// The operation is not valid in the current phase.
    #[error("operation requires phase {expected}, current phase is {actual:?}")]
    WrongPhase {
        /// The phase the operation requires.
        expected: &'static str,
        /// The actual phase.
        actual: RecoveryPhase,
    },

    /// The voter is not a registered recovery authority.
    #[error("unknown recovery authority: {authority_id}")]
    UnknownAuthority {
        /// The unknown identity.
        authority_id: String,
    },

    /// This authority already approved.
    #[error("authority {authority_id} already approved")]
    DuplicateApproval {
        /// The duplicate approver.
        authority_id: String,
    },

    /// No recovery authorities are registered.
    #[error("no recovery authorities registered")]
    NoAuthorities,

    /// The analysis names no conflicting records.
    #[error("fork analysis must reference the conflicting records")]
    EmptyAnalysis,

    /// The mandatory delay has not elapsed.
    #[error("waiting period not elapsed: ends at {ends_at_ms}, now {now_ms}")]
    WaitingPeriodNotElapsed {
        /// When the period ends.
        ends_at_ms: u64,
        /// The current time.
        now_ms: u64,
    },

    /// The recovery record could not be written.
    #[error("recovery record write failed: {0}")]
    WriteFailed(#[from] AppendError),

    /// The halt transport failed.
    #[error(transparent)]
    Halt(#[from] HaltError),

    /// The recovery payload could not be encoded.
    #[error("recovery payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct RecoveryState {
    phase: Option<RecoveryPhase>,
    analysis: Option<ForkAnalysis>,
    proposal: Option<BranchProposal>,
    approvals: BTreeSet<String>,
    abandon_votes: BTreeSet<String>,
    waiting_period_ends_at_ms: Option<u64>,
    audit: Vec<RecoveryAuditEntry>,
}

/// Drives the bounded, unanimous, time-delayed recovery procedure.
pub struct RecoveryCoordinator {
    authorities: Vec<String>,
    state: Mutex<RecoveryState>,
    halt: Arc<HaltTransport>,
    leases: Arc<LeaseManager>,
    writer: Arc<EventWriter>,
    config: RecoveryConfig,
}

impl RecoveryCoordinator {
    /// Creates a coordinator over a fixed set of registered authorities.
    #[must_use]
    pub fn new(
        authorities: Vec<String>,
        halt: Arc<HaltTransport>,
        leases: Arc<LeaseManager>,
        writer: Arc<EventWriter>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            authorities,
            state: Mutex::new(RecoveryState::default()),
            halt,
            leases,
            writer,
            config,
        }
    }

    /// The registered recovery authorities.
    #[must_use]
    pub fn authorities(&self) -> &[String] {
        &self.authorities
    }

    /// Returns the publicly visible pending-recovery view.
    #[must_use]
    pub fn pending(&self) -> PendingRecovery {
        let state = self.state.lock().unwrap();
        PendingRecovery {
            phase: state.phase.unwrap_or(RecoveryPhase::Halted),
            analysis: state.analysis.clone(),
            proposal: state.proposal.clone(),
            approvals: state.approvals.iter().cloned().collect(),
            abandon_votes: state.abandon_votes.iter().cloned().collect(),
            waiting_period_ends_at_ms: state.waiting_period_ends_at_ms,
        }
    }

    /// Returns the audit trail.
    #[must_use]
    pub fn audit_trail(&self) -> Vec<RecoveryAuditEntry> {
        self.state.lock().unwrap().audit.clone()
    }

    /// `HALTED -> INVESTIGATING`: an authorized operator opens an
    /// investigation with a fork/gap analysis.
    ///
    /// # Errors
    ///
    /// Returns `NotHalted` if the system is running, `EmptyAnalysis` if the
    /// analysis names no records, or `WrongPhase` if an investigation is
    /// already open.
    pub fn open_investigation(
        &self,
        operator_id: &str,
        analysis: ForkAnalysis,
        now_ms: u64,
    ) -> Result<(), RecoveryError> {
        if self.authorities.is_empty() {
            return Err(RecoveryError::NoAuthorities);
        }
        if !self.halt.status(now_ms)?.halted {
            return Err(RecoveryError::NotHalted);
        }
        if analysis.conflicting_records.is_empty() {
            return Err(RecoveryError::EmptyAnalysis);
        }

        let mut state = self.state.lock().unwrap();
        match state.phase {
            None | Some(RecoveryPhase::Halted) => {}
            Some(actual) => {
                return Err(RecoveryError::WrongPhase {
                    expected: "HALTED",
                    actual,
                });
            }
        }

        tracing::info!(operator_id, "recovery investigation opened");
        state.audit.push(RecoveryAuditEntry {
            at_ms: now_ms,
            event: format!("investigation opened by {operator_id}"),
        });
        state.analysis = Some(analysis);
        state.phase = Some(RecoveryPhase::Investigating);
        Ok(())
    }

    /// `INVESTIGATING -> AWAITING_UNANIMOUS_APPROVAL`: the investigation
    /// proposes one branch as canonical.
    ///
    /// # Errors
    ///
    /// Returns `WrongPhase` outside the investigating phase.
    pub fn propose(&self, proposal: BranchProposal, now_ms: u64) -> Result<(), RecoveryError> {
        let mut state = self.state.lock().unwrap();
        if state.phase != Some(RecoveryPhase::Investigating) {
            return Err(RecoveryError::WrongPhase {
                expected: "INVESTIGATING",
                actual: state.phase.unwrap_or(RecoveryPhase::Halted),
            });
        }

        tracing::info!(
            canonical_head = proposal.canonical_head,
            "canonical branch proposed"
        );
        state.audit.push(RecoveryAuditEntry {
            at_ms: now_ms,
            event: format!("branch proposed: canonical head {}", proposal.canonical_head),
        });
        state.proposal = Some(proposal);
        state.approvals.clear();
        state.phase = Some(RecoveryPhase::AwaitingUnanimousApproval);
        Ok(())
    }

    /// Records one authority's approval. When every registered authority
    /// has approved, the waiting period begins; partial approval holds
    /// state.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAuthority`, `DuplicateApproval`, or `WrongPhase`.
    pub fn approve(&self, authority_id: &str, now_ms: u64) -> Result<RecoveryPhase, RecoveryError> {
        if !self.authorities.iter().any(|a| a == authority_id) {
            return Err(RecoveryError::UnknownAuthority {
                authority_id: authority_id.to_string(),
            });
        }

        let mut state = self.state.lock().unwrap();
        if state.phase != Some(RecoveryPhase::AwaitingUnanimousApproval) {
            return Err(RecoveryError::WrongPhase {
                expected: "AWAITING_UNANIMOUS_APPROVAL",
                actual: state.phase.unwrap_or(RecoveryPhase::Halted),
            });
        }
        if !state.approvals.insert(authority_id.to_string()) {
            return Err(RecoveryError::DuplicateApproval {
                authority_id: authority_id.to_string(),
            });
        }

        state.audit.push(RecoveryAuditEntry {
            at_ms: now_ms,
            event: format!("approved by {authority_id}"),
        });

        if state.approvals.len() == self.authorities.len() {
            let waiting = self.effective_waiting_period_ms();
            let ends_at = now_ms + waiting;
            state.waiting_period_ends_at_ms = Some(ends_at);
            state.phase = Some(RecoveryPhase::WaitingPeriod);
            state.audit.push(RecoveryAuditEntry {
                at_ms: now_ms,
                event: format!("unanimous approval; waiting period ends at {ends_at}"),
            });
            tracing::info!(ends_at_ms = ends_at, "unanimous approval; waiting period started");
            Ok(RecoveryPhase::WaitingPeriod)
        } else {
            tracing::info!(
                approvals = state.approvals.len(),
                required = self.authorities.len(),
                "partial approval; holding state"
            );
            Ok(RecoveryPhase::AwaitingUnanimousApproval)
        }
    }

    /// Records one authority's vote to abandon the pending recovery. Only a
    /// unanimous abandonment restarts the investigation; the timer is not
    /// cancellable by any single actor.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAuthority` or `WrongPhase` (there is nothing to
    /// abandon before a proposal or after completion).
    pub fn vote_abandon(
        &self,
        authority_id: &str,
        now_ms: u64,
    ) -> Result<RecoveryPhase, RecoveryError> {
        if !self.authorities.iter().any(|a| a == authority_id) {
            return Err(RecoveryError::UnknownAuthority {
                authority_id: authority_id.to_string(),
            });
        }

        let mut state = self.state.lock().unwrap();
        match state.phase {
            Some(RecoveryPhase::AwaitingUnanimousApproval | RecoveryPhase::WaitingPeriod) => {}
            other => {
                return Err(RecoveryError::WrongPhase {
                    expected: "AWAITING_UNANIMOUS_APPROVAL or WAITING_PERIOD",
                    actual: other.unwrap_or(RecoveryPhase::Halted),
                });
            }
        }

        state.abandon_votes.insert(authority_id.to_string());
        state.audit.push(RecoveryAuditEntry {
            at_ms: now_ms,
            event: format!("abandonment vote by {authority_id}"),
        });

        if state.abandon_votes.len() == self.authorities.len() {
            tracing::warn!("unanimous abandonment; restarting investigation");
            state.audit.push(RecoveryAuditEntry {
                at_ms: now_ms,
                event: "pending recovery abandoned unanimously".to_string(),
            });
            state.phase = Some(RecoveryPhase::Halted);
            state.analysis = None;
            state.proposal = None;
            state.approvals.clear();
            state.abandon_votes.clear();
            state.waiting_period_ends_at_ms = None;
            Ok(RecoveryPhase::Halted)
        } else {
            Ok(state.phase.unwrap_or(RecoveryPhase::Halted))
        }
    }

    /// `WAITING_PERIOD -> RECOVERED`: after the delay elapses, writes the
    /// witnessed recovery record, begins a new fencing-lease epoch, and
    /// clears the halt — one authorized transition.
    ///
    /// # Errors
    ///
    /// Returns `WaitingPeriodNotElapsed` before the deadline, `WrongPhase`
    /// outside the waiting period, or the underlying write/halt errors.
    pub fn complete(&self, now_ms: u64) -> Result<Record, RecoveryError> {
        let (canonical_head, approved_by, ends_at) = {
            let state = self.state.lock().unwrap();
            if state.phase != Some(RecoveryPhase::WaitingPeriod) {
                return Err(RecoveryError::WrongPhase {
                    expected: "WAITING_PERIOD",
                    actual: state.phase.unwrap_or(RecoveryPhase::Halted),
                });
            }
            let ends_at = state.waiting_period_ends_at_ms.unwrap_or(u64::MAX);
            if now_ms < ends_at {
                return Err(RecoveryError::WaitingPeriodNotElapsed {
                    ends_at_ms: ends_at,
                    now_ms,
                });
            }
            (
                state.proposal.as_ref().map_or(0, |p| p.canonical_head),
                state.approvals.iter().cloned().collect::<Vec<_>>(),
                ends_at,
            )
        };

        let payload = RecoveryDecisionPayload {
            canonical_head,
            approved_by,
            waiting_period_ms: self.effective_waiting_period_ms(),
            decided_at_ms: now_ms,
        };
        let candidate = CandidateRecord::new(
            system_types::RECOVERY_DECIDED,
            1,
            serde_json::to_vec(&payload)?,
        );

        // The ledger is still halted here; the recovery record goes through
        // the halt-exempt path and is witnessed like any other record.
        let record = self
            .writer
            .append_for_recovery(RecoveryWriteTicket(()), &candidate)?;

        let epoch = self.leases.begin_new_epoch();
        self.halt.clear_for_recovery()?;

        let mut state = self.state.lock().unwrap();
        state.phase = Some(RecoveryPhase::Recovered);
        state.waiting_period_ends_at_ms = None;
        state.audit.push(RecoveryAuditEntry {
            at_ms: now_ms,
            event: format!(
                "recovery completed at sequence {}; lease epoch {epoch}; waited until {ends_at}",
                record.sequence
            ),
        });
        tracing::info!(
            sequence = record.sequence,
            epoch,
            "recovery completed; ledger reopened"
        );
        Ok(record)
    }

    fn effective_waiting_period_ms(&self) -> u64 {
        self.config.waiting_period_ms.max(MIN_WAITING_PERIOD_FLOOR_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SchemaCatalog;
    use crate::crypto::Signer;
    use crate::record::system_types;
    use crate::store::LedgerStore;
    use crate::time::{AuthorityClock, TimeSource};
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
        coordinator: RecoveryCoordinator,
    }

    fn harness(authorities: &[&str]) -> Harness {
        let store = Arc::new(LedgerStore::in_memory().unwrap());
        let catalog = Arc::new(SchemaCatalog::new());
        catalog.register_system_schemas(0).unwrap();
        let leases = Arc::new(LeaseManager::new());
        let witnesses = Arc::new(WitnessCoordinator::new(WitnessConfig::default()));
        witnesses.register(Arc::new(LocalWitness::generate("witness-0")));
        witnesses.register(Arc::new(LocalWitness::generate("witness-1")));
        let halt = Arc::new(HaltTransport::new(Arc::clone(&store)).unwrap());
        halt.declare("fork detected", &[2, 3], 100).unwrap();

        let writer = Arc::new(
            EventWriter::new(
                Arc::clone(&store),
                catalog,
                Arc::clone(&leases),
                witnesses,
                Arc::clone(&halt),
                Signer::generate(),
                "recovery-writer",
                Arc::new(AuthorityClock::empty()),
            )
            .with_clock(Arc::new(FixedClock(200))),
        );

        let coordinator = RecoveryCoordinator::new(
            authorities.iter().map(|a| (*a).to_string()).collect(),
            Arc::clone(&halt),
            Arc::clone(&leases),
            writer,
            RecoveryConfig::default(),
        );

        Harness {
            store,
            halt,
            leases,
            coordinator,
        }
    }

    fn analysis() -> ForkAnalysis {
        ForkAnalysis {
            summary: "records 2 and 3 diverge from record 1".to_string(),
            conflicting_records: vec![2, 3],
        }
    }

    fn proposal() -> BranchProposal {
        BranchProposal {
            canonical_head: 2,
            rationale: "branch through record 2 carries the valid witness set".to_string(),
        }
    }

    fn advance_to_waiting(h: &Harness, authorities: &[&str]) -> u64 {
        h.coordinator.open_investigation("operator-1", analysis(), 200).unwrap();
        h.coordinator.propose(proposal(), 300).unwrap();
        for authority in authorities {
            h.coordinator.approve(authority, 400).unwrap();
        }
        h.coordinator
            .pending()
            .waiting_period_ends_at_ms
            .expect("waiting period should be running")
    }

    #[test]
    fn investigation_requires_halt() {
        let h = harness(&["alpha", "beta"]);
        h.halt.clear_for_recovery().unwrap();

        assert!(matches!(
            h.coordinator.open_investigation("op", analysis(), 200),
            Err(RecoveryError::NotHalted)
        ));
    }

    #[test]
    fn investigation_requires_conflicting_records() {
        let h = harness(&["alpha"]);
        let empty = ForkAnalysis {
            summary: "nothing".to_string(),
            conflicting_records: vec![],
        };
        assert!(matches!(
            h.coordinator.open_investigation("op", empty, 200),
            Err(RecoveryError::EmptyAnalysis)
        ));
    }

    #[test]
    fn partial_approval_holds_state() {
        let h = harness(&["alpha", "beta", "gamma"]);
        h.coordinator.open_investigation("op", analysis(), 200).unwrap();
        h.coordinator.propose(proposal(), 300).unwrap();

        assert_eq!(
            h.coordinator.approve("alpha", 400).unwrap(),
            RecoveryPhase::AwaitingUnanimousApproval
        );
        assert_eq!(
            h.coordinator.approve("beta", 401).unwrap(),
            RecoveryPhase::AwaitingUnanimousApproval
        );
        assert_eq!(
            h.coordinator.pending().phase,
            RecoveryPhase::AwaitingUnanimousApproval
        );

        // The last authority tips it over.
        assert_eq!(
            h.coordinator.approve("gamma", 402).unwrap(),
            RecoveryPhase::WaitingPeriod
        );
    }

    #[test]
    fn unknown_and_duplicate_approvals_rejected() {
        let h = harness(&["alpha", "beta"]);
        h.coordinator.open_investigation("op", analysis(), 200).unwrap();
        h.coordinator.propose(proposal(), 300).unwrap();

        assert!(matches!(
            h.coordinator.approve("intruder", 400),
            Err(RecoveryError::UnknownAuthority { .. })
        ));
        h.coordinator.approve("alpha", 400).unwrap();
        assert!(matches!(
            h.coordinator.approve("alpha", 401),
            Err(RecoveryError::DuplicateApproval { .. })
        ));
    }

    #[test]
    fn waiting_period_floor_is_enforced() {
        let store = Arc::new(LedgerStore::in_memory().unwrap());
        let catalog = Arc::new(SchemaCatalog::new());
        catalog.register_system_schemas(0).unwrap();
        let leases = Arc::new(LeaseManager::new());
        let witnesses = Arc::new(WitnessCoordinator::new(WitnessConfig::default()));
        witnesses.register(Arc::new(LocalWitness::generate("witness-0")));
        witnesses.register(Arc::new(LocalWitness::generate("witness-1")));
        let halt = Arc::new(HaltTransport::new(Arc::clone(&store)).unwrap());
        halt.declare("fork detected", &[2], 100).unwrap();
        let writer = Arc::new(EventWriter::new(
            Arc::clone(&store),
            catalog,
            Arc::clone(&leases),
            witnesses,
            Arc::clone(&halt),
            Signer::generate(),
            "recovery-writer",
            Arc::new(AuthorityClock::empty()),
        ));

        // A config below the floor is clamped up.
        let coordinator = RecoveryCoordinator::new(
            vec!["alpha".to_string()],
            halt,
            leases,
            writer,
            RecoveryConfig {
                waiting_period_ms: 1,
            },
        );
        coordinator.open_investigation("op", analysis(), 200).unwrap();
        coordinator.propose(proposal(), 300).unwrap();
        coordinator.approve("alpha", 1_000).unwrap();

        assert_eq!(
            coordinator.pending().waiting_period_ends_at_ms,
            Some(1_000 + MIN_WAITING_PERIOD_FLOOR_MS)
        );
    }

    #[test]
    fn complete_before_delay_fails_even_with_unanimity() {
        let authorities = ["alpha", "beta"];
        let h = harness(&authorities);
        let ends_at = advance_to_waiting(&h, &authorities);

        assert!(matches!(
            h.coordinator.complete(ends_at - 1),
            Err(RecoveryError::WaitingPeriodNotElapsed { .. })
        ));
        // The system is still halted throughout the window.
        assert!(h.halt.status(ends_at - 1).unwrap().halted);
    }

    #[test]
    fn complete_writes_record_bumps_epoch_clears_halt() {
        let authorities = ["alpha", "beta"];
        let h = harness(&authorities);
        let ends_at = advance_to_waiting(&h, &authorities);
        let epoch_before = h.leases.epoch();

        let record = h.coordinator.complete(ends_at).unwrap();
        assert_eq!(record.record_type, system_types::RECOVERY_DECIDED);

        let payload: RecoveryDecisionPayload = serde_json::from_slice(&record.payload).unwrap();
        assert_eq!(payload.canonical_head, 2);
        assert_eq!(payload.approved_by, vec!["alpha", "beta"]);

        assert_eq!(h.leases.epoch(), epoch_before + 1);
        assert!(!h.halt.status(ends_at + 1).unwrap().halted);
        assert_eq!(h.coordinator.pending().phase, RecoveryPhase::Recovered);

        // The recovery record is durably in the store, witnessed.
        let stored = h.store.read_one(record.sequence).unwrap();
        assert_eq!(stored.record_type, system_types::RECOVERY_DECIDED);
        assert!(!stored.witness_id.is_empty());
    }

    #[test]
    fn no_phase_skips_exist() {
        let h = harness(&["alpha"]);

        // Cannot propose without an investigation.
        assert!(matches!(
            h.coordinator.propose(proposal(), 1),
            Err(RecoveryError::WrongPhase { .. })
        ));
        // Cannot approve without a proposal.
        assert!(matches!(
            h.coordinator.approve("alpha", 1),
            Err(RecoveryError::WrongPhase { .. })
        ));
        // Cannot complete without unanimity.
        assert!(matches!(
            h.coordinator.complete(u64::MAX),
            Err(RecoveryError::WrongPhase { .. })
        ));
    }

    #[test]
    fn single_abandon_vote_holds_unanimous_vote_restarts() {
        let authorities = ["alpha", "beta"];
        let h = harness(&authorities);
        advance_to_waiting(&h, &authorities);

        // One vote does not cancel the timer.
        assert_eq!(
            h.coordinator.vote_abandon("alpha", 500).unwrap(),
            RecoveryPhase::WaitingPeriod
        );
        assert!(h.coordinator.pending().waiting_period_ends_at_ms.is_some());

        // Unanimous abandonment restarts the investigation.
        assert_eq!(
            h.coordinator.vote_abandon("beta", 501).unwrap(),
            RecoveryPhase::Halted
        );
        let pending = h.coordinator.pending();
        assert_eq!(pending.phase, RecoveryPhase::Halted);
        assert!(pending.proposal.is_none());
        assert!(pending.waiting_period_ends_at_ms.is_none());

        // The abandonment is logged.
        assert!(
            h.coordinator
                .audit_trail()
                .iter()
                .any(|e| e.event.contains("abandoned unanimously"))
        );
    }
}
