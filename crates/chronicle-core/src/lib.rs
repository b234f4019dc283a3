//! chronicle-core: an append-only, witness-attested, hash-chained event
//! ledger with fencing-lease write exclusivity, continuous fork detection,
//! dual-channel halt propagation, and a deliberately expensive recovery
//! procedure.
//!
//! # Guarantees
//!
//! - **One chain.** Every record names its predecessor by content hash; all
//!   chain mutation goes through a serialized compare-and-append, so two
//!   concurrent writers referencing the same prior state cannot both
//!   succeed.
//! - **No record without a witness.** A second accountable party co-signs
//!   every content hash before the commit; if attestation fails, nothing is
//!   persisted.
//! - **Loud failure.** A background monitor scans for forks, gaps, and
//!   broken links. Any divergence halts writes over two independent
//!   channels, combined fail-closed — and reads keep working so the damage
//!   is auditable.
//! - **Expensive recovery.** Leaving a halt requires an investigation, a
//!   unanimous vote of every registered authority, and a floor-enforced
//!   waiting period measured in days. There is no shortcut.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chronicle_core::{CandidateRecord, LedgerBuilder, LocalWitness};
//!
//! # fn main() -> Result<(), chronicle_core::LedgerError> {
//! let ledger = LedgerBuilder::new("writer-1")
//!     .recovery_authority("steward-a")
//!     .recovery_authority("steward-b")
//!     .open("/var/lib/chronicle/ledger.db")?;
//! ledger.register_witness(Arc::new(LocalWitness::generate("witness-0")));
//! ledger.register_witness(Arc::new(LocalWitness::generate("witness-1")));
//!
//! let lease = ledger.acquire_lease(30_000)?;
//! let record = ledger.append(
//!     lease.lease_id,
//!     &CandidateRecord::new("motion.filed", 1, br#"{"motion":"adopt"}"#.to_vec()),
//! )?;
//! println!("committed sequence {}", record.sequence);
//! # Ok(())
//! # }
//! ```

pub mod canonical;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod crypto;
pub mod halt;
pub mod lease;
pub mod ledger;
pub mod monitor;
pub mod query;
pub mod record;
pub mod recovery;
pub mod store;
pub mod time;
pub mod witness;
pub mod writer;

pub use canonical::{CanonicalError, ENCODING_VERSION, canonical_record_bytes};
pub use catalog::{CatalogError, SchemaCatalog, SchemaEntry, StakesClass};
pub use checkpoint::{
    CheckpointAnchor, CheckpointConfig, CheckpointError, CheckpointService, InclusionProof,
    ProofError, verify_inclusion,
};
pub use config::{ConfigError, CoreConfig, HaltConfig};
pub use crypto::{ChainHasher, HASH_ALGORITHM, HASH_SIZE, Hash, Signer, VerifyingKey};
pub use halt::{HaltDeclarationPayload, HaltError, HaltState, HaltStatus, HaltTransport};
pub use lease::{FencingLease, LeaseError, LeaseGrantPayload, LeaseManager};
pub use ledger::{LedgerBuilder, LedgerError, MonitorHandle, WitnessedLedger};
pub use monitor::{ChainMonitor, ChainViolation, MonitorConfig, ScanOutcome};
pub use query::{AsOfView, Page, QueryError, QueryRateConfig, QueryService};
pub use record::{CandidateRecord, Record, system_types};
pub use recovery::{
    BranchProposal, ForkAnalysis, PendingRecovery, RecoveryConfig, RecoveryCoordinator,
    RecoveryError, RecoveryPhase,
};
pub use store::{ChainHead, CommitError, LedgerReader, LedgerStore, StoreError};
pub use time::{AuthorityClock, SystemClock, TimeSource};
pub use witness::{
    Attestation, LocalWitness, WitnessAvailability, WitnessConfig, WitnessCoordinator,
    WitnessError, WitnessSigner,
};
pub use writer::{AppendError, EventWriter};
