//! The assembled witnessed ledger.
//!
//! [`WitnessedLedger`] wires the store, schema catalog, halt transport,
//! lease manager, witness coordinator, writer, monitor, checkpoint service,
//! query service, and recovery coordinator into one unit. The facade also
//! owns the cross-cutting flows the components deliberately do not know
//! about: lease grants, handoffs, and releases are written to the ledger as
//! witnessed records, and checkpoint cadence is serviced after appends.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::catalog::{CatalogError, SchemaCatalog, SchemaEntry};
use crate::checkpoint::{CheckpointAnchor, CheckpointError, CheckpointService};
use crate::config::{ConfigError, CoreConfig};
use crate::crypto::Signer;
use crate::halt::{HaltError, HaltState, HaltStatus, HaltTransport};
use crate::lease::{
    FencingLease, LeaseError, LeaseGrantPayload, LeaseHandoffPayload, LeaseManager,
    LeaseReleasedPayload,
};
use crate::monitor::{ChainMonitor, HaltRecordPath, ScanOutcome};
use crate::query::QueryService;
use crate::record::{CandidateRecord, Record, system_types};
use crate::recovery::RecoveryCoordinator;
use crate::store::{LedgerStore, StoreError};
use crate::time::{AuthorityClock, SystemClock, TimeSource};
use crate::witness::{WitnessCoordinator, WitnessSigner};
use crate::writer::{AppendError, EventWriter};

/// Errors from the assembled ledger.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LedgerError {
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Schema catalog failure.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Append failure.
    #[error(transparent)]
    Append(#[from] AppendError),

    /// Lease failure.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Halt transport failure.
    #[error(transparent)]
    Halt(#[from] HaltError),

    /// Checkpoint failure.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// System payload encoding failure.
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Builder for [`WitnessedLedger`].
pub struct LedgerBuilder {
    config: CoreConfig,
    writer_id: String,
    writer_signer: Option<Signer>,
    anchor_signer: Option<Signer>,
    recovery_authorities: Vec<String>,
    time_sources: Vec<Arc<dyn TimeSource>>,
    clock: Arc<dyn TimeSource>,
}

impl LedgerBuilder {
    /// Starts a builder for a ledger written by `writer_id`.
    #[must_use]
    pub fn new(writer_id: impl Into<String>) -> Self {
        Self {
            config: CoreConfig::default(),
            writer_id: writer_id.into(),
            writer_signer: None,
            anchor_signer: None,
            recovery_authorities: Vec::new(),
            time_sources: Vec::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the writer's signing key (generated otherwise).
    #[must_use]
    pub fn writer_signer(mut self, signer: Signer) -> Self {
        self.writer_signer = Some(signer);
        self
    }

    /// Sets the checkpoint anchor signing key (generated otherwise).
    #[must_use]
    pub fn anchor_signer(mut self, signer: Signer) -> Self {
        self.anchor_signer = Some(signer);
        self
    }

    /// Registers a recovery authority.
    #[must_use]
    pub fn recovery_authority(mut self, authority_id: impl Into<String>) -> Self {
        self.recovery_authorities.push(authority_id.into());
        self
    }

    /// Adds an independent authority time source.
    #[must_use]
    pub fn time_source(mut self, source: Arc<dyn TimeSource>) -> Self {
        self.time_sources.push(source);
        self
    }

    /// Replaces the local clock. Used by tests to pin time.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens (or creates) a file-backed ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or storage cannot
    /// be initialized.
    pub fn open(self, path: impl AsRef<Path>) -> Result<WitnessedLedger, LedgerError> {
        let store = LedgerStore::open(path)?;
        self.assemble(store)
    }

    /// Opens an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn open_in_memory(self) -> Result<WitnessedLedger, LedgerError> {
        let store = LedgerStore::in_memory()?;
        self.assemble(store)
    }

    fn assemble(self, store: LedgerStore) -> Result<WitnessedLedger, LedgerError> {
        self.config.validate()?;

        let store = Arc::new(store);
        let clock = self.clock;
        let catalog = Arc::new(SchemaCatalog::new());
        catalog.register_system_schemas(clock.now_ms())?;

        let halt = Arc::new(HaltTransport::new(Arc::clone(&store))?);
        let leases = Arc::new(LeaseManager::new());
        let witnesses = Arc::new(WitnessCoordinator::new(self.config.witness.clone()));
        let authority = Arc::new(AuthorityClock::new(self.time_sources));

        let writer = Arc::new(
            EventWriter::new(
                Arc::clone(&store),
                Arc::clone(&catalog),
                Arc::clone(&leases),
                Arc::clone(&witnesses),
                Arc::clone(&halt),
                self.writer_signer.unwrap_or_else(Signer::generate),
                self.writer_id,
                Arc::clone(&authority),
            )
            .with_clock(Arc::clone(&clock)),
        );

        // The monitor writes halt declarations under its own identity and
        // key, through the same witnessed path as everything else.
        let monitor_writer = Arc::new(
            EventWriter::new(
                Arc::clone(&store),
                Arc::clone(&catalog),
                Arc::clone(&leases),
                Arc::clone(&witnesses),
                Arc::clone(&halt),
                Signer::generate(),
                "chain-monitor",
                Arc::clone(&authority),
            )
            .with_clock(Arc::clone(&clock)),
        );
        let monitor = Arc::new(
            ChainMonitor::new(
                Arc::clone(&store),
                Arc::clone(&halt),
                Some(HaltRecordPath {
                    writer: monitor_writer,
                    leases: Arc::clone(&leases),
                }),
                self.config.monitor.clone(),
            )
            .with_clock(Arc::clone(&clock)),
        );

        let checkpoints = Arc::new(CheckpointService::new(
            Arc::clone(&store),
            self.anchor_signer.unwrap_or_else(Signer::generate),
            "checkpoint-service",
            self.config.checkpoint.clone(),
        ));

        let query = Arc::new(
            QueryService::new(
                Arc::clone(&store),
                Arc::clone(&halt),
                Arc::clone(&checkpoints),
                self.config.query.clone(),
            )
            .with_clock(Arc::clone(&clock)),
        );

        let recovery = Arc::new(RecoveryCoordinator::new(
            self.recovery_authorities,
            Arc::clone(&halt),
            Arc::clone(&leases),
            Arc::clone(&writer),
            self.config.recovery.clone(),
        ));

        Ok(WitnessedLedger {
            store,
            catalog,
            halt,
            leases,
            witnesses,
            writer,
            monitor,
            checkpoints,
            query,
            recovery,
            clock,
        })
    }
}

/// Handle to a spawned monitor loop.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Signals the loop to stop and waits for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// The assembled witnessed event ledger.
pub struct WitnessedLedger {
    store: Arc<LedgerStore>,
    catalog: Arc<SchemaCatalog>,
    halt: Arc<HaltTransport>,
    leases: Arc<LeaseManager>,
    witnesses: Arc<WitnessCoordinator>,
    writer: Arc<EventWriter>,
    monitor: Arc<ChainMonitor>,
    checkpoints: Arc<CheckpointService>,
    query: Arc<QueryService>,
    recovery: Arc<RecoveryCoordinator>,
    clock: Arc<dyn TimeSource>,
}

impl WitnessedLedger {
    /// Registers a witness in the live pool.
    pub fn register_witness(&self, witness: Arc<dyn WitnessSigner>) {
        self.witnesses.register(witness);
    }

    /// Registers a collaborator schema in the catalog.
    ///
    /// # Errors
    ///
    /// See [`CatalogError`].
    pub fn register_schema(&self, entry: SchemaEntry) -> Result<(), LedgerError> {
        Ok(self.catalog.register(entry)?)
    }

    /// Acquires the fencing lease for this ledger's writer and records the
    /// grant as a witnessed `ledger.lease_granted` record.
    ///
    /// Fails while halted: the grant record cannot be written, so no lease
    /// is issued.
    ///
    /// # Errors
    ///
    /// See [`LedgerError`].
    pub fn acquire_lease(&self, ttl_ms: u64) -> Result<FencingLease, LedgerError> {
        let now_ms = self.clock.now_ms();
        let lease = self
            .leases
            .acquire(self.writer.writer_id(), ttl_ms, now_ms)?;

        let payload = LeaseGrantPayload {
            lease_id: lease.lease_id,
            epoch: lease.epoch,
            holder_id: lease.holder_id.clone(),
            issued_at_ms: lease.issued_at_ms,
            expires_at_ms: lease.expires_at_ms,
        };
        let candidate = CandidateRecord::new(
            system_types::LEASE_GRANTED,
            1,
            serde_json::to_vec(&payload)?,
        );
        if let Err(e) = self.writer.append(lease.lease_id, &candidate) {
            // No lease without its witnessed grant record.
            let _ = self.leases.release(lease.lease_id);
            return Err(e.into());
        }
        Ok(lease)
    }

    /// Renews the lease (heartbeat; not itself a ledger record).
    ///
    /// # Errors
    ///
    /// See [`LeaseError`].
    pub fn renew_lease(&self, lease_id: u64) -> Result<FencingLease, LedgerError> {
        Ok(self.leases.renew(lease_id, self.clock.now_ms())?)
    }

    /// Releases the lease, recording a witnessed `ledger.lease_released`
    /// record first while the lease is still valid.
    ///
    /// The release itself proceeds even when the record cannot be written
    /// (for example during a halt): a halt must not trap the lease.
    ///
    /// # Errors
    ///
    /// See [`LeaseError`].
    pub fn release_lease(&self, lease_id: u64) -> Result<(), LedgerError> {
        let now_ms = self.clock.now_ms();
        if let Some(current) = self.leases.current() {
            if current.lease_id == lease_id {
                let payload = LeaseReleasedPayload {
                    lease_id,
                    epoch: current.epoch,
                    holder_id: current.holder_id.clone(),
                    released_at_ms: now_ms,
                };
                let candidate = CandidateRecord::new(
                    system_types::LEASE_RELEASED,
                    1,
                    serde_json::to_vec(&payload)?,
                );
                if let Err(e) = self.writer.append(lease_id, &candidate) {
                    tracing::warn!(error = %e, "lease release record not written");
                }
            }
        }
        self.leases.release(lease_id)?;
        Ok(())
    }

    /// Accepts a handoff of the current lease to this ledger's writer and
    /// records it as a witnessed `ledger.lease_handoff` record under the
    /// new lease.
    ///
    /// # Errors
    ///
    /// See [`LedgerError`].
    pub fn accept_handoff(&self, lease_id: u64) -> Result<FencingLease, LedgerError> {
        let now_ms = self.clock.now_ms();
        let previous_holder = self
            .leases
            .current()
            .map_or_else(String::new, |l| l.holder_id);
        let lease = self
            .leases
            .handoff(lease_id, self.writer.writer_id(), now_ms)?;

        let payload = LeaseHandoffPayload {
            lease_id: lease.lease_id,
            epoch: lease.epoch,
            holder_id: lease.holder_id.clone(),
            previous_holder_id: previous_holder,
        };
        let candidate = CandidateRecord::new(
            system_types::LEASE_HANDOFF,
            1,
            serde_json::to_vec(&payload)?,
        );
        if let Err(e) = self.writer.append(lease.lease_id, &candidate) {
            tracing::warn!(error = %e, "lease handoff record not written");
        }
        Ok(lease)
    }

    /// Appends a candidate record under the given lease, then services the
    /// checkpoint cadence.
    ///
    /// # Errors
    ///
    /// See [`AppendError`].
    pub fn append(
        &self,
        lease_id: u64,
        candidate: &CandidateRecord,
    ) -> Result<Record, LedgerError> {
        let record = self.writer.append(lease_id, candidate)?;

        match self.checkpoints.checkpoint_if_due(self.clock.now_ms()) {
            Ok(Some(anchor)) => {
                tracing::debug!(
                    sequence = anchor.sequence_at_checkpoint,
                    "cadence checkpoint created"
                );
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "cadence checkpoint failed"),
        }
        Ok(record)
    }

    /// Creates a checkpoint anchor at the current head.
    ///
    /// # Errors
    ///
    /// See [`CheckpointError`].
    pub fn checkpoint_now(&self) -> Result<CheckpointAnchor, LedgerError> {
        Ok(self.checkpoints.create_checkpoint(self.clock.now_ms())?)
    }

    /// Spawns the monitor poll loop on the current tokio runtime.
    #[must_use]
    pub fn spawn_monitor(&self) -> MonitorHandle {
        let (shutdown, rx) = watch::channel(false);
        let monitor = Arc::clone(&self.monitor);
        let handle = tokio::spawn(monitor.run(rx));
        MonitorHandle { shutdown, handle }
    }

    /// Runs a single monitor scan synchronously.
    ///
    /// # Errors
    ///
    /// See [`StoreError`].
    pub fn scan_once(&self) -> Result<ScanOutcome, LedgerError> {
        Ok(self.monitor.scan_once()?)
    }

    /// Consults the halt transport.
    ///
    /// # Errors
    ///
    /// See [`HaltError`].
    pub fn halt_status(&self) -> Result<HaltStatus, LedgerError> {
        Ok(self.halt.status(self.clock.now_ms())?)
    }

    /// Subscribes to the fast halt channel.
    #[must_use]
    pub fn subscribe_halt(&self) -> watch::Receiver<HaltState> {
        self.halt.subscribe()
    }

    /// The public query service.
    #[must_use]
    pub fn query(&self) -> Arc<QueryService> {
        Arc::clone(&self.query)
    }

    /// The recovery coordinator.
    #[must_use]
    pub fn recovery(&self) -> Arc<RecoveryCoordinator> {
        Arc::clone(&self.recovery)
    }

    /// The checkpoint service.
    #[must_use]
    pub fn checkpoints(&self) -> Arc<CheckpointService> {
        Arc::clone(&self.checkpoints)
    }

    /// The underlying store (advanced read access).
    #[must_use]
    pub fn store(&self) -> Arc<LedgerStore> {
        Arc::clone(&self.store)
    }

    /// The witness coordinator.
    #[must_use]
    pub fn witnesses(&self) -> Arc<WitnessCoordinator> {
        Arc::clone(&self.witnesses)
    }

    /// The lease manager.
    #[must_use]
    pub fn leases(&self) -> Arc<LeaseManager> {
        Arc::clone(&self.leases)
    }
}
