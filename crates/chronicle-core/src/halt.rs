//! Dual-channel halt propagation.
//!
//! Halt state travels over two independent channels:
//!
//! - a **durable channel**: the `halt_state` row in the ledger database,
//!   the source of truth;
//! - a **fast channel**: an in-process `tokio::sync::watch` fan-out for
//!   low-latency best-effort propagation to subscribers.
//!
//! Every halt check consults both. If *either* channel reports halted, the
//! caller treats the system as halted — a fail-closed disjunction, never a
//! conjunction. When the channels disagree the discrepancy is logged as an
//! anomaly and the conservative (halted) interpretation wins until
//! [`HaltTransport::reconcile`] aligns the fast channel with the durable
//! one.
//!
//! Clearing a halt is impossible through this transport. The only path that
//! clears the flag is the recovery coordinator's single authorized
//! transition, via a crate-private method.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::store::{DurableHalt, LedgerStore, StoreError};

/// Process-wide halt state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HaltState {
    /// Whether the ledger is halted.
    pub is_halted: bool,

    /// Why the halt was declared.
    pub reason: Option<String>,

    /// Sequences of the records that triggered the halt.
    pub triggering_records: Vec<u64>,

    /// When the halt was declared, milliseconds since epoch.
    pub declared_at_ms: Option<u64>,
}

/// Payload of a `ledger.halt_declared` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltDeclarationPayload {
    /// Why the halt was declared.
    pub reason: String,

    /// Sequences of the records that triggered the halt.
    pub triggering_records: Vec<u64>,

    /// When the halt was declared, milliseconds since epoch.
    pub declared_at_ms: u64,
}

/// Result of consulting both halt channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaltStatus {
    /// Fail-closed combination: true if either channel reports halted.
    pub halted: bool,

    /// True when the fast and durable channels disagreed.
    pub channel_conflict: bool,

    /// The durable (canonical) state.
    pub state: HaltState,

    /// When this status was observed, milliseconds since epoch. Readers use
    /// this to self-report staleness.
    pub observed_at_ms: u64,
}

/// Errors from the halt transport.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HaltError {
    /// The durable channel could not be read or written.
    #[error("durable halt channel failure: {0}")]
    Durable(#[from] StoreError),

    /// The triggering-record list could not be encoded.
    #[error("halt state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Dual-channel halt transport.
pub struct HaltTransport {
    store: Arc<LedgerStore>,
    fast_tx: watch::Sender<HaltState>,
    anomaly_count: AtomicU64,
}

impl HaltTransport {
    /// Creates a transport over the given store, seeding the fast channel
    /// from the durable row so a restart inherits a persisted halt.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable row cannot be read.
    pub fn new(store: Arc<LedgerStore>) -> Result<Self, HaltError> {
        let initial = Self::decode_durable(&store.durable_halt()?)?;
        let (fast_tx, _) = watch::channel(initial);
        Ok(Self {
            store,
            fast_tx,
            anomaly_count: AtomicU64::new(0),
        })
    }

    /// Declares a halt: durable channel first (source of truth), then the
    /// fast channel fan-out.
    ///
    /// Idempotent: re-declaring while already halted keeps the original
    /// declaration.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable write fails. The fast channel is only
    /// updated after the durable write succeeds; callers that must stop the
    /// world even when storage is failing should treat the error itself as
    /// halted (the monitor does).
    pub fn declare(
        &self,
        reason: &str,
        triggering_records: &[u64],
        now_ms: u64,
    ) -> Result<(), HaltError> {
        let current = self.store.durable_halt()?;
        if current.is_halted {
            tracing::debug!(reason, "halt already declared; keeping original declaration");
            return Ok(());
        }

        let state = HaltState {
            is_halted: true,
            reason: Some(reason.to_string()),
            triggering_records: triggering_records.to_vec(),
            declared_at_ms: Some(now_ms),
        };
        self.store.set_durable_halt(&DurableHalt {
            is_halted: true,
            reason: state.reason.clone(),
            triggering_refs_json: Some(serde_json::to_string(&state.triggering_records)?),
            declared_at_ms: state.declared_at_ms,
        })?;

        tracing::error!(
            reason,
            triggering_records = ?triggering_records,
            "ledger halted"
        );
        self.fast_tx.send_replace(state);
        Ok(())
    }

    /// Consults both channels and returns the fail-closed combination.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable channel cannot be read. Callers on
    /// the write path must treat that failure as halted.
    pub fn status(&self, now_ms: u64) -> Result<HaltStatus, HaltError> {
        let durable = Self::decode_durable(&self.store.durable_halt()?)?;
        let fast = self.fast_tx.borrow().clone();

        let channel_conflict = durable.is_halted != fast.is_halted;
        if channel_conflict {
            self.anomaly_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                durable_halted = durable.is_halted,
                fast_halted = fast.is_halted,
                "halt channels disagree; treating as halted until reconciled"
            );
        }

        let halted = durable.is_halted || fast.is_halted;
        // The durable channel is canonical for everything except the
        // conservative halted bit.
        let state = if durable.is_halted || !fast.is_halted {
            durable
        } else {
            fast
        };

        Ok(HaltStatus {
            halted,
            channel_conflict,
            state,
            observed_at_ms: now_ms,
        })
    }

    /// Subscribes to the fast channel.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HaltState> {
        self.fast_tx.subscribe()
    }

    /// Number of channel-disagreement anomalies observed so far.
    #[must_use]
    pub fn anomaly_count(&self) -> u64 {
        self.anomaly_count.load(Ordering::Relaxed)
    }

    /// Aligns the fast channel with the durable channel.
    ///
    /// Called after the configured reconciliation window when a conflict was
    /// observed. Returns `true` if a disagreement was found and repaired.
    ///
    /// Reconciliation never clears the durable flag: if the fast channel
    /// claims halted and the durable channel does not, the durable channel
    /// wins only after this explicit step — until then every status read
    /// reports halted.
    ///
    /// # Errors
    ///
    /// Returns an error if the durable channel cannot be read.
    pub fn reconcile(&self, now_ms: u64) -> Result<bool, HaltError> {
        let durable = Self::decode_durable(&self.store.durable_halt()?)?;
        let fast_halted = self.fast_tx.borrow().is_halted;
        if durable.is_halted == fast_halted {
            return Ok(false);
        }

        tracing::warn!(
            durable_halted = durable.is_halted,
            fast_halted,
            reconciled_at_ms = now_ms,
            "reconciling halt channels to the durable state"
        );
        self.fast_tx.send_replace(durable);
        Ok(true)
    }

    /// Clears both channels. Crate-private: reachable only from the recovery
    /// coordinator's `complete` transition.
    pub(crate) fn clear_for_recovery(&self) -> Result<(), HaltError> {
        self.store.clear_durable_halt()?;
        self.fast_tx.send_replace(HaltState::default());
        tracing::info!("halt cleared by completed recovery");
        Ok(())
    }

    /// Test-and-debug hook: pushes a state onto the fast channel only,
    /// without touching the durable row. Used to exercise channel-conflict
    /// handling.
    #[doc(hidden)]
    pub fn inject_fast_signal(&self, state: HaltState) {
        self.fast_tx.send_replace(state);
    }

    fn decode_durable(durable: &DurableHalt) -> Result<HaltState, HaltError> {
        let triggering_records = match &durable.triggering_refs_json {
            Some(json) => serde_json::from_str(json)?,
            None => Vec::new(),
        };
        Ok(HaltState {
            is_halted: durable.is_halted,
            reason: durable.reason.clone(),
            triggering_records,
            declared_at_ms: durable.declared_at_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HaltTransport {
        let store = Arc::new(LedgerStore::in_memory().unwrap());
        HaltTransport::new(store).unwrap()
    }

    #[test]
    fn starts_not_halted() {
        let transport = transport();
        let status = transport.status(1).unwrap();
        assert!(!status.halted);
        assert!(!status.channel_conflict);
        assert_eq!(status.observed_at_ms, 1);
    }

    #[test]
    fn declare_sets_both_channels() {
        let transport = transport();
        transport.declare("fork detected", &[6, 7], 100).unwrap();

        let status = transport.status(101).unwrap();
        assert!(status.halted);
        assert!(!status.channel_conflict);
        assert_eq!(status.state.reason.as_deref(), Some("fork detected"));
        assert_eq!(status.state.triggering_records, vec![6, 7]);
        assert_eq!(status.state.declared_at_ms, Some(100));
    }

    #[test]
    fn declare_is_idempotent() {
        let transport = transport();
        transport.declare("first", &[1], 100).unwrap();
        transport.declare("second", &[2], 200).unwrap();

        let status = transport.status(201).unwrap();
        assert_eq!(status.state.reason.as_deref(), Some("first"));
    }

    #[test]
    fn either_channel_halted_means_halted() {
        let transport = transport();

        // Fast channel claims halted, durable does not: conflict, but the
        // conservative interpretation wins.
        transport.inject_fast_signal(HaltState {
            is_halted: true,
            reason: Some("spurious".to_string()),
            triggering_records: vec![],
            declared_at_ms: Some(5),
        });

        let status = transport.status(6).unwrap();
        assert!(status.halted);
        assert!(status.channel_conflict);
        assert_eq!(transport.anomaly_count(), 1);
    }

    #[test]
    fn reconcile_aligns_fast_to_durable() {
        let transport = transport();
        transport.inject_fast_signal(HaltState {
            is_halted: true,
            reason: Some("spurious".to_string()),
            triggering_records: vec![],
            declared_at_ms: Some(5),
        });

        assert!(transport.reconcile(10).unwrap());
        let status = transport.status(11).unwrap();
        assert!(!status.halted);
        assert!(!status.channel_conflict);

        // A second reconcile is a no-op.
        assert!(!transport.reconcile(12).unwrap());
    }

    #[test]
    fn clear_is_only_reachable_through_recovery_path() {
        let transport = transport();
        transport.declare("fork detected", &[3], 100).unwrap();

        // The crate-private clear is the only way down.
        transport.clear_for_recovery().unwrap();
        assert!(!transport.status(101).unwrap().halted);
    }

    #[test]
    fn subscribers_observe_declarations() {
        let transport = transport();
        let rx = transport.subscribe();
        assert!(!rx.borrow().is_halted);

        transport.declare("gap detected", &[9], 50).unwrap();
        assert!(rx.borrow().is_halted);
    }

    #[test]
    fn restart_inherits_persisted_halt() {
        let store = Arc::new(LedgerStore::in_memory().unwrap());
        {
            let transport = HaltTransport::new(Arc::clone(&store)).unwrap();
            transport.declare("fork detected", &[2], 10).unwrap();
        }

        // A fresh transport over the same store seeds from the durable row.
        let transport = HaltTransport::new(store).unwrap();
        assert!(transport.status(11).unwrap().halted);
        assert!(transport.fast_tx.borrow().is_halted);
    }
}
