//! Fencing lease manager: exclusive write permission.
//!
//! A fencing lease is a monotonically numbered exclusivity credential. At
//! most one lease is valid at any instant; a writer presenting an expired or
//! superseded `lease_id` is rejected. Lease numbers never decrease, so a
//! stale holder that wakes up after a handoff can always be identified.
//!
//! Lease issuance, handoff, and release are themselves witnessed ledger
//! records (written by the [`crate::ledger::WitnessedLedger`] facade), so a
//! lease coup is externally visible — the manager's in-memory state is never
//! the only evidence.
//!
//! Epochs partition lease history across recoveries: completing a recovery
//! begins a new epoch and revokes whatever lease existed before the halt.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from lease operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LeaseError {
    /// A valid lease is already held.
    #[error("lease held by {holder_id} until {expires_at_ms}")]
    LeaseHeld {
        /// Current holder.
        holder_id: String,
        /// When the current lease expires.
        expires_at_ms: u64,
    },

    /// The presented lease has expired.
    #[error("lease {lease_id} expired at {expired_at_ms}")]
    LeaseExpired {
        /// The expired lease id.
        lease_id: u64,
        /// When it expired.
        expired_at_ms: u64,
    },

    /// The presented lease was superseded by a newer one.
    #[error("lease {lease_id} superseded by lease {current_lease_id}")]
    LeaseSuperseded {
        /// The stale lease id.
        lease_id: u64,
        /// The currently valid lease id.
        current_lease_id: u64,
    },

    /// No lease with this id is known to the manager.
    #[error("unknown lease: {lease_id}")]
    UnknownLease {
        /// The unknown lease id.
        lease_id: u64,
    },

    /// The holder does not match the lease.
    #[error("lease {lease_id} is not held by {presented_holder}")]
    HolderMismatch {
        /// The lease id presented.
        lease_id: u64,
        /// The identity that presented it.
        presented_holder: String,
    },

    /// The requested TTL is zero.
    #[error("lease ttl must be non-zero")]
    InvalidTtl,
}

/// An exclusive write-permission token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FencingLease {
    /// Monotonic lease number, never reused.
    pub lease_id: u64,

    /// Lease epoch; a new epoch begins when a recovery completes.
    pub epoch: u64,

    /// Identity of the holder.
    pub holder_id: String,

    /// Issue timestamp, milliseconds since epoch.
    pub issued_at_ms: u64,

    /// Expiry timestamp, milliseconds since epoch.
    pub expires_at_ms: u64,

    /// Renewal extension applied on each successful heartbeat.
    pub ttl_ms: u64,
}

impl FencingLease {
    /// Returns `true` if the lease is valid at the given time:
    /// `issued_at_ms <= now_ms < expires_at_ms`.
    #[must_use]
    pub const fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms >= self.issued_at_ms && now_ms < self.expires_at_ms
    }
}

/// Payload of a `ledger.lease_granted` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrantPayload {
    /// The granted lease id.
    pub lease_id: u64,
    /// The lease epoch.
    pub epoch: u64,
    /// The new holder.
    pub holder_id: String,
    /// Issue timestamp.
    pub issued_at_ms: u64,
    /// Expiry timestamp.
    pub expires_at_ms: u64,
}

/// Payload of a `ledger.lease_handoff` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseHandoffPayload {
    /// The newly issued lease id.
    pub lease_id: u64,
    /// The lease epoch.
    pub epoch: u64,
    /// The new holder.
    pub holder_id: String,
    /// The holder that handed the lease off.
    pub previous_holder_id: String,
}

/// Payload of a `ledger.lease_released` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseReleasedPayload {
    /// The released lease id.
    pub lease_id: u64,
    /// The lease epoch.
    pub epoch: u64,
    /// The holder that released it.
    pub holder_id: String,
    /// Release timestamp.
    pub released_at_ms: u64,
}

#[derive(Debug, Default)]
struct LeaseState {
    epoch: u64,
    next_lease_id: u64,
    current: Option<FencingLease>,
}

/// Grants and validates fencing leases.
pub struct LeaseManager {
    state: Mutex<LeaseState>,
}

impl LeaseManager {
    /// Creates a manager with no outstanding lease, starting at epoch 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LeaseState {
                epoch: 1,
                next_lease_id: 1,
                current: None,
            }),
        }
    }

    /// Acquires the lease for `candidate_id`.
    ///
    /// # Errors
    ///
    /// Returns `LeaseHeld` if a valid lease exists (including one held by
    /// the same identity — holders renew, they do not re-acquire), or
    /// `InvalidTtl` for a zero TTL.
    pub fn acquire(
        &self,
        candidate_id: &str,
        ttl_ms: u64,
        now_ms: u64,
    ) -> Result<FencingLease, LeaseError> {
        if ttl_ms == 0 {
            return Err(LeaseError::InvalidTtl);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(current) = &state.current {
            if current.is_valid_at(now_ms) {
                return Err(LeaseError::LeaseHeld {
                    holder_id: current.holder_id.clone(),
                    expires_at_ms: current.expires_at_ms,
                });
            }
        }

        let lease = FencingLease {
            lease_id: state.next_lease_id,
            epoch: state.epoch,
            holder_id: candidate_id.to_string(),
            issued_at_ms: now_ms,
            expires_at_ms: now_ms + ttl_ms,
            ttl_ms,
        };
        state.next_lease_id += 1;
        state.current = Some(lease.clone());

        tracing::info!(
            lease_id = lease.lease_id,
            epoch = lease.epoch,
            holder_id = %lease.holder_id,
            expires_at_ms = lease.expires_at_ms,
            "lease acquired"
        );
        Ok(lease)
    }

    /// Renews the lease before expiry, extending it by its TTL.
    ///
    /// # Errors
    ///
    /// Returns `LeaseExpired` if the renewal arrives at or after
    /// `expires_at_ms`, `LeaseSuperseded` if a newer lease exists, or
    /// `UnknownLease`.
    pub fn renew(&self, lease_id: u64, now_ms: u64) -> Result<FencingLease, LeaseError> {
        let mut state = self.state.lock().unwrap();
        let current = state.current.as_mut().ok_or(LeaseError::UnknownLease { lease_id })?;

        if current.lease_id != lease_id {
            return Err(Self::stale_error(lease_id, current.lease_id));
        }
        if now_ms >= current.expires_at_ms {
            return Err(LeaseError::LeaseExpired {
                lease_id,
                expired_at_ms: current.expires_at_ms,
            });
        }

        current.expires_at_ms = now_ms + current.ttl_ms;
        tracing::debug!(
            lease_id,
            expires_at_ms = current.expires_at_ms,
            "lease renewed"
        );
        Ok(current.clone())
    }

    /// Releases the lease.
    ///
    /// # Errors
    ///
    /// Returns `UnknownLease` or `LeaseSuperseded` if `lease_id` is not the
    /// current lease.
    pub fn release(&self, lease_id: u64) -> Result<FencingLease, LeaseError> {
        let mut state = self.state.lock().unwrap();
        match &state.current {
            Some(current) if current.lease_id == lease_id => {
                let released = current.clone();
                state.current = None;
                tracing::info!(lease_id, holder_id = %released.holder_id, "lease released");
                Ok(released)
            }
            Some(current) => Err(Self::stale_error(lease_id, current.lease_id)),
            None => Err(LeaseError::UnknownLease { lease_id }),
        }
    }

    /// Hands the lease off to a new holder, superseding the old lease with
    /// a freshly numbered one.
    ///
    /// # Errors
    ///
    /// Returns `UnknownLease`/`LeaseSuperseded`/`LeaseExpired` if the
    /// presented lease is not the current valid lease.
    pub fn handoff(
        &self,
        lease_id: u64,
        new_holder_id: &str,
        now_ms: u64,
    ) -> Result<FencingLease, LeaseError> {
        let mut state = self.state.lock().unwrap();
        let current = state.current.as_ref().ok_or(LeaseError::UnknownLease { lease_id })?;

        if current.lease_id != lease_id {
            return Err(Self::stale_error(lease_id, current.lease_id));
        }
        if !current.is_valid_at(now_ms) {
            return Err(LeaseError::LeaseExpired {
                lease_id,
                expired_at_ms: current.expires_at_ms,
            });
        }

        let ttl_ms = current.ttl_ms;
        let lease = FencingLease {
            lease_id: state.next_lease_id,
            epoch: state.epoch,
            holder_id: new_holder_id.to_string(),
            issued_at_ms: now_ms,
            expires_at_ms: now_ms + ttl_ms,
            ttl_ms,
        };
        state.next_lease_id += 1;
        state.current = Some(lease.clone());

        tracing::info!(
            lease_id = lease.lease_id,
            superseded = lease_id,
            holder_id = %lease.holder_id,
            "lease handed off"
        );
        Ok(lease)
    }

    /// Validates that `lease_id` is the current valid lease held by
    /// `holder_id` at `now_ms`.
    ///
    /// The writer calls this immediately before commit regardless of any
    /// earlier validation — a lease that lapses mid-operation fails here
    /// (defense in depth).
    ///
    /// # Errors
    ///
    /// See [`LeaseError`].
    pub fn validate(
        &self,
        lease_id: u64,
        holder_id: &str,
        now_ms: u64,
    ) -> Result<(), LeaseError> {
        let state = self.state.lock().unwrap();
        let current = state.current.as_ref().ok_or(LeaseError::UnknownLease { lease_id })?;

        if current.lease_id != lease_id {
            return Err(Self::stale_error(lease_id, current.lease_id));
        }
        if current.holder_id != holder_id {
            return Err(LeaseError::HolderMismatch {
                lease_id,
                presented_holder: holder_id.to_string(),
            });
        }
        if !current.is_valid_at(now_ms) {
            return Err(LeaseError::LeaseExpired {
                lease_id,
                expired_at_ms: current.expires_at_ms,
            });
        }
        Ok(())
    }

    /// Returns the current lease, valid or not.
    #[must_use]
    pub fn current(&self) -> Option<FencingLease> {
        self.state.lock().unwrap().current.clone()
    }

    /// Returns the current epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.state.lock().unwrap().epoch
    }

    /// Begins a new lease epoch, revoking any outstanding lease.
    ///
    /// Crate-private: reachable only from the recovery coordinator's
    /// `complete` transition.
    pub(crate) fn begin_new_epoch(&self) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.epoch += 1;
        state.current = None;
        tracing::info!(epoch = state.epoch, "new lease epoch");
        state.epoch
    }

    const fn stale_error(presented: u64, current: u64) -> LeaseError {
        if presented < current {
            LeaseError::LeaseSuperseded {
                lease_id: presented,
                current_lease_id: current,
            }
        } else {
            LeaseError::UnknownLease { lease_id: presented }
        }
    }
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new()
    }
}
