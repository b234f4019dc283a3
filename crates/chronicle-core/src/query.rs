//! Public query interface.
//!
//! Queries are unauthenticated and rate-limited identically for anonymous
//! and registered callers — the caller identity is only a rate-limiting
//! key, never a privilege level. Range reads use keyset continuation on
//! sequence (never offset pagination), "as of sequence N" views carry an
//! inclusion proof tied to a signed commitment at the current head, and a
//! halt feed is exposed for poll and push consumption.
//!
//! Read paths function fully during a halt: every page carries a `halted`
//! indicator so collaborators can gate their own writes, but historical
//! data — including both branches of a detected fork — remains readable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::watch;

use crate::checkpoint::{CheckpointAnchor, CheckpointError, CheckpointService, InclusionProof};
use crate::halt::{HaltError, HaltState, HaltStatus, HaltTransport};
use crate::record::Record;
use crate::store::{LedgerStore, StoreError};
use crate::time::{SystemClock, TimeSource};

/// Default request allowance per window.
pub const DEFAULT_MAX_REQUESTS: u32 = 60;

/// Default sliding-window size in milliseconds.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Hard cap on the number of distinct callers tracked by the limiter.
pub const DEFAULT_MAX_TRACKED_CALLERS: usize = 10_000;

/// Maximum page size; larger requests are clamped.
pub const MAX_PAGE_SIZE: u64 = 1_000;

/// Rate limiter configuration. One policy for everyone.
#[derive(Debug, Clone)]
pub struct QueryRateConfig {
    /// Requests allowed per caller per window.
    pub max_requests: u32,

    /// Sliding window size in milliseconds.
    pub window_ms: u64,

    /// How often to sweep expired entries (every N requests).
    pub cleanup_every: u64,

    /// Hard cap on tracked callers (memory exhaustion bound).
    pub max_tracked_callers: usize,
}

impl Default for QueryRateConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window_ms: DEFAULT_WINDOW_MS,
            cleanup_every: 100,
            max_tracked_callers: DEFAULT_MAX_TRACKED_CALLERS,
        }
    }
}

/// Errors from the query interface.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryError {
    /// The caller exceeded the rate limit.
    #[error("rate limit exceeded for caller {caller}")]
    RateLimited {
        /// The limited caller key.
        caller: String,
    },

    /// No record exists with the requested sequence.
    #[error("record not found: sequence={sequence}")]
    NotFound {
        /// The missing sequence.
        sequence: u64,
    },

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// Proof construction failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The halt transport failed.
    #[error(transparent)]
    Halt(#[from] HaltError),
}

/// One page of query results with keyset continuation.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// The records in this page, ascending by sequence.
    pub items: Vec<T>,

    /// Cursor for the next page (`None` when exhausted). Pass back as
    /// `after` to continue.
    pub next_cursor: Option<u64>,

    /// Whether the ledger was halted when this page was served.
    pub halted: bool,
}

/// An "as of sequence N" historical view with its inclusion proof.
#[derive(Debug, Clone)]
pub struct AsOfView {
    /// The record at the requested sequence.
    pub record: Record,

    /// Proof folding the record into `head_commitment`.
    pub proof: InclusionProof,

    /// Signed commitment at the head the server answered from.
    pub head_commitment: CheckpointAnchor,

    /// Whether the ledger was halted when this view was served.
    pub halted: bool,
}

/// Sliding-window rate limiter keyed by caller identity.
///
/// Anonymous and registered callers share one policy; the key is only used
/// to bucket requests.
struct RateLimiter {
    config: QueryRateConfig,
    state: RwLock<HashMap<String, Vec<u64>>>,
    request_count: AtomicU64,
}

impl RateLimiter {
    fn new(config: QueryRateConfig) -> Self {
        Self {
            config,
            state: RwLock::new(HashMap::new()),
            request_count: AtomicU64::new(0),
        }
    }

    fn check(&self, caller: &str, now_ms: u64) -> Result<(), QueryError> {
        let count = self.request_count.fetch_add(1, Ordering::Relaxed);
        if count % self.config.cleanup_every == 0 {
            self.cleanup(now_ms);
        }

        let mut state = self.state.write().unwrap();
        let window_start = now_ms.saturating_sub(self.config.window_ms);

        if !state.contains_key(caller) && state.len() >= self.config.max_tracked_callers {
            drop(state);
            self.cleanup(now_ms);
            state = self.state.write().unwrap();
            if !state.contains_key(caller) && state.len() >= self.config.max_tracked_callers {
                tracing::warn!(caller, "rate limiter at caller capacity; rejecting");
                return Err(QueryError::RateLimited {
                    caller: caller.to_string(),
                });
            }
        }

        let timestamps = state.entry(caller.to_string()).or_default();
        timestamps.retain(|&t| t > window_start);
        if timestamps.len() as u64 >= u64::from(self.config.max_requests) {
            return Err(QueryError::RateLimited {
                caller: caller.to_string(),
            });
        }
        timestamps.push(now_ms);
        Ok(())
    }

    fn cleanup(&self, now_ms: u64) {
        let window_start = now_ms.saturating_sub(self.config.window_ms);
        let mut state = self.state.write().unwrap();
        state.retain(|_, timestamps| {
            timestamps.retain(|&t| t > window_start);
            !timestamps.is_empty()
        });
    }
}

/// The public, read-only query service.
pub struct QueryService {
    store: Arc<LedgerStore>,
    halt: Arc<HaltTransport>,
    checkpoints: Arc<CheckpointService>,
    limiter: RateLimiter,
    clock: Arc<dyn TimeSource>,
}

impl QueryService {
    /// Creates a query service.
    #[must_use]
    pub fn new(
        store: Arc<LedgerStore>,
        halt: Arc<HaltTransport>,
        checkpoints: Arc<CheckpointService>,
        rate: QueryRateConfig,
    ) -> Self {
        Self {
            store,
            halt,
            checkpoints,
            limiter: RateLimiter::new(rate),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock. Used by tests to pin time.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Range query by sequence with keyset continuation.
    ///
    /// # Errors
    ///
    /// See [`QueryError`].
    pub fn records_by_sequence(
        &self,
        caller: &str,
        after: Option<u64>,
        limit: u64,
    ) -> Result<Page<Record>, QueryError> {
        let now_ms = self.clock.now_ms();
        self.limiter.check(caller, now_ms)?;

        let limit = limit.min(MAX_PAGE_SIZE);
        let items = self.store.read_after(after.unwrap_or(0), limit)?;
        Ok(self.page(items, limit, now_ms)?)
    }

    /// Range query by local-time window with keyset continuation.
    ///
    /// # Errors
    ///
    /// See [`QueryError`].
    pub fn records_by_time(
        &self,
        caller: &str,
        start_ms: u64,
        end_ms: u64,
        after: Option<u64>,
        limit: u64,
    ) -> Result<Page<Record>, QueryError> {
        let now_ms = self.clock.now_ms();
        self.limiter.check(caller, now_ms)?;

        let limit = limit.min(MAX_PAGE_SIZE);
        let items = self
            .store
            .read_time_window(start_ms, end_ms, after.unwrap_or(0), limit)?;
        Ok(self.page(items, limit, now_ms)?)
    }

    /// Point lookup by sequence.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown sequence.
    pub fn record(&self, caller: &str, sequence: u64) -> Result<Record, QueryError> {
        self.limiter.check(caller, self.clock.now_ms())?;
        self.store.read_one(sequence).map_err(|e| match e {
            StoreError::RecordNotFound { sequence } => QueryError::NotFound { sequence },
            other => QueryError::Storage(other),
        })
    }

    /// "As of sequence N" historical view: the record plus an inclusion
    /// proof tying it to a signed commitment at the current head.
    ///
    /// # Errors
    ///
    /// See [`QueryError`].
    pub fn as_of(&self, caller: &str, sequence: u64) -> Result<AsOfView, QueryError> {
        let now_ms = self.clock.now_ms();
        self.limiter.check(caller, now_ms)?;

        let record = self.store.read_one(sequence).map_err(|e| match e {
            StoreError::RecordNotFound { sequence } => QueryError::NotFound { sequence },
            other => QueryError::Storage(other),
        })?;
        let head_commitment = self.checkpoints.head_commitment(now_ms)?;
        let proof = self
            .checkpoints
            .prove_against(sequence, head_commitment.clone())?;
        let halted = self.halt.status(now_ms)?.halted;

        Ok(AsOfView {
            record,
            proof,
            head_commitment,
            halted,
        })
    }

    /// Inclusion proof for a record relative to the nearest stored anchor.
    ///
    /// # Errors
    ///
    /// See [`QueryError`].
    pub fn prove_inclusion(&self, caller: &str, sequence: u64) -> Result<InclusionProof, QueryError> {
        self.limiter.check(caller, self.clock.now_ms())?;
        Ok(self.checkpoints.prove_inclusion(sequence)?)
    }

    /// Poll interface for the halt-state feed.
    ///
    /// # Errors
    ///
    /// See [`QueryError`].
    pub fn halt_status(&self, caller: &str) -> Result<HaltStatus, QueryError> {
        let now_ms = self.clock.now_ms();
        self.limiter.check(caller, now_ms)?;
        Ok(self.halt.status(now_ms)?)
    }

    /// Push interface for the halt-state feed.
    #[must_use]
    pub fn subscribe_halt(&self) -> watch::Receiver<HaltState> {
        self.halt.subscribe()
    }

    fn page(&self, items: Vec<Record>, limit: u64, now_ms: u64) -> Result<Page<Record>, HaltError> {
        let next_cursor = if items.len() as u64 == limit {
            items.last().map(|r| r.sequence)
        } else {
            None
        };
        let halted = self.halt.status(now_ms)?.halted;
        Ok(Page {
            items,
            next_cursor,
            halted,
        })
    }
}
