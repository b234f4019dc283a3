//! Witness coordination: accountable co-signing of every record.
//!
//! A witness is a required co-signer, not a passive audit trail. The writer
//! obtains an attestation before the commit transaction, and the commit
//! carries both signatures or does not happen at all — no record is ever
//! durable without its witness.
//!
//! # Selection
//!
//! The witness for a given append is selected with randomness seeded from
//! `blake3(chain_head_hash || external_entropy || writer_id)`. Folding in
//! the chain head ties the choice to the current ledger state; folding in
//! external entropy keeps the selection unpredictable, so a writer cannot
//! grind candidate payloads toward a preferred witness.
//!
//! # Pair reuse
//!
//! The same (writer, witness) pair may not repeat within a rolling 24-hour
//! window. When every live witness is excluded by the window, attestation
//! fails with an exhaustion error rather than silently reusing a pair.
//!
//! # Degraded mode
//!
//! A minimum live pool size gates high-stakes record types. Below the
//! minimum, only low-stakes types proceed and [`WitnessCoordinator::availability`]
//! reports the degradation — an observable state, never a hidden one.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};
use thiserror::Error;

use crate::catalog::StakesClass;
use crate::crypto::{
    Hash, SIGNATURE_SIZE, Signer, VerifyingKey, WITNESS_ATTESTATION_PREFIX, sign_with_domain,
};

/// Floor for the configurable high-stakes pool minimum.
pub const MIN_HIGH_STAKES_POOL_FLOOR: usize = 2;

/// Default rolling window in which a (writer, witness) pair may not repeat.
pub const DEFAULT_PAIR_REUSE_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Default bound on a single attestation attempt.
pub const DEFAULT_ATTEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Witness coordinator configuration.
#[derive(Debug, Clone)]
pub struct WitnessConfig {
    /// Minimum live witnesses required for high-stakes record types.
    ///
    /// Floor-enforced: values below [`MIN_HIGH_STAKES_POOL_FLOOR`] are
    /// rejected by `CoreConfig::validate`.
    pub min_high_stakes_pool: usize,

    /// Rolling window in which a (writer, witness) pair may not repeat.
    pub pair_reuse_window_ms: u64,

    /// Bound on a single attestation attempt. Timeout is reported as
    /// witness unavailability, never as success.
    pub attest_timeout: Duration,
}

impl Default for WitnessConfig {
    fn default() -> Self {
        Self {
            min_high_stakes_pool: MIN_HIGH_STAKES_POOL_FLOOR,
            pair_reuse_window_ms: DEFAULT_PAIR_REUSE_WINDOW_MS,
            attest_timeout: DEFAULT_ATTEST_TIMEOUT,
        }
    }
}

/// Errors from the attestation path.
///
/// Every variant means the append must abort with no partial state; all are
/// retryable once the pool recovers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WitnessError {
    /// No witnesses are registered.
    #[error("no witness available: pool is empty")]
    EmptyPool,

    /// The live pool is below the minimum required for high-stakes types.
    #[error("no witness available for high-stakes record: pool {live} below minimum {required}")]
    PoolBelowMinimum {
        /// Live witness count.
        live: usize,
        /// Required minimum.
        required: usize,
    },

    /// Every live witness is excluded by the pair-reuse window.
    #[error("no witness available: all pairs for writer {writer_id} used within {window_ms} ms")]
    AllPairsExhausted {
        /// The writer whose pairs are exhausted.
        writer_id: String,
        /// The rolling window.
        window_ms: u64,
    },

    /// The selected witness did not answer within the bound.
    #[error("no witness available: {witness_id} timed out after {timeout_ms} ms")]
    Timeout {
        /// The witness that timed out.
        witness_id: String,
        /// The timeout applied.
        timeout_ms: u64,
    },

    /// The selected witness refused or failed to sign.
    #[error("no witness available: {witness_id} failed to sign: {details}")]
    SigningFailed {
        /// The witness that failed.
        witness_id: String,
        /// Failure details.
        details: String,
    },
}

/// A witness attestation over a record's content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    /// The attesting witness.
    pub witness_id: String,

    /// Domain-separated signature over the content hash.
    pub signature: [u8; SIGNATURE_SIZE],
}

/// Observable pool availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WitnessAvailability {
    /// The pool meets the high-stakes minimum.
    Normal {
        /// Live witness count.
        live: usize,
    },
    /// The pool is below the high-stakes minimum; only low-stakes record
    /// types may proceed.
    Degraded {
        /// Live witness count.
        live: usize,
        /// Required minimum.
        required: usize,
    },
}

/// A witness that can co-sign content hashes.
///
/// Implementations may be in-process keys or proxies to remote attesters;
/// the coordinator bounds every call with a timeout either way.
pub trait WitnessSigner: Send + Sync {
    /// Stable identity of this witness.
    fn witness_id(&self) -> &str;

    /// The witness's verifying key.
    fn verifying_key(&self) -> VerifyingKey;

    /// Signs the content hash under the attestation domain.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason on refusal or failure.
    fn attest(&self, content_hash: &Hash) -> Result<[u8; SIGNATURE_SIZE], String>;
}

/// An in-process witness backed by a local signing key.
pub struct LocalWitness {
    id: String,
    signer: Signer,
}

impl LocalWitness {
    /// Creates a local witness with a fresh keypair.
    #[must_use]
    pub fn generate(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            signer: Signer::generate(),
        }
    }
}

impl WitnessSigner for LocalWitness {
    fn witness_id(&self) -> &str {
        &self.id
    }

    fn verifying_key(&self) -> VerifyingKey {
        self.signer.verifying_key()
    }

    fn attest(&self, content_hash: &Hash) -> Result<[u8; SIGNATURE_SIZE], String> {
        Ok(sign_with_domain(&self.signer, WITNESS_ATTESTATION_PREFIX, content_hash).to_bytes())
    }
}

/// Source of external entropy for witness selection.
pub trait EntropySource: Send + Sync {
    /// Draws 32 bytes of entropy.
    fn draw(&self) -> [u8; 32];
}

/// Operating-system entropy.
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn draw(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }
}

#[derive(Debug, Clone)]
struct PairUse {
    writer_id: String,
    witness_id: String,
    used_at_ms: u64,
}

/// Selects witnesses and collects attestations.
pub struct WitnessCoordinator {
    pool: RwLock<Vec<Arc<dyn WitnessSigner>>>,
    entropy: Box<dyn EntropySource>,
    config: WitnessConfig,
    recent_pairs: Mutex<VecDeque<PairUse>>,
}

impl WitnessCoordinator {
    /// Creates a coordinator with OS entropy.
    #[must_use]
    pub fn new(config: WitnessConfig) -> Self {
        Self::with_entropy(config, Box::new(OsEntropy))
    }

    /// Creates a coordinator with a custom entropy source.
    #[must_use]
    pub fn with_entropy(config: WitnessConfig, entropy: Box<dyn EntropySource>) -> Self {
        Self {
            pool: RwLock::new(Vec::new()),
            entropy,
            config,
            recent_pairs: Mutex::new(VecDeque::new()),
        }
    }

    /// Registers a witness in the live pool.
    pub fn register(&self, witness: Arc<dyn WitnessSigner>) {
        let mut pool = self.pool.write().unwrap();
        if !pool.iter().any(|w| w.witness_id() == witness.witness_id()) {
            tracing::info!(witness_id = witness.witness_id(), "witness registered");
            pool.push(witness);
        }
    }

    /// Removes a witness from the live pool.
    pub fn deregister(&self, witness_id: &str) {
        let mut pool = self.pool.write().unwrap();
        pool.retain(|w| w.witness_id() != witness_id);
        tracing::info!(witness_id, "witness deregistered");
    }

    /// Returns the verifying key of a pooled witness, if present.
    #[must_use]
    pub fn verifying_key_of(&self, witness_id: &str) -> Option<VerifyingKey> {
        self.pool
            .read()
            .unwrap()
            .iter()
            .find(|w| w.witness_id() == witness_id)
            .map(|w| w.verifying_key())
    }

    /// Reports the observable availability of the pool.
    #[must_use]
    pub fn availability(&self) -> WitnessAvailability {
        let live = self.pool.read().unwrap().len();
        if live < self.config.min_high_stakes_pool {
            WitnessAvailability::Degraded {
                live,
                required: self.config.min_high_stakes_pool,
            }
        } else {
            WitnessAvailability::Normal { live }
        }
    }

    /// Selects a witness and collects an attestation over `content_hash`.
    ///
    /// # Errors
    ///
    /// Every error leaves no partial state; see [`WitnessError`].
    pub fn attest(
        &self,
        head_hash: &Hash,
        content_hash: &Hash,
        stakes: StakesClass,
        writer_id: &str,
        now_ms: u64,
    ) -> Result<Attestation, WitnessError> {
        self.prune_pairs(now_ms);

        let pool: Vec<Arc<dyn WitnessSigner>> = self.pool.read().unwrap().clone();
        if pool.is_empty() {
            return Err(WitnessError::EmptyPool);
        }
        if stakes == StakesClass::High && pool.len() < self.config.min_high_stakes_pool {
            tracing::warn!(
                live = pool.len(),
                required = self.config.min_high_stakes_pool,
                "witness pool degraded; high-stakes record refused"
            );
            return Err(WitnessError::PoolBelowMinimum {
                live: pool.len(),
                required: self.config.min_high_stakes_pool,
            });
        }

        let eligible: Vec<Arc<dyn WitnessSigner>> = {
            let recent = self.recent_pairs.lock().unwrap();
            pool.into_iter()
                .filter(|w| {
                    !recent.iter().any(|p| {
                        p.writer_id == writer_id && p.witness_id == w.witness_id()
                    })
                })
                .collect()
        };
        if eligible.is_empty() {
            return Err(WitnessError::AllPairsExhausted {
                writer_id: writer_id.to_string(),
                window_ms: self.config.pair_reuse_window_ms,
            });
        }

        let chosen = Arc::clone(&eligible[self.select_index(head_hash, writer_id, eligible.len())]);
        let witness_id = chosen.witness_id().to_string();
        let signature = self.attest_with_timeout(&chosen, content_hash)?;

        self.recent_pairs.lock().unwrap().push_back(PairUse {
            writer_id: writer_id.to_string(),
            witness_id: witness_id.clone(),
            used_at_ms: now_ms,
        });

        tracing::debug!(witness_id = %witness_id, "attestation collected");
        Ok(Attestation {
            witness_id,
            signature,
        })
    }

    /// Derives the selection index from the chain head, external entropy,
    /// and the writer identity.
    fn select_index(&self, head_hash: &Hash, writer_id: &str, len: usize) -> usize {
        let mut hasher = blake3::Hasher::new();
        hasher.update(head_hash);
        hasher.update(&self.entropy.draw());
        hasher.update(writer_id.as_bytes());
        let seed = *hasher.finalize().as_bytes();

        let mut rng = StdRng::from_seed(seed);
        rng.gen_range(0..len)
    }

    /// Runs the attestation on a worker thread bounded by the configured
    /// timeout. A hung witness is abandoned; its late answer is discarded.
    fn attest_with_timeout(
        &self,
        witness: &Arc<dyn WitnessSigner>,
        content_hash: &Hash,
    ) -> Result<[u8; SIGNATURE_SIZE], WitnessError> {
        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(witness);
        let hash = *content_hash;
        std::thread::spawn(move || {
            let _ = tx.send(worker.attest(&hash));
        });

        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = self.config.attest_timeout.as_millis() as u64;
        match rx.recv_timeout(self.config.attest_timeout) {
            Ok(Ok(signature)) => Ok(signature),
            Ok(Err(details)) => Err(WitnessError::SigningFailed {
                witness_id: witness.witness_id().to_string(),
                details,
            }),
            Err(_) => Err(WitnessError::Timeout {
                witness_id: witness.witness_id().to_string(),
                timeout_ms,
            }),
        }
    }

    fn prune_pairs(&self, now_ms: u64) {
        let mut recent = self.recent_pairs.lock().unwrap();
        let window = self.config.pair_reuse_window_ms;
        while let Some(front) = recent.front() {
            if front.used_at_ms + window <= now_ms {
                recent.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEntropy(u8);

    impl EntropySource for FixedEntropy {
        fn draw(&self) -> [u8; 32] {
            [self.0; 32]
        }
    }

    struct SlowWitness {
        id: String,
        delay: Duration,
    }

    impl WitnessSigner for SlowWitness {
        fn witness_id(&self) -> &str {
            &self.id
        }

        fn verifying_key(&self) -> VerifyingKey {
            Signer::generate().verifying_key()
        }

        fn attest(&self, _content_hash: &Hash) -> Result<[u8; SIGNATURE_SIZE], String> {
            std::thread::sleep(self.delay);
            Ok([0u8; SIGNATURE_SIZE])
        }
    }

    fn coordinator_with(n: usize, config: WitnessConfig) -> WitnessCoordinator {
        let coordinator = WitnessCoordinator::with_entropy(config, Box::new(FixedEntropy(7)));
        for i in 0..n {
            coordinator.register(Arc::new(LocalWitness::generate(format!("witness-{i}"))));
        }
        coordinator
    }

    #[test]
    fn attestation_verifies_over_content_hash() {
        let coordinator = coordinator_with(3, WitnessConfig::default());
        let head = [1u8; 32];
        let content = [2u8; 32];

        let attestation = coordinator
            .attest(&head, &content, StakesClass::Low, "writer-1", 0)
            .unwrap();

        let key = coordinator.verifying_key_of(&attestation.witness_id).unwrap();
        let signature = crate::crypto::Signature::from_bytes(&attestation.signature);
        crate::crypto::verify_with_domain(&key, WITNESS_ATTESTATION_PREFIX, &content, &signature)
            .unwrap();
    }

    #[test]
    fn empty_pool_is_unavailable() {
        let coordinator = coordinator_with(0, WitnessConfig::default());
        assert_eq!(
            coordinator.attest(&[0u8; 32], &[1u8; 32], StakesClass::Low, "w", 0),
            Err(WitnessError::EmptyPool)
        );
    }

    #[test]
    fn high_stakes_gated_by_pool_minimum() {
        let coordinator = coordinator_with(1, WitnessConfig::default());

        assert!(matches!(
            coordinator.attest(&[0u8; 32], &[1u8; 32], StakesClass::High, "w", 0),
            Err(WitnessError::PoolBelowMinimum { live: 1, required: 2 })
        ));
        // Low-stakes still proceeds in degraded mode.
        coordinator
            .attest(&[0u8; 32], &[1u8; 32], StakesClass::Low, "w", 0)
            .unwrap();
        assert_eq!(
            coordinator.availability(),
            WitnessAvailability::Degraded { live: 1, required: 2 }
        );
    }

    #[test]
    fn pair_does_not_repeat_within_window() {
        let coordinator = coordinator_with(2, WitnessConfig::default());
        let head = [0u8; 32];

        let first = coordinator
            .attest(&head, &[1u8; 32], StakesClass::Low, "writer-1", 0)
            .unwrap();
        let second = coordinator
            .attest(&head, &[2u8; 32], StakesClass::Low, "writer-1", 1)
            .unwrap();
        assert_ne!(first.witness_id, second.witness_id);

        // Both pairs are now used; the third attempt inside the window fails.
        assert!(matches!(
            coordinator.attest(&head, &[3u8; 32], StakesClass::Low, "writer-1", 2),
            Err(WitnessError::AllPairsExhausted { .. })
        ));

        // Another writer is unaffected.
        coordinator
            .attest(&head, &[4u8; 32], StakesClass::Low, "writer-2", 2)
            .unwrap();
    }

    #[test]
    fn pairs_expire_after_the_window() {
        let config = WitnessConfig {
            pair_reuse_window_ms: 1_000,
            ..WitnessConfig::default()
        };
        let coordinator = coordinator_with(1, config);
        let head = [0u8; 32];

        coordinator
            .attest(&head, &[1u8; 32], StakesClass::Low, "writer-1", 0)
            .unwrap();
        assert!(matches!(
            coordinator.attest(&head, &[2u8; 32], StakesClass::Low, "writer-1", 500),
            Err(WitnessError::AllPairsExhausted { .. })
        ));

        // Window elapsed: the pair is usable again.
        coordinator
            .attest(&head, &[3u8; 32], StakesClass::Low, "writer-1", 1_000)
            .unwrap();
    }

    #[test]
    fn timeout_is_unavailability_not_success() {
        let config = WitnessConfig {
            attest_timeout: Duration::from_millis(20),
            ..WitnessConfig::default()
        };
        let coordinator = WitnessCoordinator::with_entropy(config, Box::new(FixedEntropy(1)));
        coordinator.register(Arc::new(SlowWitness {
            id: "slow".to_string(),
            delay: Duration::from_millis(500),
        }));

        assert!(matches!(
            coordinator.attest(&[0u8; 32], &[1u8; 32], StakesClass::Low, "w", 0),
            Err(WitnessError::Timeout { .. })
        ));
    }

    #[test]
    fn selection_is_deterministic_given_head_and_entropy() {
        let a = coordinator_with(8, WitnessConfig::default());
        let b = coordinator_with(8, WitnessConfig::default());
        let head = [5u8; 32];

        let chosen_a = a
            .attest(&head, &[1u8; 32], StakesClass::Low, "writer-1", 0)
            .unwrap();
        let chosen_b = b
            .attest(&head, &[1u8; 32], StakesClass::Low, "writer-1", 0)
            .unwrap();
        assert_eq!(chosen_a.witness_id, chosen_b.witness_id);
    }

    #[test]
    fn deregistered_witness_is_never_selected() {
        let coordinator = coordinator_with(2, WitnessConfig::default());
        coordinator.deregister("witness-0");

        for i in 0..3u8 {
            // With only witness-1 live and fresh writers, selection must
            // always land on it.
            let attestation = coordinator
                .attest(&[i; 32], &[1u8; 32], StakesClass::Low, &format!("w{i}"), 0)
                .unwrap();
            assert_eq!(attestation.witness_id, "witness-1");
        }
    }
}
