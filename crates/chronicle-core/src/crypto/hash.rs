//! Blake3 hashing and hash-chain primitives.

use thiserror::Error;

/// Size of a Blake3 digest in bytes.
pub const HASH_SIZE: usize = 32;

/// Type alias for a 32-byte hash.
pub type Hash = [u8; HASH_SIZE];

/// Identifier of the hash algorithm embedded in every record.
///
/// The identifier is stored alongside each record so that a future
/// algorithm migration can distinguish old digests from new ones.
pub const HASH_ALGORITHM: &str = "b3-256";

/// Errors that can occur during hash chain operations.
#[derive(Debug, Error)]
pub enum HashChainError {
    /// The prior hash doesn't match the expected value.
    #[error("hash chain broken: expected {expected}, got {actual}")]
    ChainBroken {
        /// The expected prior hash.
        expected: String,
        /// The actual prior hash found.
        actual: String,
    },

    /// The content hash doesn't match the computed value.
    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// The expected hash.
        expected: String,
        /// The actual hash computed.
        actual: String,
    },
}

/// Hasher for ledger records.
///
/// `ChainHasher` computes content hashes over canonical record bytes and
/// verifies the chain links between sequential records.
pub struct ChainHasher;

impl ChainHasher {
    /// The published constant used as the prior hash of the genesis record.
    pub const GENESIS_PRIOR_HASH: Hash = [0u8; HASH_SIZE];

    /// Hashes canonical record bytes.
    ///
    /// The canonical bytes already embed the prior hash (see
    /// [`crate::canonical`]), so every content hash is cryptographically
    /// bound to its chain position.
    #[must_use]
    pub fn content_hash(canonical: &[u8]) -> Hash {
        *blake3::hash(canonical).as_bytes()
    }

    /// Hashes two digests into one. Used for cumulative checkpoint folding.
    #[must_use]
    pub fn fold(left: &Hash, right: &Hash) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(left);
        hasher.update(right);
        *hasher.finalize().as_bytes()
    }

    /// Verifies that recomputing the canonical bytes yields the stored hash.
    ///
    /// # Errors
    ///
    /// Returns `HashMismatch` if the computed hash doesn't match.
    pub fn verify_content(canonical: &[u8], expected_hash: &Hash) -> Result<(), HashChainError> {
        let computed = Self::content_hash(canonical);
        if computed != *expected_hash {
            return Err(HashChainError::HashMismatch {
                expected: hex::encode(expected_hash),
                actual: hex::encode(&computed),
            });
        }
        Ok(())
    }

    /// Verifies the chain link between two consecutive records.
    ///
    /// # Arguments
    ///
    /// * `current_prior_hash` - The prior hash stored in the current record
    /// * `previous_content_hash` - The content hash of the previous record
    ///
    /// # Errors
    ///
    /// Returns `ChainBroken` if the hashes don't match.
    pub fn verify_link(
        current_prior_hash: &Hash,
        previous_content_hash: &Hash,
    ) -> Result<(), HashChainError> {
        if current_prior_hash != previous_content_hash {
            return Err(HashChainError::ChainBroken {
                expected: hex::encode(previous_content_hash),
                actual: hex::encode(current_prior_hash),
            });
        }
        Ok(())
    }

    /// Verifies an entire chain of records.
    ///
    /// # Arguments
    ///
    /// * `records` - Iterator of (canonical bytes, `prior_hash`,
    ///   `content_hash`) tuples in sequence order, starting at genesis
    ///
    /// # Errors
    ///
    /// Returns an error if any hash is invalid or any chain link is broken.
    pub fn verify_chain<'a>(
        records: impl IntoIterator<Item = (&'a [u8], &'a Hash, &'a Hash)>,
    ) -> Result<(), HashChainError> {
        let mut expected_prior = Self::GENESIS_PRIOR_HASH;

        for (canonical, prior_hash, content_hash) in records {
            Self::verify_link(prior_hash, &expected_prior)?;
            Self::verify_content(canonical, content_hash)?;
            expected_prior = *content_hash;
        }

        Ok(())
    }
}

/// Utility module for hex encoding (used in error messages).
pub(crate) mod hex {
    use std::fmt::Write;

    /// Encodes bytes as a hex string.
    pub fn encode(bytes: &[u8]) -> String {
        bytes
            .iter()
            .fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
                let _ = write!(acc, "{b:02x}");
                acc
            })
    }
}
