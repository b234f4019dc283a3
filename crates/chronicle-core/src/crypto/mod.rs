//! Cryptographic primitives for the ledger core.
//!
//! - **Blake3 hashing**: content hashing and hash-chain linking
//! - **Ed25519 signatures**: writer, witness, checkpoint, and recovery
//!   signatures, all domain-separated
//!
//! Each record's content hash is computed over its canonical byte encoding
//! (which embeds the prior hash), so every record is cryptographically bound
//! to its chain position. Tampering with any historical record breaks the
//! chain.

mod hash;
mod sign;

pub use hash::{ChainHasher, HASH_ALGORITHM, HASH_SIZE, Hash, HashChainError};
pub(crate) use hash::hex;
pub use sign::{
    CHECKPOINT_ANCHOR_PREFIX, HALT_DECLARED_PREFIX, PUBLIC_KEY_SIZE, RECORD_COMMIT_PREFIX,
    RECOVERY_DECISION_PREFIX, SIGNATURE_SIZE, Signature, Signer, SignerError, VerifyingKey,
    WITNESS_ATTESTATION_PREFIX, sign_with_domain, verify_with_domain,
};
