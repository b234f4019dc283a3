//! Ed25519 signatures with domain separation.
//!
//! Every signed object in the ledger carries a unique domain prefix that is
//! prepended to the canonical message bytes before signing and verification.
//! Domain separation ensures a signature valid for one object type cannot be
//! replayed as another: a witness attestation can never pass as a writer
//! commit, a checkpoint anchor can never pass as a recovery decision.
//!
//! # Format
//!
//! ```text
//! <PREFIX> || canonical_bytes(message)
//! ```
//!
//! Where `||` denotes concatenation and the prefix is a UTF-8 string
//! terminated with a colon.

use ed25519_dalek::{Signer as _, Verifier as _};
use rand::rngs::OsRng;
use thiserror::Error;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Domain prefix for writer commit signatures over a record's content hash.
pub const RECORD_COMMIT_PREFIX: &[u8] = b"RECORD_COMMIT:";

/// Domain prefix for witness attestation signatures.
pub const WITNESS_ATTESTATION_PREFIX: &[u8] = b"WITNESS_ATTESTATION:";

/// Domain prefix for checkpoint anchor signatures.
pub const CHECKPOINT_ANCHOR_PREFIX: &[u8] = b"CHECKPOINT_ANCHOR:";

/// Domain prefix for halt declaration payloads.
pub const HALT_DECLARED_PREFIX: &[u8] = b"HALT_DECLARED:";

/// Domain prefix for recovery decision payloads.
pub const RECOVERY_DECISION_PREFIX: &[u8] = b"RECOVERY_DECISION:";

/// Errors that can occur during signing or verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SignerError {
    /// The signature failed verification.
    #[error("signature verification failed")]
    VerificationFailed,

    /// The key or signature bytes are malformed.
    #[error("malformed key material: {0}")]
    MalformedKey(String),
}

/// An Ed25519 signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// Parses a signature from its 64-byte encoding.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; SIGNATURE_SIZE]) -> Self {
        Self(ed25519_dalek::Signature::from_bytes(bytes))
    }

    /// Returns the 64-byte encoding of this signature.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.0.to_bytes()
    }
}

/// An Ed25519 verifying (public) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyingKey(ed25519_dalek::VerifyingKey);

impl VerifyingKey {
    /// Parses a verifying key from its 32-byte encoding.
    ///
    /// # Errors
    ///
    /// Returns `MalformedKey` if the bytes are not a valid curve point.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self, SignerError> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| SignerError::MalformedKey(e.to_string()))
    }

    /// Returns the 32-byte encoding of this key.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Verifies a raw (non-domain-separated) signature.
    ///
    /// # Errors
    ///
    /// Returns `VerificationFailed` if the signature does not verify.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignerError> {
        self.0
            .verify(message, &signature.0)
            .map_err(|_| SignerError::VerificationFailed)
    }
}

/// An Ed25519 signing key.
pub struct Signer {
    key: ed25519_dalek::SigningKey,
}

impl Signer {
    /// Generates a fresh keypair from the operating system RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            key: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Constructs a signer from a 32-byte secret seed.
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: ed25519_dalek::SigningKey::from_bytes(seed),
        }
    }

    /// Signs a raw message without domain separation.
    ///
    /// Prefer [`sign_with_domain`] for anything persisted.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.key.sign(message))
    }

    /// Returns the verifying key for this signer.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.key.verifying_key())
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret key is never printed.
        f.debug_struct("Signer")
            .field("verifying_key", &self.verifying_key())
            .finish()
    }
}

/// Signs `message` under the given domain prefix.
#[must_use]
pub fn sign_with_domain(signer: &Signer, prefix: &[u8], message: &[u8]) -> Signature {
    let mut domain_message = Vec::with_capacity(prefix.len() + message.len());
    domain_message.extend_from_slice(prefix);
    domain_message.extend_from_slice(message);
    signer.sign(&domain_message)
}

/// Verifies `signature` over `message` under the given domain prefix.
///
/// # Errors
///
/// Returns `VerificationFailed` if the signature does not verify under the
/// domain-separated message.
pub fn verify_with_domain(
    key: &VerifyingKey,
    prefix: &[u8],
    message: &[u8],
    signature: &Signature,
) -> Result<(), SignerError> {
    let mut domain_message = Vec::with_capacity(prefix.len() + message.len());
    domain_message.extend_from_slice(prefix);
    domain_message.extend_from_slice(message);
    key.verify(&domain_message, signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let signer = Signer::generate();
        let sig = sign_with_domain(&signer, RECORD_COMMIT_PREFIX, b"content hash");

        verify_with_domain(
            &signer.verifying_key(),
            RECORD_COMMIT_PREFIX,
            b"content hash",
            &sig,
        )
        .unwrap();
    }

    #[test]
    fn wrong_key_fails() {
        let signer = Signer::generate();
        let other = Signer::generate();
        let sig = sign_with_domain(&signer, RECORD_COMMIT_PREFIX, b"content hash");

        assert_eq!(
            verify_with_domain(
                &other.verifying_key(),
                RECORD_COMMIT_PREFIX,
                b"content hash",
                &sig
            ),
            Err(SignerError::VerificationFailed)
        );
    }

    #[test]
    fn domain_separation_prevents_cross_type_replay() {
        let signer = Signer::generate();
        let sig = sign_with_domain(&signer, WITNESS_ATTESTATION_PREFIX, b"content hash");

        // The same bytes under a different domain must not verify.
        assert_eq!(
            verify_with_domain(
                &signer.verifying_key(),
                RECORD_COMMIT_PREFIX,
                b"content hash",
                &sig
            ),
            Err(SignerError::VerificationFailed)
        );
    }

    #[test]
    fn signature_bytes_roundtrip() {
        let signer = Signer::generate();
        let sig = signer.sign(b"message");
        let restored = Signature::from_bytes(&sig.to_bytes());

        signer.verifying_key().verify(b"message", &restored).unwrap();
    }

    #[test]
    fn verifying_key_bytes_roundtrip() {
        let signer = Signer::generate();
        let key = signer.verifying_key();
        let restored = VerifyingKey::from_bytes(&key.to_bytes()).unwrap();

        assert_eq!(key, restored);
    }

    #[test]
    fn from_seed_is_deterministic() {
        let a = Signer::from_seed(&[7u8; 32]);
        let b = Signer::from_seed(&[7u8; 32]);

        assert_eq!(a.verifying_key(), b.verifying_key());
    }
}
